// src/pages.rs
//! Dynamically rendered HTML. Static pages live under the document root;
//! everything that depends on the session or on upload state is built
//! here around a shared page shell.

use crate::http::{ext_of, html_escape, is_image_ext, is_video_ext};
use crate::uploads::UploadItem;
use chrono::{Local, TimeZone};

/// Wrap a body fragment in the site chrome.
pub fn page_shell(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<link rel="icon" href="/assets/media/favicon.ico">
<link rel="stylesheet" href="/assets/css/site.css">
<title>WebServer | {title}</title>
</head>
<body>
<div class="page">
<div class="nav">
<div class="brand">WebServer</div>
<div class="nav-links">
<a href="/">Home</a>
<a href="/uploads/list">My uploads</a>
<a href="/pages/status.html">Status</a>
</div>
<div class="nav-auth">
<a class="btn ghost" href="/pages/log.html">Log in</a>
<a class="btn primary" href="/pages/register.html">Register</a>
</div>
</div>
{body}</div>
<script src="/assets/js/nav-auth.js"></script>
</body>
</html>"#
    )
}

fn format_time(timestamp: i64) -> String {
    if timestamp <= 0 {
        return "-".to_string();
    }
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M").to_string(),
        None => "-".to_string(),
    }
}

pub fn welcome_page(username: &str) -> String {
    let body = format!(
        r#"<section class="hero">
<div>
<h1>Welcome back, {}</h1>
<p>This is your personal space: galleries, videos, the upload center and live status.</p>
<div class="actions">
<a class="btn primary" href="/uploads/list">My uploads</a>
<a class="btn ghost" href="/pages/upload.html">Upload a file</a>
</div>
</div>
<div class="panel">
<h3>What this server does</h3>
<p style="margin-top: 12px; color: var(--muted);">Static assets, per-user isolated uploads, media display, JSON status and server-side scripts.</p>
</div>
</section>"#,
        html_escape(username)
    );
    page_shell("Welcome", &body)
}

pub fn login_required_page() -> String {
    page_shell(
        "Login required",
        r#"<section class="panel" style="max-width: 620px; margin: 0 auto;">
<h2 style="font-size: 24px;">Please log in first</h2>
<p style="margin-top: 8px; color: var(--muted);">This feature is only available to signed-in users.</p>
<div class="actions" style="margin-top: 16px;">
<a class="btn primary" href="/pages/log.html">Go to login</a>
<a class="btn ghost" href="/pages/register.html">Create an account</a>
</div>
</section>"#,
    )
}

pub fn logout_page() -> String {
    page_shell(
        "Logged out",
        r#"<section class="panel" style="max-width: 620px; margin: 0 auto;">
<h2 style="font-size: 24px;">You have been logged out</h2>
<p style="margin-top: 8px; color: var(--muted);">Your session is closed; you can sign in again at any time.</p>
<div class="actions" style="margin-top: 16px;">
<a class="btn primary" href="/pages/log.html">Go to login</a>
</div>
</section>"#,
    )
}

pub fn oversize_page() -> String {
    page_shell(
        "Request too large",
        r#"<section class="panel" style="max-width: 620px; margin: 0 auto;">
<h2 style="font-size: 24px;">Upload failed</h2>
<p style="margin-top: 8px; color: var(--muted);">The request body exceeds the server limit. Please shrink the file and try again.</p>
<div class="actions" style="margin-top: 16px;">
<a class="btn primary" href="/pages/upload.html">Back to uploads</a>
</div>
</section>"#,
    )
}

pub fn upload_failure_page(message: &str) -> String {
    let body = format!(
        r#"<section class="panel" style="max-width: 620px; margin: 0 auto;">
<h2 style="font-size: 24px;">Upload failed</h2>
<p style="margin-top: 8px; color: var(--muted);">{message}</p>
<div class="actions" style="margin-top: 16px;">
<a class="btn primary" href="/pages/upload.html">Back to uploads</a>
</div>
</section>"#
    );
    page_shell("Upload failed", &body)
}

pub fn upload_success_page(original_name: &str, stored_name: &str, size: usize) -> String {
    let url = format!("/uploads/{}", stored_name);
    let body = format!(
        r#"<section class="panel" style="max-width: 820px; margin: 0 auto;">
<h2 style="font-size: 26px;">Upload complete</h2>
<p style="margin-top: 8px; color: var(--muted);">The file is stored and visible only to you.</p>
<div class="grid" style="margin-top: 18px;">
<div class="card"><h3>File name</h3><p>{name}</p></div>
<div class="card"><h3>Location</h3><p><a href="{url}">{url}</a></p></div>
<div class="card"><h3>Size (bytes)</h3><p>{size}</p></div>
</div>
<div class="actions" style="margin-top: 20px;">
<a class="btn primary" href="{url}">View now</a>
<a class="btn ghost" href="/pages/upload.html">Upload more</a>
</div>
</section>"#,
        name = html_escape(original_name),
        url = url,
        size = size,
    );
    page_shell("Upload complete", &body)
}

pub fn upload_list_page(items: &[UploadItem]) -> String {
    let mut body = String::from(
        r#"<section class="panel" style="max-width: 980px; margin: 0 auto;">
<h2 style="font-size: 26px;">My uploads</h2>
<p style="margin-top: 8px; color: var(--muted);">Everything below is visible to your account only.</p>"#,
    );

    if items.is_empty() {
        body.push_str(r#"<p style="margin-top: 16px;">Nothing here yet; upload something first.</p>"#);
    } else {
        body.push_str(r#"<div class="grid" style="margin-top: 18px;">"#);
        for item in items {
            let url = format!("/uploads/{}", item.stored_name);
            let ext = ext_of(&item.stored_name);
            body.push_str(r#"<div class="card">"#);
            if is_image_ext(&ext) {
                body.push_str(&format!(
                    r#"<img src="{}" alt="{}" style="width:100%; border-radius: 18px; margin-bottom: 12px;">"#,
                    url,
                    html_escape(&item.original_name)
                ));
            } else if is_video_ext(&ext) {
                body.push_str(&format!(
                    r#"<video src="{}" controls preload="metadata" style="width:100%; border-radius: 18px; margin-bottom: 12px;"></video>"#,
                    url
                ));
            }
            body.push_str(&format!(
                r#"<h3>{name}</h3><p style="margin-top: 8px;">Uploaded: {time}</p><p>Size: {size} bytes</p>
<a href="{url}" class="btn ghost" style="margin-top: 12px; display: inline-flex;">View</a>
<form action="/uploads/delete" method="post" style="margin-top: 10px;">
<input type="hidden" name="file" value="{stored}">
<button class="btn ghost" type="submit">Delete</button>
</form></div>"#,
                name = html_escape(&item.original_name),
                time = format_time(item.timestamp),
                size = item.size,
                url = url,
                stored = html_escape(&item.stored_name),
            ));
        }
        body.push_str("</div>");
    }

    body.push_str(
        r#"<div class="actions" style="margin-top: 20px;">
<a class="btn primary" href="/pages/upload.html">Upload more</a>
</div>
</section>"#,
    );
    page_shell("My uploads", &body)
}

pub fn delete_failure_page(message: &str) -> String {
    let body = format!(
        r#"<section class="panel" style="max-width: 620px; margin: 0 auto;">
<h2 style="font-size: 24px;">Delete failed</h2>
<p style="margin-top: 8px; color: var(--muted);">{message}</p>
<div class="actions" style="margin-top: 16px;">
<a class="btn primary" href="/uploads/list">Back to my uploads</a>
<a class="btn ghost" href="/pages/upload.html">Upload a file</a>
</div>
</section>"#
    );
    page_shell("Delete failed", &body)
}

pub fn delete_success_page() -> String {
    page_shell(
        "Deleted",
        r#"<section class="panel" style="max-width: 620px; margin: 0 auto;">
<h2 style="font-size: 24px;">Delete complete</h2>
<p style="margin-top: 8px; color: var(--muted);">The file has been removed.</p>
<div class="actions" style="margin-top: 16px;">
<a class="btn primary" href="/uploads/list">Back to my uploads</a>
<a class="btn ghost" href="/pages/upload.html">Upload a file</a>
</div>
</section>"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_wraps_title_and_body() {
        let page = page_shell("Test", "<p>hello</p>");
        assert!(page.contains("<title>WebServer | Test</title>"));
        assert!(page.contains("<p>hello</p>"));
    }

    #[test]
    fn welcome_escapes_username() {
        let page = welcome_page("<bob>");
        assert!(page.contains("&lt;bob&gt;"));
        assert!(!page.contains("<bob>"));
    }

    #[test]
    fn list_page_renders_rows() {
        let items = vec![UploadItem {
            stored_name: "alice_20260101120000_cat.png".into(),
            original_name: "cat.png".into(),
            size: 1234,
            timestamp: 0,
        }];
        let page = upload_list_page(&items);
        assert!(page.contains("/uploads/alice_20260101120000_cat.png"));
        assert!(page.contains("cat.png"));
        assert!(page.contains("1234 bytes"));
        assert!(page.contains("<img"));
    }

    #[test]
    fn empty_list_page() {
        let page = upload_list_page(&[]);
        assert!(page.contains("Nothing here yet"));
    }
}
