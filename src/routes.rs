// src/routes.rs
//! Request routing after a complete parse. Dispatch follows URL
//! normalization and decoding; endpoints are expressed on top of the
//! collaborator interfaces (user table + credential store, filesystem,
//! subprocess runner).

use crate::conn::{BodySource, HttpState, DEFAULT_CONTENT_TYPE};
use crate::http::{
    self, cookie_value, get_form_value, mime_for_ext, url_decode, Method, RequestOutcome,
};
use crate::multipart::{self, UploadError};
use crate::pages;
use crate::script;
use crate::stats::Stats;
use crate::uploads::{self, DeleteOutcome, UploadItem};
use crate::users::{CredentialStore, RegisterOutcome, UserTable};
use memmap2::Mmap;
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{info, warn};

pub struct RouteCtx<'a> {
    pub users: &'a UserTable,
    pub store: &'a dyn CredentialStore,
    pub stats: &'a Stats,
    pub docroot: &'a Path,
}

const CLEAR_COOKIE: &str = "Set-Cookie: ws_user=; Path=/; Max-Age=0\r\n";
const LOGIN_LOCATION: &str = "Location: /pages/log.html\r\n";

/// Legacy short paths kept for old clients.
fn apply_aliases(url: &mut String) {
    let target = match url.as_str() {
        "/register.html" => "/pages/register.html",
        "/log.html" => "/pages/log.html",
        "/welcome.html" => "/pages/welcome.html",
        "/upload.html" => "/pages/upload.html",
        "/status.html" => "/pages/status.html",
        "/picture.html" | "/video.html" | "/pages/picture.html" | "/pages/video.html" => {
            "/uploads/list"
        }
        "/0" => "/pages/register.html",
        "/1" => "/pages/log.html",
        "/5" | "/6" => "/uploads/list",
        "/8" => "/index.html",
        "/9" => "/404.html",
        _ => return,
    };
    *url = target.to_string();
}

fn stage_dynamic(state: &mut HttpState, status: u16, content_type: &str, body: String) {
    state.response_status = status;
    state.dynamic_type = content_type.to_string();
    state.body = BodySource::Owned(body.into_bytes());
}

fn redirect_login(state: &mut HttpState) -> RequestOutcome {
    state.extra_headers.push_str(LOGIN_LOCATION);
    stage_dynamic(state, 302, DEFAULT_CONTENT_TYPE, pages::login_required_page());
    RequestOutcome::Dynamic
}

/// Serve the site 404 page when the document root carries one.
fn render_not_found(state: &mut HttpState, docroot: &Path) -> RequestOutcome {
    match std::fs::read_to_string(docroot.join("404.html")) {
        Ok(page) => {
            stage_dynamic(state, 404, DEFAULT_CONTENT_TYPE, page);
            RequestOutcome::Dynamic
        }
        Err(_) => RequestOutcome::NotFound,
    }
}

fn handle_status_json(state: &mut HttpState, stats: &Stats) -> RequestOutcome {
    let snapshot = stats.snapshot();
    let body = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
    state
        .extra_headers
        .push_str("Cache-Control: no-store, no-cache, must-revalidate\r\nPragma: no-cache\r\n");
    stage_dynamic(state, 200, "application/json; charset=utf-8", body);
    RequestOutcome::Dynamic
}

fn handle_upload(state: &mut HttpState, docroot: &Path) -> RequestOutcome {
    let fail = |state: &mut HttpState, message: &str| {
        stage_dynamic(
            state,
            400,
            DEFAULT_CONTENT_TYPE,
            pages::upload_failure_page(message),
        );
        RequestOutcome::Dynamic
    };

    if state.method != Method::Post {
        return fail(state, "This request method cannot upload.");
    }
    if state.username.is_empty() {
        return fail(state, "No logged-in user detected.");
    }
    if state.content_length == 0 {
        return fail(state, "No upload content detected.");
    }

    let boundary = if state.boundary.is_empty() {
        None
    } else {
        Some(state.boundary.clone())
    };

    // Parse and persist while borrowing the body in place; only the
    // stored record survives the borrow.
    let saved = {
        let body = state.request_body();
        match multipart::parse_upload(body, boundary.as_deref()) {
            Ok(part) => {
                let stored = uploads::stored_name_for(&state.username, &part.filename);
                let data = &body[part.data.clone()];
                match uploads::save_upload(docroot, &stored, data) {
                    Ok(()) => Ok((part.filename, stored, data.len())),
                    Err(e) => {
                        warn!("upload write failed: {}", e);
                        Err("Could not write the uploaded file.")
                    }
                }
            }
            Err(UploadError::NoFilename) => Err("No file name found in the upload."),
            Err(UploadError::Empty) => Err("The uploaded file is empty."),
            Err(UploadError::NoBoundary) => Err("Missing multipart boundary."),
            Err(UploadError::Truncated) => Err("The upload data is incomplete."),
        }
    };

    match saved {
        Ok((original, stored, size)) => {
            let item = UploadItem {
                stored_name: stored.clone(),
                original_name: original.clone(),
                size: size as u64,
                timestamp: chrono::Local::now().timestamp(),
            };
            if let Err(e) = uploads::append_metadata(docroot, &state.username, &item) {
                warn!("metadata append failed: {}", e);
            }
            info!("user {} uploaded {} ({} bytes)", state.username, stored, size);
            stage_dynamic(
                state,
                200,
                DEFAULT_CONTENT_TYPE,
                pages::upload_success_page(&original, &stored, size),
            );
            RequestOutcome::Dynamic
        }
        Err(message) => fail(state, message),
    }
}

fn handle_upload_delete(state: &mut HttpState, docroot: &Path) -> RequestOutcome {
    let fail = |state: &mut HttpState, status: u16, message: &str| {
        stage_dynamic(
            state,
            status,
            DEFAULT_CONTENT_TYPE,
            pages::delete_failure_page(message),
        );
        RequestOutcome::Dynamic
    };

    if state.method != Method::Post {
        return fail(state, 400, "This request method cannot delete.");
    }
    if state.username.is_empty() {
        return fail(state, 400, "No logged-in user detected.");
    }
    if state.content_length == 0 {
        return fail(state, 400, "No delete request detected.");
    }

    let payload = String::from_utf8_lossy(state.request_body()).into_owned();
    let mut stored = get_form_value(&payload, "file");
    if stored.is_empty() {
        stored = get_form_value(&payload, "stored");
    }
    if stored.is_empty() {
        return fail(state, 400, "No file named for deletion.");
    }
    if !uploads::is_valid_stored_param(&stored) {
        return fail(state, 400, "Invalid file name.");
    }
    if !uploads::user_owns(docroot, &state.username, &stored) {
        return fail(state, 404, "No permission to delete that file.");
    }

    match uploads::remove_upload(docroot, &state.username, &stored) {
        DeleteOutcome::Removed => {
            info!("user {} deleted {}", state.username, stored);
            stage_dynamic(state, 200, DEFAULT_CONTENT_TYPE, pages::delete_success_page());
            RequestOutcome::Dynamic
        }
        DeleteOutcome::NotFound => fail(state, 404, "No matching upload record."),
        DeleteOutcome::Failed => fail(state, 500, "Could not update the upload records."),
    }
}

fn serve_static(state: &mut HttpState, docroot: &Path, url: &str) -> RequestOutcome {
    let path = docroot.join(url.trim_start_matches('/'));
    let meta = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(_) => return render_not_found(state, docroot),
    };
    if meta.permissions().mode() & 0o004 == 0 {
        return RequestOutcome::Forbidden;
    }
    if meta.is_dir() {
        return RequestOutcome::Bad;
    }

    state.file_type = mime_for_ext(&http::ext_of(url)).to_string();

    if meta.len() == 0 {
        state.body = BodySource::None;
        return RequestOutcome::File;
    }

    let file = match File::open(&path) {
        Ok(f) => f,
        Err(_) => return RequestOutcome::Internal,
    };
    // Read-only private mapping for the duration of the response.
    match unsafe { Mmap::map(&file) } {
        Ok(map) => {
            state.body = BodySource::Mapped(map);
            RequestOutcome::File
        }
        Err(_) => RequestOutcome::Internal,
    }
}

/// Route a completed request. The caller holds a credential-store handle
/// from the pool for the duration of this call.
pub fn do_request(state: &mut HttpState, ctx: &RouteCtx) -> RequestOutcome {
    let mut url = url_decode(&state.url);
    if url.is_empty() {
        url = "/".to_string();
    }
    if !url.starts_with('/') {
        return RequestOutcome::Bad;
    }
    if url.contains("..") {
        return RequestOutcome::Bad;
    }

    apply_aliases(&mut url);

    let cookie_user = cookie_value(&state.cookie, "ws_user");
    let mut logged_in = !cookie_user.is_empty() && ctx.users.contains(&cookie_user);
    if logged_in {
        state.username = cookie_user.clone();
    } else if !cookie_user.is_empty() {
        // Stale session cookie: clear it on the way out.
        state.extra_headers.push_str(CLEAR_COOKIE);
    }

    // Login and registration arrive as POST bodies on the legacy
    // single-digit endpoints.
    if state.method == Method::Post && (url == "/2" || url == "/3") {
        if state.content_length == 0 {
            return RequestOutcome::Bad;
        }
        let payload = String::from_utf8_lossy(state.request_body()).into_owned();
        if !payload.contains("user=") || !payload.contains("password=") {
            return RequestOutcome::Bad;
        }
        let name = get_form_value(&payload, "user");
        let password = get_form_value(&payload, "password");

        if url == "/3" {
            url = match ctx.users.register(ctx.store, &name, &password) {
                RegisterOutcome::Created => {
                    info!("registered user {}", name);
                    "/pages/log.html".to_string()
                }
                RegisterOutcome::Duplicate | RegisterOutcome::StoreError => {
                    "/pages/registerError.html".to_string()
                }
            };
        } else if ctx.users.verify(&name, &password) {
            logged_in = true;
            state.username = name.clone();
            state
                .extra_headers
                .push_str(&format!("Set-Cookie: ws_user={}; Path=/\r\n", name));
            url = "/pages/welcome.html".to_string();
        } else {
            url = "/pages/logError.html".to_string();
        }
    }

    if url == "/logout" {
        state.extra_headers.push_str(CLEAR_COOKIE);
        state.extra_headers.push_str(LOGIN_LOCATION);
        stage_dynamic(state, 302, DEFAULT_CONTENT_TYPE, pages::logout_page());
        return RequestOutcome::Dynamic;
    }

    if url == "/status.json" {
        if !logged_in {
            return redirect_login(state);
        }
        return handle_status_json(state, ctx.stats);
    }

    if url == "/upload" {
        if !logged_in {
            return redirect_login(state);
        }
        if state.method == Method::Post {
            return handle_upload(state, ctx.docroot);
        }
        url = "/pages/upload.html".to_string();
    }

    if url == "/uploads/delete" {
        if !logged_in {
            return redirect_login(state);
        }
        return handle_upload_delete(state, ctx.docroot);
    }

    if url == "/uploads/list" {
        if !logged_in {
            return redirect_login(state);
        }
        let items = uploads::load_user_uploads(ctx.docroot, &state.username);
        stage_dynamic(state, 200, DEFAULT_CONTENT_TYPE, pages::upload_list_page(&items));
        return RequestOutcome::Dynamic;
    }

    if let Some(stored) = url.strip_prefix("/uploads/") {
        if !logged_in {
            return redirect_login(state);
        }
        if stored.is_empty() || !uploads::user_owns(ctx.docroot, &state.username, stored) {
            return render_not_found(state, ctx.docroot);
        }
    }

    if url == "/pages/status.html" || url == "/pages/upload.html" || url == "/pages/welcome.html" {
        if !logged_in {
            return redirect_login(state);
        }
    }
    if url == "/pages/welcome.html" {
        stage_dynamic(
            state,
            200,
            DEFAULT_CONTENT_TYPE,
            pages::welcome_page(&state.username),
        );
        return RequestOutcome::Dynamic;
    }

    if http::ext_of(&url) == ".php" {
        let script_path = ctx.docroot.join(url.trim_start_matches('/'));
        if !script_path.exists() {
            return render_not_found(state, ctx.docroot);
        }
        let output = script::run_script(&script_path);
        state.body = BodySource::Owned(output);
        state.dynamic_type = DEFAULT_CONTENT_TYPE.to_string();
        state.response_status = 200;
        return RequestOutcome::Dynamic;
    }

    serve_static(state, ctx.docroot, &url)
}
