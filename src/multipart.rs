// src/multipart.rs
//! Single-part `multipart/form-data` extraction over the request body.
//!
//! The upload endpoint only ever stores the first file part, so this is
//! not a general multipart iterator: it locates the boundary (or infers
//! it from the first body line), the part's header block and the file
//! data, tolerating LF-only line breaks throughout.

use std::ops::Range;

#[derive(Debug, PartialEq, Eq)]
pub enum UploadError {
    /// Body ends before the multipart structure is complete.
    Truncated,
    /// No boundary delimiter could be located or inferred.
    NoBoundary,
    /// The part carries no `filename="..."`.
    NoFilename,
    /// The file data region is empty.
    Empty,
}

#[derive(Debug)]
pub struct UploadPart {
    /// Sanitized original file name.
    pub filename: String,
    /// File data as a range into the body slice.
    pub data: Range<usize>,
}

fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || data.len() < needle.len() {
        return None;
    }
    data.windows(needle.len()).position(|w| w == needle)
}

/// Locate the boundary line: at offset zero, or preceded by a line break.
/// Returns the offset of the delimiter itself.
fn find_boundary_line(body: &[u8], delim: &[u8]) -> Option<usize> {
    if delim.is_empty() {
        return None;
    }
    if body.starts_with(delim) {
        return Some(0);
    }
    let mut marker = Vec::with_capacity(delim.len() + 2);
    marker.extend_from_slice(b"\r\n");
    marker.extend_from_slice(delim);
    if let Some(pos) = find(body, &marker) {
        return Some(pos + 2);
    }
    let mut marker = Vec::with_capacity(delim.len() + 1);
    marker.push(b'\n');
    marker.extend_from_slice(delim);
    find(body, &marker).map(|pos| pos + 1)
}

/// First line break at or after `from`; returns (offset, break length).
fn find_line_break(body: &[u8], from: usize) -> Option<(usize, usize)> {
    let slice = &body[from..];
    match (find(slice, b"\r\n"), find(slice, b"\n")) {
        (Some(crlf), Some(lf)) if lf < crlf => Some((from + lf, 1)),
        (Some(crlf), _) => Some((from + crlf, 2)),
        (None, Some(lf)) => Some((from + lf, 1)),
        (None, None) => None,
    }
}

/// End of the part's header block; returns (offset, separator length).
fn find_header_end(body: &[u8], from: usize) -> Option<(usize, usize)> {
    let slice = &body[from..];
    if let Some(pos) = find(slice, b"\r\n\r\n") {
        return Some((from + pos, 4));
    }
    find(slice, b"\n\n").map(|pos| (from + pos, 2))
}

/// Replace path and shell metacharacters and control bytes with
/// underscores, strip leading dots, and never return an empty name.
pub fn sanitize_filename(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '|' | '<' | '>' | '"' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    while name.starts_with('.') {
        name.remove(0);
    }
    if name.is_empty() {
        name = "upload.bin".to_string();
    }
    name
}

/// Extract the first file part from a multipart body. `boundary` comes
/// from the Content-Type header when the client sent one.
pub fn parse_upload(body: &[u8], boundary: Option<&str>) -> Result<UploadPart, UploadError> {
    // Delimiter lines carry a leading "--".
    let mut delim: Vec<u8> = match boundary {
        Some(b) if !b.is_empty() => {
            let mut d = Vec::with_capacity(b.len() + 2);
            if !b.starts_with("--") {
                d.extend_from_slice(b"--");
            }
            d.extend_from_slice(b.as_bytes());
            d
        }
        _ => Vec::new(),
    };

    let boundary_at = match find_boundary_line(body, &delim) {
        Some(pos) => pos,
        None => {
            // No declared boundary matched: infer it from the first line.
            let (line_end, _) = find_line_break(body, 0).ok_or(UploadError::Truncated)?;
            if line_end == 0 {
                return Err(UploadError::NoBoundary);
            }
            delim = body[..line_end].to_vec();
            0
        }
    };

    // Skip the boundary line's terminator.
    let after_delim = boundary_at + delim.len();
    let rest = body.get(after_delim..).ok_or(UploadError::Truncated)?;
    let headers_start = if rest.starts_with(b"\r\n") {
        after_delim + 2
    } else if rest.starts_with(b"\n") {
        after_delim + 1
    } else {
        return Err(UploadError::Truncated);
    };

    let (headers_end, sep_len) =
        find_header_end(body, headers_start).ok_or(UploadError::Truncated)?;
    let headers = String::from_utf8_lossy(&body[headers_start..headers_end]);

    let filename_pos = headers.find("filename=\"").ok_or(UploadError::NoFilename)?;
    let rest = &headers[filename_pos + 10..];
    let filename_end = rest.find('"').ok_or(UploadError::NoFilename)?;
    let filename = sanitize_filename(&rest[..filename_end]);

    let data_start = headers_end + sep_len;
    if data_start > body.len() {
        return Err(UploadError::Truncated);
    }

    // The data ends at the closing delimiter, or at the next part's.
    let tail = &body[data_start..];
    let mut closing = delim.clone();
    closing.extend_from_slice(b"--");
    let markers = [
        [b"\r\n".as_slice(), closing.as_slice()].concat(),
        [b"\n".as_slice(), closing.as_slice()].concat(),
        [b"\r\n".as_slice(), delim.as_slice()].concat(),
        [b"\n".as_slice(), delim.as_slice()].concat(),
    ];
    let data_len = markers
        .iter()
        .filter_map(|marker| find(tail, marker))
        .min()
        .ok_or(UploadError::Truncated)?;

    if data_len == 0 {
        return Err(UploadError::Empty);
    }

    Ok(UploadPart {
        filename,
        data: data_start..data_start + data_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crlf_body(boundary: &str, filename: &str, data: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
        body
    }

    #[test]
    fn crlf_upload_round_trip() {
        let body = crlf_body("XyZ", "photo.png", b"pngdata\x00binary");
        let part = parse_upload(&body, Some("XyZ")).unwrap();
        assert_eq!(part.filename, "photo.png");
        assert_eq!(&body[part.data], b"pngdata\x00binary");
    }

    #[test]
    fn lf_only_variant() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--bnd\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\n\n");
        body.extend_from_slice(b"lf data");
        body.extend_from_slice(b"\n--bnd--\n");
        let part = parse_upload(&body, Some("bnd")).unwrap();
        assert_eq!(part.filename, "a.txt");
        assert_eq!(&body[part.data], b"lf data");
    }

    #[test]
    fn boundary_inferred_from_first_line() {
        let body = crlf_body("unknownBoundary", "doc.pdf", b"%PDF");
        let part = parse_upload(&body, None).unwrap();
        assert_eq!(part.filename, "doc.pdf");
        assert_eq!(&body[part.data], b"%PDF");
    }

    #[test]
    fn boundary_already_prefixed() {
        let body = crlf_body("q1w2", "x.bin", b"data");
        let part = parse_upload(&body, Some("--q1w2")).unwrap();
        assert_eq!(&body[part.data], b"data");
    }

    #[test]
    fn next_part_terminates_data() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--b\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"f\"; filename=\"one\"\r\n\r\n");
        body.extend_from_slice(b"first");
        body.extend_from_slice(b"\r\n--b\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"g\"; filename=\"two\"\r\n\r\n");
        body.extend_from_slice(b"second\r\n--b--\r\n");
        let part = parse_upload(&body, Some("b")).unwrap();
        assert_eq!(part.filename, "one");
        assert_eq!(&body[part.data], b"first");
    }

    #[test]
    fn missing_filename_rejected() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--b\r\n");
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"f\"\r\n\r\n");
        body.extend_from_slice(b"data\r\n--b--\r\n");
        assert_eq!(parse_upload(&body, Some("b")).unwrap_err(), UploadError::NoFilename);
    }

    #[test]
    fn truncated_body_rejected() {
        let body = b"--b\r\nContent-Disposition: form-data; filename=\"x\"\r\n\r\nda";
        assert_eq!(parse_upload(body, Some("b")).unwrap_err(), UploadError::Truncated);
    }

    #[test]
    fn sanitize_table() {
        assert_eq!(sanitize_filename("a/b\\c:d|e<f>g\"h"), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_filename("...hidden"), "hidden");
        assert_eq!(sanitize_filename("ctrl\x07name"), "ctrl_name");
        assert_eq!(sanitize_filename(""), "upload.bin");
        assert_eq!(sanitize_filename("..."), "upload.bin");
    }
}
