// src/parser.rs
//! Resumable HTTP request parser.
//!
//! Three states: request-line, header, body. The first two consume
//! CRLF-terminated lines from the connection's read buffer; the body
//! state is byte-counted and never scans. A return of `Incomplete`
//! leaves every cursor consistent so the next read fill resumes parsing
//! in place.

use crate::conn::{Conn, HttpState, ParsePhase, BodySource, MAX_BODY_SIZE};
use crate::http::Method;
use crate::pages;
use crate::stats::{extract_forwarded_ip, normalize_ip, Stats};
use crate::syscalls;
use std::os::unix::io::RawFd;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A full line was consumed.
    Ok,
    /// Need more bytes.
    Open,
    /// Malformed terminator.
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// Need more data; cursors are positioned for resumption.
    Incomplete,
    /// A complete request is buffered; hand it to the router.
    Complete,
    /// Protocol error: respond 400 and close after writing.
    Bad,
    /// Content-Length over the policy cap; a 413 body is staged.
    Oversize,
}

enum HeaderResult {
    More,
    EndOfHeaders,
    Bad,
    Oversize,
}

/// Consume the next line. On `Ok` the cursor sits past the CRLF and the
/// line content is `read_buf[start_line..checked_idx - 2]`.
fn parse_line(state: &mut HttpState) -> LineStatus {
    while state.checked_idx < state.read_idx {
        match state.read_buf[state.checked_idx] {
            b'\r' => {
                if state.checked_idx + 1 == state.read_idx {
                    // Lone CR at buffer end: terminator may still arrive.
                    return LineStatus::Open;
                }
                if state.read_buf[state.checked_idx + 1] == b'\n' {
                    state.checked_idx += 2;
                    return LineStatus::Ok;
                }
                return LineStatus::Bad;
            }
            b'\n' => {
                if state.checked_idx > state.start_line
                    && state.read_buf[state.checked_idx - 1] == b'\r'
                {
                    state.checked_idx += 1;
                    return LineStatus::Ok;
                }
                return LineStatus::Bad;
            }
            _ => state.checked_idx += 1,
        }
    }
    LineStatus::Open
}

/// `METHOD SP URL SP VERSION`. GET and POST only; POST enables body
/// handling. A scheme-qualified URL is stripped to its absolute path,
/// and bare `/` expands to `/index.html`.
fn parse_request_line(state: &mut HttpState, line: &str) -> Result<(), ()> {
    let mut parts = line.split_ascii_whitespace();
    let method = match parts.next() {
        Some(m) => Method::from_bytes(m.as_bytes()),
        None => return Err(()),
    };
    if method == Method::Unknown {
        return Err(());
    }
    let mut url = parts.next().ok_or(())?.to_string();
    let version = parts.next().ok_or(())?;
    if !version.eq_ignore_ascii_case("HTTP/1.1") {
        return Err(());
    }

    for scheme in ["http://", "https://"] {
        if url.len() >= scheme.len() && url[..scheme.len()].eq_ignore_ascii_case(scheme) {
            url = match url[scheme.len()..].find('/') {
                Some(slash) => url[scheme.len() + slash..].to_string(),
                None => return Err(()),
            };
            break;
        }
    }
    if !url.starts_with('/') {
        return Err(());
    }
    if url == "/" {
        url.push_str("index.html");
    }

    state.method = method;
    state.url = url;
    state.phase = ParsePhase::Header;
    Ok(())
}

fn parse_header_line(
    conn: &Conn,
    state: &mut HttpState,
    stats: &Stats,
    fd: RawFd,
    line: &str,
) -> HeaderResult {
    if line.is_empty() {
        if state.content_length != 0 {
            state.phase = ParsePhase::Body;
            state.body_start = state.checked_idx;
            return HeaderResult::EndOfHeaders;
        }
        return HeaderResult::EndOfHeaders;
    }

    let Some((name, value)) = line.split_once(':') else {
        // Tolerated like any other unrecognized header line.
        debug!("malformed header line: {}", line);
        return HeaderResult::More;
    };
    let value = value.trim();

    if name.eq_ignore_ascii_case("Connection") {
        if value.eq_ignore_ascii_case("keep-alive") {
            state.linger = true;
        }
    } else if name.eq_ignore_ascii_case("Content-Length") {
        let Ok(len) = value.parse::<usize>() else {
            return HeaderResult::Bad;
        };
        if len > MAX_BODY_SIZE {
            state.response_status = 413;
            state.dynamic_type = "text/html; charset=utf-8".to_string();
            state.body = BodySource::Owned(pages::oversize_page().into_bytes());
            return HeaderResult::Oversize;
        }
        state.content_length = len;
    } else if name.eq_ignore_ascii_case("Expect") {
        if value.to_ascii_lowercase().contains("100-continue") {
            syscalls::send_all(fd, b"HTTP/1.1 100 Continue\r\n\r\n");
        }
    } else if name.eq_ignore_ascii_case("Content-Type") {
        let lower = value.to_ascii_lowercase();
        if let Some(pos) = lower.find("boundary=") {
            let rest = &value[pos + "boundary=".len()..];
            let mut boundary = match rest.find(';') {
                Some(end) => rest[..end].trim(),
                None => rest.trim(),
            };
            if boundary.len() >= 2 && boundary.starts_with('"') && boundary.ends_with('"') {
                boundary = &boundary[1..boundary.len() - 1];
            }
            state.boundary = boundary.to_string();
        }
    } else if name.eq_ignore_ascii_case("Host") {
        state.host = value.to_string();
    } else if name.eq_ignore_ascii_case("Cookie") {
        state.cookie = value.to_string();
    } else if name.eq_ignore_ascii_case("X-Forwarded-For")
        || name.eq_ignore_ascii_case("CF-Connecting-IP")
    {
        let forwarded = normalize_ip(&extract_forwarded_ip(value));
        if !forwarded.is_empty() {
            let mut ip = conn.ip.lock().unwrap();
            if *ip != forwarded {
                stats.reassign(&ip, &forwarded);
                *ip = forwarded;
            }
        }
    } else {
        debug!("unhandled header: {}", name);
    }
    HeaderResult::More
}

/// Byte-counted body completion check; no CRLF scanning.
fn body_complete(state: &HttpState) -> bool {
    state.read_idx >= state.body_start + state.content_length
}

/// Run the state machine over whatever bytes are buffered.
pub fn process_read(conn: &Conn, state: &mut HttpState, stats: &Stats, fd: RawFd) -> ParseResult {
    if state.phase == ParsePhase::Body {
        if body_complete(state) {
            return ParseResult::Complete;
        }
        return ParseResult::Incomplete;
    }

    loop {
        match parse_line(state) {
            LineStatus::Open => return ParseResult::Incomplete,
            LineStatus::Bad => return ParseResult::Bad,
            LineStatus::Ok => {}
        }
        let line = String::from_utf8_lossy(&state.read_buf[state.start_line..state.checked_idx - 2])
            .into_owned();
        state.start_line = state.checked_idx;

        match state.phase {
            ParsePhase::RequestLine => {
                debug!("request line: {}", line);
                if parse_request_line(state, &line).is_err() {
                    return ParseResult::Bad;
                }
            }
            ParsePhase::Header => match parse_header_line(conn, state, stats, fd, &line) {
                HeaderResult::Bad => return ParseResult::Bad,
                HeaderResult::Oversize => return ParseResult::Oversize,
                HeaderResult::More => {}
                HeaderResult::EndOfHeaders => {
                    if state.phase != ParsePhase::Body {
                        return ParseResult::Complete;
                    }
                    // The body start is now known; guarantee the slack
                    // byte past the declared length.
                    state.reserve_for_body(state.body_start + state.content_length + 4096);
                    if body_complete(state) {
                        return ParseResult::Complete;
                    }
                    return ParseResult::Incomplete;
                }
            },
            ParsePhase::Body => unreachable!("body phase handled before the line loop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_conn() -> Conn {
        Conn::new(
            -1,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 1234),
            "8.8.8.8".to_string(),
        )
    }

    fn feed(state: &mut HttpState, bytes: &[u8]) {
        if state.read_idx + bytes.len() > state.read_buf.len() {
            state.read_buf.resize(state.read_idx + bytes.len() + 1, 0);
        }
        state.read_buf[state.read_idx..state.read_idx + bytes.len()].copy_from_slice(bytes);
        state.read_idx += bytes.len();
    }

    fn run(conn: &Conn, state: &mut HttpState, stats: &Stats) -> ParseResult {
        process_read(conn, state, stats, -1)
    }

    #[test]
    fn simple_get_parses() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();
        feed(&mut state, b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Complete);
        assert_eq!(state.method, Method::Get);
        assert_eq!(state.url, "/index.html");
        assert_eq!(state.host, "x");
        assert!(state.linger);
    }

    #[test]
    fn root_url_expands_to_index() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();
        feed(&mut state, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Complete);
        assert_eq!(state.url, "/index.html");
    }

    #[test]
    fn scheme_and_authority_are_stripped() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();
        feed(&mut state, b"GET http://example.com/a/b.html HTTP/1.1\r\n\r\n");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Complete);
        assert_eq!(state.url, "/a/b.html");
    }

    #[test]
    fn wrong_version_is_bad() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();
        feed(&mut state, b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Bad);
    }

    #[test]
    fn unknown_method_is_bad() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();
        feed(&mut state, b"PUT /x HTTP/1.1\r\n\r\n");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Bad);
    }

    #[test]
    fn bare_lf_is_bad() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();
        feed(&mut state, b"GET / HTTP/1.1\n");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Bad);
    }

    #[test]
    fn parser_resumes_across_split_reads() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();

        feed(&mut state, b"POST /upload HTTP/1.1\r");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Incomplete);

        feed(&mut state, b"\nContent-Length: 5\r\n");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Incomplete);

        feed(&mut state, b"\r\nhel");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Incomplete);

        feed(&mut state, b"lo");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Complete);
        assert_eq!(state.request_body(), b"hello");
        assert_eq!(state.method, Method::Post);
    }

    #[test]
    fn capacity_invariant_after_header_parse() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();
        let len = 300_000;
        feed(
            &mut state,
            format!("POST /upload HTTP/1.1\r\nContent-Length: {}\r\n\r\n", len).as_bytes(),
        );
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Incomplete);
        assert!(state.read_buf.len() >= state.checked_idx + len + 1);
        assert!(state.checked_idx <= state.read_idx);
    }

    #[test]
    fn one_byte_over_cap_is_oversize() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();
        feed(
            &mut state,
            format!("POST /upload HTTP/1.1\r\nContent-Length: {}\r\n", MAX_BODY_SIZE + 1).as_bytes(),
        );
        let before = state.read_buf.len();
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Oversize);
        assert_eq!(state.response_status, 413);
        assert!(state.body.len() > 0);
        // The read buffer must not balloon past the policy cap.
        assert_eq!(state.read_buf.len(), before);
    }

    #[test]
    fn boundary_extracted_with_quotes() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();
        feed(
            &mut state,
            b"POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=\"abc123\"\r\n\r\n",
        );
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Complete);
        assert_eq!(state.boundary, "abc123");
    }

    #[test]
    fn forwarded_ip_updates_stats() {
        let conn = test_conn();
        let stats = Stats::new();
        stats.on_connect("8.8.8.8");
        let mut state = HttpState::new();
        feed(
            &mut state,
            b"GET / HTTP/1.1\r\nX-Forwarded-For: 1.1.1.1, 9.9.9.9\r\n\r\n",
        );
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Complete);
        assert_eq!(conn.current_ip(), "1.1.1.1");
        assert_eq!(stats.distinct_live_ips(), 1);
    }

    #[test]
    fn cookie_header_is_captured() {
        let conn = test_conn();
        let stats = Stats::new();
        let mut state = HttpState::new();
        feed(&mut state, b"GET / HTTP/1.1\r\nCookie: ws_user=alice\r\n\r\n");
        assert_eq!(run(&conn, &mut state, &stats), ParseResult::Complete);
        assert_eq!(state.cookie, "ws_user=alice");
    }
}
