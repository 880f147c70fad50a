// src/conn.rs
use crate::http::{self, Method, RequestOutcome};
use crate::syscalls::{self, Epoll, EPOLLIN, EPOLLOUT};
use memmap2::Mmap;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

pub const READ_BUFFER_SIZE: usize = 64 * 1024;
pub const WRITE_BUFFER_SIZE: usize = 8 * 1024;
/// Hard cap on a request body.
pub const MAX_BODY_SIZE: usize = 200 * 1024 * 1024;
/// Read buffer ceiling: the body cap plus headroom for the head section.
pub const READ_BUFFER_MAX: usize = MAX_BODY_SIZE + 4096;

pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePhase {
    RequestLine,
    Header,
    Body,
}

/// Response body region for the second scatter-gather descriptor. A
/// mapped file and an owned buffer are mutually exclusive by
/// construction.
pub enum BodySource {
    None,
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl BodySource {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            BodySource::None => &[],
            BodySource::Mapped(map) => map,
            BodySource::Owned(buf) => buf,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_none(&self) -> bool {
        matches!(self, BodySource::None)
    }
}

/// Outcome of one `write_response` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Would-block: write interest re-armed, try again on the next event.
    Continue,
    /// Response fully sent on a keep-alive connection; state reset.
    KeepAlive,
    /// Connection is done (response sent without keep-alive, or error).
    Close,
}

/// One live connection. The dispatcher owns the table entry; a worker
/// borrows the `Arc` for the duration of one task. One-shot registration
/// guarantees at most one task references a connection at a time, so the
/// state mutex is uncontended.
pub struct Conn {
    pub fd: RawFd,
    pub peer: SocketAddr,
    /// Normalized peer IP; swapped when a forwarded-IP header names the
    /// real client. Kept outside the main state so the dispatcher's
    /// close path never waits on a worker.
    pub ip: Mutex<String>,
    pub state: Mutex<HttpState>,
}

impl Conn {
    pub fn new(fd: RawFd, peer: SocketAddr, ip: String) -> Self {
        Self {
            fd,
            peer,
            ip: Mutex::new(ip),
            state: Mutex::new(HttpState::new()),
        }
    }

    pub fn current_ip(&self) -> String {
        self.ip.lock().unwrap().clone()
    }
}

pub struct HttpState {
    pub read_buf: Vec<u8>,
    /// Bytes received so far.
    pub read_idx: usize,
    /// Parse cursor; never exceeds `read_idx`.
    pub checked_idx: usize,
    /// Start of the line currently being parsed; once headers end, the
    /// start of the request body.
    pub start_line: usize,
    pub write_buf: [u8; WRITE_BUFFER_SIZE],
    pub write_idx: usize,
    pub phase: ParsePhase,
    pub method: Method,
    pub url: String,
    pub host: String,
    pub content_length: usize,
    pub body_start: usize,
    pub boundary: String,
    pub cookie: String,
    pub extra_headers: String,
    pub username: String,
    pub linger: bool,
    pub response_status: u16,
    pub file_type: String,
    pub dynamic_type: String,
    pub body: BodySource,
    pub bytes_to_send: usize,
    pub bytes_have_send: usize,
}

impl HttpState {
    pub fn new() -> Self {
        Self {
            read_buf: vec![0; READ_BUFFER_SIZE],
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            write_buf: [0; WRITE_BUFFER_SIZE],
            write_idx: 0,
            phase: ParsePhase::RequestLine,
            method: Method::Get,
            url: String::new(),
            host: String::new(),
            content_length: 0,
            body_start: 0,
            boundary: String::new(),
            cookie: String::new(),
            extra_headers: String::new(),
            username: String::new(),
            linger: false,
            response_status: 200,
            file_type: DEFAULT_CONTENT_TYPE.to_string(),
            dynamic_type: String::new(),
            body: BodySource::None,
            bytes_to_send: 0,
            bytes_have_send: 0,
        }
    }

    /// Reset for the next request on a kept-alive connection. Cursors go
    /// back to zero; the read buffer keeps whatever capacity it grew to.
    pub fn reset_for_next_request(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.write_idx = 0;
        self.phase = ParsePhase::RequestLine;
        self.method = Method::Get;
        self.url.clear();
        self.host.clear();
        self.content_length = 0;
        self.body_start = 0;
        self.boundary.clear();
        self.cookie.clear();
        self.extra_headers.clear();
        self.username.clear();
        self.linger = false;
        self.response_status = 200;
        self.file_type = DEFAULT_CONTENT_TYPE.to_string();
        self.dynamic_type.clear();
        self.body = BodySource::None;
        self.bytes_to_send = 0;
        self.bytes_have_send = 0;
    }

    /// Completed request body as a slice of the read buffer. The parser
    /// never copies body bytes; endpoints slice them from here.
    pub fn request_body(&self) -> &[u8] {
        let end = (self.body_start + self.content_length).min(self.read_idx);
        &self.read_buf[self.body_start..end]
    }

    /// Double the read buffer, bounded above. Returns false at the cap.
    fn grow_read_buffer(&mut self) -> bool {
        let current = self.read_buf.len();
        if current >= READ_BUFFER_MAX {
            return false;
        }
        let mut next = current * 2;
        if next < current + 4096 {
            next = current + 4096;
        }
        self.read_buf.resize(next.min(READ_BUFFER_MAX), 0);
        true
    }

    /// Make room for a declared body plus slack, bounded by the policy
    /// cap. Called once the body start offset is known.
    pub fn reserve_for_body(&mut self, total_needed: usize) {
        let target = total_needed.min(READ_BUFFER_MAX);
        if target > self.read_buf.len() {
            self.read_buf.resize(target, 0);
        }
    }

    /// Drain the socket into the read buffer until would-block.
    /// `Ok(false)` means the peer closed the connection.
    pub fn read_drain(&mut self, fd: RawFd) -> io::Result<bool> {
        loop {
            if self.read_idx >= self.read_buf.len() && !self.grow_read_buffer() {
                return Err(io::Error::other("read buffer at policy cap"));
            }
            match syscalls::read_fd(fd, &mut self.read_buf[self.read_idx..]) {
                Ok(0) => return Ok(false),
                Ok(n) => self.read_idx += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    // ---- Response assembly into the 8 KiB write buffer ----

    fn push_response(&mut self, args: fmt::Arguments) -> bool {
        if self.write_idx >= WRITE_BUFFER_SIZE {
            return false;
        }
        let mut cursor = io::Cursor::new(&mut self.write_buf[self.write_idx..]);
        if cursor.write_fmt(args).is_err() {
            return false;
        }
        self.write_idx += cursor.position() as usize;
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.push_response(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_content_length(&mut self, len: usize) -> bool {
        self.push_response(format_args!("Content-Length: {}\r\n", len))
    }

    fn add_content_type(&mut self) -> bool {
        let ty = if !self.dynamic_type.is_empty() {
            self.dynamic_type.clone()
        } else {
            self.file_type.clone()
        };
        self.push_response(format_args!("Content-Type: {}\r\n", ty))
    }

    fn add_linger(&mut self) -> bool {
        let value = if self.linger { "keep-alive" } else { "close" };
        self.push_response(format_args!("Connection: {}\r\n", value))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        let mut ok = self.add_content_length(content_len);
        if !self.extra_headers.is_empty() {
            let extra = self.extra_headers.clone();
            ok = ok && self.push_response(format_args!("{}", extra));
        }
        ok = ok && self.add_content_type();
        ok = ok && self.add_linger();
        ok && self.push_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.push_response(format_args!("{}", content))
    }

    fn stage_error(&mut self, status: u16, form: &str) -> bool {
        self.response_status = status;
        self.body = BodySource::None;
        self.dynamic_type.clear();
        self.file_type = DEFAULT_CONTENT_TYPE.to_string();
        self.add_status_line(status, http::status_title(status))
            && self.add_headers(form.len())
            && self.add_content(form)
    }

    /// Build the response head (and, for canned bodies, the body) in the
    /// write buffer and prime the scatter-gather counters. Returns false
    /// if the head does not fit, which closes the connection.
    pub fn stage_response(&mut self, outcome: RequestOutcome) -> bool {
        self.write_idx = 0;
        self.bytes_have_send = 0;
        let ok = match outcome {
            RequestOutcome::Internal => self.stage_error(500, http::ERROR_500_FORM),
            RequestOutcome::Bad => self.stage_error(400, http::ERROR_400_FORM),
            RequestOutcome::NotFound => self.stage_error(404, http::ERROR_404_FORM),
            RequestOutcome::Forbidden => self.stage_error(403, http::ERROR_403_FORM),
            RequestOutcome::Dynamic => {
                let status = self.response_status;
                let len = self.body.len();
                self.add_status_line(status, http::status_title(status)) && self.add_headers(len)
            }
            RequestOutcome::File => {
                let len = self.body.len();
                if len == 0 {
                    self.body = BodySource::None;
                    self.add_status_line(200, http::OK_200_TITLE)
                        && self.add_headers(http::EMPTY_PAGE.len())
                        && self.add_content(http::EMPTY_PAGE)
                } else {
                    self.add_status_line(200, http::OK_200_TITLE) && self.add_headers(len)
                }
            }
        };
        if !ok {
            return false;
        }
        self.bytes_to_send = self.write_idx + self.body.len();
        true
    }

    fn release_body(&mut self) {
        self.body = BodySource::None;
    }

    /// Drive the two-descriptor scatter-gather send. The first
    /// descriptor covers the unsent tail of the write buffer, the second
    /// the unsent tail of the body region.
    pub fn write_response(&mut self, fd: RawFd, epoll: &Epoll, conn_et: bool) -> WriteOutcome {
        if self.bytes_to_send == 0 {
            let _ = epoll.modify(fd, syscalls::event_mask(EPOLLIN, conn_et, true));
            self.reset_for_next_request();
            return WriteOutcome::KeepAlive;
        }

        loop {
            let result = {
                let hdr_end = self.write_idx;
                let hdr_sent = self.bytes_have_send.min(hdr_end);
                let hdr = &self.write_buf[hdr_sent..hdr_end];
                let body = self.body.as_slice();
                let body_off = (self.bytes_have_send - hdr_sent).min(body.len());
                syscalls::writev_fd(fd, &[hdr, &body[body_off..]])
            };

            match result {
                Ok(n) => {
                    self.bytes_have_send += n;
                    self.bytes_to_send = self.bytes_to_send.saturating_sub(n);
                    if self.bytes_to_send == 0 {
                        self.release_body();
                        let _ = epoll.modify(fd, syscalls::event_mask(EPOLLIN, conn_et, true));
                        if self.linger {
                            self.reset_for_next_request();
                            return WriteOutcome::KeepAlive;
                        }
                        return WriteOutcome::Close;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let _ = epoll.modify(fd, syscalls::event_mask(EPOLLOUT, conn_et, true));
                    return WriteOutcome::Continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.release_body();
                    return WriteOutcome::Close;
                }
            }
        }
    }
}

impl Default for HttpState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged_text(state: &HttpState) -> String {
        String::from_utf8_lossy(&state.write_buf[..state.write_idx]).into_owned()
    }

    #[test]
    fn error_response_is_self_contained() {
        let mut state = HttpState::new();
        assert!(state.stage_response(RequestOutcome::NotFound));
        let text = staged_text(&state);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains(&format!("Content-Length: {}\r\n", http::ERROR_404_FORM.len())));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with(http::ERROR_404_FORM));
        assert_eq!(state.bytes_to_send, state.write_idx);
        assert!(state.body.is_none());
    }

    #[test]
    fn dynamic_response_uses_body_descriptor() {
        let mut state = HttpState::new();
        state.body = BodySource::Owned(b"{\"ok\":true}".to_vec());
        state.dynamic_type = "application/json; charset=utf-8".to_string();
        state.response_status = 200;
        state.linger = true;
        assert!(state.stage_response(RequestOutcome::Dynamic));
        let text = staged_text(&state);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json; charset=utf-8\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(state.bytes_to_send, state.write_idx + 11);
    }

    #[test]
    fn extra_headers_land_between_length_and_type() {
        let mut state = HttpState::new();
        state.extra_headers = "Set-Cookie: ws_user=alice; Path=/\r\n".to_string();
        state.body = BodySource::Owned(b"x".to_vec());
        assert!(state.stage_response(RequestOutcome::Dynamic));
        let text = staged_text(&state);
        let len_at = text.find("Content-Length:").unwrap();
        let cookie_at = text.find("Set-Cookie:").unwrap();
        let type_at = text.find("Content-Type:").unwrap();
        assert!(len_at < cookie_at && cookie_at < type_at);
    }

    #[test]
    fn zero_length_file_gets_placeholder_page() {
        let mut state = HttpState::new();
        state.body = BodySource::None;
        assert!(state.stage_response(RequestOutcome::File));
        let text = staged_text(&state);
        assert!(text.ends_with(http::EMPTY_PAGE));
    }

    #[test]
    fn reset_clears_cursors_and_keeps_capacity() {
        let mut state = HttpState::new();
        state.read_buf.resize(READ_BUFFER_SIZE * 4, 0);
        state.read_idx = 100;
        state.checked_idx = 80;
        state.username = "alice".to_string();
        state.linger = true;
        state.reset_for_next_request();
        assert_eq!(state.read_idx, 0);
        assert_eq!(state.checked_idx, 0);
        assert_eq!(state.phase, ParsePhase::RequestLine);
        assert!(state.username.is_empty());
        assert!(!state.linger);
        assert_eq!(state.read_buf.len(), READ_BUFFER_SIZE * 4);
    }

    #[test]
    fn reserve_respects_policy_cap() {
        let mut state = HttpState::new();
        state.reserve_for_body(READ_BUFFER_MAX + 123456);
        assert_eq!(state.read_buf.len(), READ_BUFFER_MAX);
    }

    #[test]
    fn grow_doubles_until_cap() {
        let mut state = HttpState::new();
        assert!(state.grow_read_buffer());
        assert_eq!(state.read_buf.len(), READ_BUFFER_SIZE * 2);
        state.read_buf.resize(READ_BUFFER_MAX, 0);
        assert!(!state.grow_read_buffer());
    }
}
