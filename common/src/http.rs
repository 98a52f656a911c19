use std::io::{self, Read};

use serde::Serialize;

use crate::types::LedCommand;

pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

impl Method {
    pub fn parse(method: &str) -> Self {
        match method {
            "GET" => Self::Get,
            "POST" => Self::Post,
            _ => Self::Other,
        }
    }
}

/// The handlers this device knows. Anything else is `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Index,
    Data,
    Status,
    Led,
    NotFound,
}

impl Route {
    pub fn resolve(method: Method, path: &str) -> Self {
        let path = path.split_once('?').map_or(path, |(path, _)| path);
        match (method, path) {
            (Method::Get, "/") => Self::Index,
            (Method::Get, "/data") => Self::Data,
            (Method::Get, "/api/status") => Self::Status,
            (Method::Post, "/ws") => Self::Led,
            _ => Self::NotFound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub retry_after_secs: Option<u32>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl Response {
    pub fn new(status: u16, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
            retry_after_secs: None,
        }
    }

    pub fn html(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, CONTENT_TYPE_HTML, body)
    }

    pub fn text(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status, CONTENT_TYPE_TEXT, body)
    }

    pub fn json<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_vec(payload) {
            Ok(body) => Self::new(200, CONTENT_TYPE_JSON, body),
            Err(err) => {
                log::warn!("response serialization failed: {err}");
                Self::error(500, "serialization failed")
            }
        }
    }

    pub fn error(status: u16, message: &str) -> Self {
        let body = serde_json::to_vec(&ErrorBody { error: message })
            .unwrap_or_else(|_| b"{}".to_vec());
        Self::new(status, CONTENT_TYPE_JSON, body)
    }

    pub fn not_found() -> Self {
        Self::error(404, "not found")
    }

    pub fn busy() -> Self {
        Self {
            retry_after_secs: Some(1),
            ..Self::text(503, "server busy, try again")
        }
    }

    /// Full HTTP/1.1 response for writing straight to a socket.
    pub fn to_http_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n",
            self.status,
            reason_phrase(self.status),
            self.content_type,
            self.body.len()
        );
        if let Some(secs) = self.retry_after_secs {
            head.push_str(&format!("Retry-After: {secs}\r\n"));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Reads at most `buf.len()` bytes of a body whose declared length is
/// `declared_len`. Anything beyond the buffer is left unread; the returned
/// count is the length of the truncated prefix.
pub fn read_body<R: Read>(reader: &mut R, declared_len: usize, buf: &mut [u8]) -> io::Result<usize> {
    let want = declared_len.min(buf.len());
    let mut filled = 0;

    while filled < want {
        match reader.read(&mut buf[filled..want]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Finds the `led=on` / `led=off` pair in an urlencoded body.
pub fn parse_led_command(body: &[u8]) -> Option<LedCommand> {
    let body = String::from_utf8_lossy(body);
    body.trim()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == "led")
        .and_then(|(_, value)| match value.trim().to_ascii_lowercase().as_str() {
            "on" | "1" => Some(LedCommand::On),
            "off" | "0" => Some(LedCommand::Off),
            _ => None,
        })
}
