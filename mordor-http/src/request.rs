//! HTTP request heads.

use crate::headers::{Headers, Version};

/// A parsed request head: request line plus header fields.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
}

impl Request {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Request {
        Request {
            method: method.into(),
            uri: uri.into(),
            version: Version::HTTP_11,
            headers: Headers::new(),
        }
    }

    pub fn get(uri: impl Into<String>) -> Request {
        Request::new("GET", uri)
    }

    pub fn head(uri: impl Into<String>) -> Request {
        Request::new("HEAD", uri)
    }

    pub fn post(uri: impl Into<String>) -> Request {
        Request::new("POST", uri)
    }

    /// Builder-style header append.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Request {
        self.headers.add(name, value);
        self
    }

    /// Declared body framing: a body exists when `Transfer-Encoding`
    /// is present or `Content-Length` is nonzero.
    pub fn has_body(&self) -> bool {
        if self.headers.contains("Transfer-Encoding") {
            return true;
        }
        matches!(self.content_length(), Some(n) if n > 0)
    }

    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("Transfer-Encoding", "chunked")
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers.get("Content-Length")?.trim().parse().ok()
    }

    pub fn expects_continue(&self) -> bool {
        self.headers.has_token("Expect", "100-continue")
    }

    /// Serialize the request line and headers, including the terminating
    /// blank line.
    pub(crate) fn serialize_head(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.uri.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out
    }
}
