//! Framed HTTP message I/O over a [`Stream`].
//!
//! A [`Connection`] owns the transport plus a buffered reader for the
//! inbound direction. It parses status lines and header blocks, writes
//! serialized request heads, and is the substrate the body framing
//! views in [`body`](crate::body) operate on. The pipelining discipline
//! (who may read or write, and when) lives a layer up in
//! [`client`](crate::client).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mordor::stream::{BufferedReader, CloseHow, Stream};

use crate::body::{ChunkedWriter, FramedReader, Framing, IdentityWriter};
use crate::error::HttpError;
use crate::headers::{Headers, Version};
use crate::request::Request;
use crate::response::Response;

/// Longest accepted request/status/header line.
const MAX_LINE: usize = 16 * 1024;
/// Most header fields accepted in one block.
const MAX_FIELDS: usize = 128;

/// A transport plus inbound buffering for framed HTTP message I/O.
pub struct Connection {
    stream: Arc<dyn Stream>,
    reader: Mutex<BufferedReader>,
}

impl Connection {
    pub fn new(stream: Arc<dyn Stream>) -> Connection {
        Connection {
            reader: Mutex::new(BufferedReader::new(stream.clone())),
            stream,
        }
    }

    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }

    /// Exclusive access to the inbound reader. At most one message is
    /// parsed at a time; the pipelining layer guarantees a single
    /// reader, this mutex just keeps that assumption honest.
    pub(crate) fn reader(&self) -> MutexGuard<'_, BufferedReader> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize and send a request head.
    pub fn write_request_head(&self, request: &Request) -> Result<(), HttpError> {
        let head = request.serialize_head();
        self.stream.write_all(&head)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), HttpError> {
        self.stream.flush()?;
        Ok(())
    }

    pub fn close(&self, how: CloseHow) -> Result<(), HttpError> {
        self.stream.close(how)?;
        Ok(())
    }

    // ── body framing factories ──────────────────────────────────────────
    //
    // Views over this connection's inbound/outbound bytes whose EOF (or
    // completion) is the message boundary rather than the transport's.

    /// Read exactly `length` bytes of entity body.
    pub fn identity_reader(self: &Arc<Self>, length: u64) -> FramedReader {
        FramedReader::new(self.clone(), Framing::Identity(length))
    }

    /// Read a `Transfer-Encoding: chunked` body (and trailer).
    pub fn chunked_reader(self: &Arc<Self>) -> FramedReader {
        FramedReader::new(self.clone(), Framing::Chunked)
    }

    /// Read a body delimited by connection close.
    pub fn until_close_reader(self: &Arc<Self>) -> FramedReader {
        FramedReader::new(self.clone(), Framing::UntilClose)
    }

    /// Write exactly `length` bytes of entity body.
    pub fn identity_writer(self: &Arc<Self>, length: u64) -> IdentityWriter {
        IdentityWriter::new(self.clone(), length)
    }

    /// Write a chunked body.
    pub fn chunked_writer(self: &Arc<Self>) -> ChunkedWriter {
        ChunkedWriter::new(self.clone())
    }

    // ── head parsing ────────────────────────────────────────────────────

    /// Read and parse one status line.
    pub fn read_status_line(
        reader: &mut BufferedReader,
    ) -> Result<(Version, u16, String), HttpError> {
        let line = reader.read_line(MAX_LINE)?;
        parse_status_line(&line)
    }

    /// Read one header block up to and including the blank line.
    pub fn read_headers(reader: &mut BufferedReader) -> Result<Headers, HttpError> {
        let mut headers = Headers::new();
        loop {
            let line = reader.read_line(MAX_LINE)?;
            if line.is_empty() {
                return Ok(headers);
            }
            if headers.len() >= MAX_FIELDS {
                return Err(HttpError::Protocol("too many header fields".into()));
            }
            // Obsolete line folding (RFC 7230 §3.2.4) is rejected.
            if line[0] == b' ' || line[0] == b'\t' {
                return Err(HttpError::Protocol("folded header field".into()));
            }
            let line = std::str::from_utf8(&line)
                .map_err(|_| HttpError::Protocol("non-ASCII header field".into()))?;
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::Protocol(format!("malformed header field {line:?}")))?;
            if name.is_empty() || name.ends_with(' ') || name.ends_with('\t') {
                return Err(HttpError::Protocol(format!("malformed field name {name:?}")));
            }
            headers.add(name, value.trim());
        }
    }

    /// Read a full response head (status line plus headers).
    pub fn read_response_head(reader: &mut BufferedReader) -> Result<Response, HttpError> {
        let (version, status, reason) = Self::read_status_line(reader)?;
        let headers = Self::read_headers(reader)?;
        Ok(Response {
            version,
            status,
            reason,
            headers,
        })
    }
}

fn parse_status_line(line: &[u8]) -> Result<(Version, u16, String), HttpError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpError::Protocol("non-ASCII status line".into()))?;
    let mut parts = text.splitn(3, ' ');
    let version = parts
        .next()
        .and_then(Version::parse)
        .ok_or_else(|| HttpError::Protocol(format!("malformed status line {text:?}")))?;
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .filter(|s| (100..=599).contains(s))
        .ok_or_else(|| HttpError::Protocol(format!("malformed status code in {text:?}")))?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((version, status, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mordor::stream::MemoryStream;

    fn reader(input: &'static [u8]) -> BufferedReader {
        BufferedReader::new(Arc::new(MemoryStream::with_input(input)))
    }

    #[test]
    fn parses_status_line() {
        let (version, status, reason) = parse_status_line(b"HTTP/1.1 200 OK").unwrap();
        assert_eq!(version, Version::HTTP_11);
        assert_eq!(status, 200);
        assert_eq!(reason, "OK");
    }

    #[test]
    fn parses_status_line_without_reason() {
        let (_, status, reason) = parse_status_line(b"HTTP/1.1 204").unwrap();
        assert_eq!(status, 204);
        assert_eq!(reason, "");
    }

    #[test]
    fn rejects_bad_status_lines() {
        assert!(parse_status_line(b"ICY 200 OK").is_err());
        assert!(parse_status_line(b"HTTP/1.1 abc OK").is_err());
        assert!(parse_status_line(b"HTTP/1.1 42 tiny").is_err());
    }

    #[test]
    fn reads_header_block() {
        let mut r = reader(b"Content-Length: 5\r\nHost: example.com \r\n\r\n");
        let headers = Connection::read_headers(&mut r).unwrap();
        assert_eq!(headers.get("content-length"), Some("5"));
        assert_eq!(headers.get("Host"), Some("example.com"));
    }

    #[test]
    fn rejects_folded_headers() {
        let mut r = reader(b"Via: a\r\n b\r\n\r\n");
        assert!(matches!(
            Connection::read_headers(&mut r),
            Err(HttpError::Protocol(_))
        ));
    }

    #[test]
    fn rejects_space_before_colon() {
        let mut r = reader(b"Host : x\r\n\r\n");
        assert!(matches!(
            Connection::read_headers(&mut r),
            Err(HttpError::Protocol(_))
        ));
    }

    #[test]
    fn reads_full_response_head() {
        let mut r = reader(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n");
        let response = Connection::read_response_head(&mut r).unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.reason, "Not Found");
        assert_eq!(response.content_length(), Some(0));
    }
}
