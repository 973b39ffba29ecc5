//! Pull-through read buffering with delimiter scanning.
//!
//! Protocol parsers need "read until CRLF" and "hand me the leftover
//! bytes after the headers"; [`BufferedReader`] provides both over any
//! [`Stream`] without copying more than once.

use bytes::{Buf, Bytes, BytesMut};

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::stream::Stream;

const READ_CHUNK: usize = 4096;

/// A reading adapter that buffers ahead on an underlying stream.
pub struct BufferedReader {
    stream: Arc<dyn Stream>,
    buf: BytesMut,
    eof: bool,
}

impl BufferedReader {
    pub fn new(stream: Arc<dyn Stream>) -> BufferedReader {
        BufferedReader {
            stream,
            buf: BytesMut::new(),
            eof: false,
        }
    }

    /// Read into `out`, serving buffered bytes first. `Ok(0)` is EOF.
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if self.buf.is_empty() {
            if self.eof {
                return Ok(0);
            }
            self.fill()?;
            if self.buf.is_empty() {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(n)
    }

    /// Read one `\r\n`-terminated line, returning it without the
    /// terminator. EOF before the terminator is [`Error::Closed`]; a
    /// line longer than `max` is an I/O error.
    pub fn read_line(&mut self, max: usize) -> Result<Bytes> {
        loop {
            if let Some(pos) = find_crlf(&self.buf) {
                let line = self.buf.split_to(pos).freeze();
                self.buf.advance(2);
                return Ok(line);
            }
            if self.buf.len() > max {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "line exceeds maximum length",
                )));
            }
            if self.eof {
                return Err(Error::Closed);
            }
            if self.fill()? == 0 {
                return Err(Error::Closed);
            }
        }
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Pull one chunk from the underlying stream into the buffer.
    /// Returns how many bytes arrived (0 at EOF).
    pub fn fill(&mut self) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(n)
    }

    /// Whether the underlying stream has reported EOF.
    pub fn saw_eof(&self) -> bool {
        self.eof
    }

    pub fn stream(&self) -> &Arc<dyn Stream> {
        &self.stream
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}
