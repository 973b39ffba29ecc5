//! Message body framing views.
//!
//! Per RFC 7230 §3.3.3 a body is identity-framed by `Content-Length`,
//! chunked, delimited by connection close, or absent. These views wrap a
//! [`Connection`] and bound their EOF at the message boundary — reading
//! past the framed end yields 0, never bytes of the next pipelined
//! message.

use std::sync::Arc;

use crate::conn::Connection;
use crate::error::HttpError;
use crate::headers::Headers;

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all (HEAD, 1xx, 204, 304, or `Content-Length: 0`).
    None,
    /// Exactly this many bytes.
    Identity(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// Body runs until the peer closes.
    UntilClose,
}

const MAX_LINE: usize = 16 * 1024;

enum ReadState {
    Empty,
    Identity { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    UntilClose,
    Done,
}

/// Reading view over one inbound message body.
pub struct FramedReader {
    conn: Arc<Connection>,
    state: ReadState,
    trailer: Option<Headers>,
}

impl FramedReader {
    pub(crate) fn new(conn: Arc<Connection>, framing: Framing) -> FramedReader {
        let state = match framing {
            Framing::None => ReadState::Empty,
            Framing::Identity(0) => ReadState::Empty,
            Framing::Identity(n) => ReadState::Identity { remaining: n },
            Framing::Chunked => ReadState::ChunkSize,
            Framing::UntilClose => ReadState::UntilClose,
        };
        FramedReader {
            conn,
            state,
            trailer: None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, ReadState::Empty | ReadState::Done)
    }

    /// Trailer fields read after the last chunk, once done.
    pub fn take_trailer(&mut self) -> Option<Headers> {
        self.trailer.take()
    }

    /// Read body bytes; `Ok(0)` is the end of this message's body.
    /// Transport EOF before the framed end is a `Closed` error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                ReadState::Empty | ReadState::Done => return Ok(0),
                ReadState::Identity { remaining } => {
                    let want = buf.len().min(remaining.min(usize::MAX as u64) as usize);
                    let n = self.conn.reader().read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(HttpError::Stream(mordor::Error::Closed));
                    }
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        ReadState::Done
                    } else {
                        ReadState::Identity { remaining: left }
                    };
                    return Ok(n);
                }
                ReadState::ChunkSize => {
                    let size = {
                        let mut reader = self.conn.reader();
                        let line = reader.read_line(MAX_LINE)?;
                        parse_chunk_size(&line)?
                    };
                    if size == 0 {
                        // Last chunk; a trailer block (possibly empty)
                        // follows, through its blank line.
                        let trailer = Connection::read_headers(&mut self.conn.reader())?;
                        if !trailer.is_empty() {
                            self.trailer = Some(trailer);
                        }
                        self.state = ReadState::Done;
                        return Ok(0);
                    }
                    self.state = ReadState::ChunkData { remaining: size };
                }
                ReadState::ChunkData { remaining } => {
                    let want = buf.len().min(remaining.min(usize::MAX as u64) as usize);
                    let n = self.conn.reader().read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(HttpError::Stream(mordor::Error::Closed));
                    }
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        ReadState::ChunkDataEnd
                    } else {
                        ReadState::ChunkData { remaining: left }
                    };
                    return Ok(n);
                }
                ReadState::ChunkDataEnd => {
                    let line = self.conn.reader().read_line(MAX_LINE)?;
                    if !line.is_empty() {
                        return Err(HttpError::Protocol("missing CRLF after chunk".into()));
                    }
                    self.state = ReadState::ChunkSize;
                }
                ReadState::UntilClose => {
                    let n = self.conn.reader().read(buf)?;
                    if n == 0 {
                        self.state = ReadState::Done;
                    }
                    return Ok(n);
                }
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, HttpError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpError::Protocol("non-ASCII chunk size".into()))?;
    // Chunk extensions (";key=value") are tolerated and ignored.
    let size = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| HttpError::Protocol(format!("malformed chunk size {text:?}")))
}

/// Writing view for an identity-framed (`Content-Length`) body.
pub struct IdentityWriter {
    conn: Arc<Connection>,
    remaining: u64,
}

impl IdentityWriter {
    pub(crate) fn new(conn: Arc<Connection>, length: u64) -> IdentityWriter {
        IdentityWriter {
            conn,
            remaining: length,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, HttpError> {
        if buf.len() as u64 > self.remaining {
            return Err(HttpError::Protocol(
                "body exceeds declared Content-Length".into(),
            ));
        }
        self.conn.stream().write_all(buf)?;
        self.remaining -= buf.len() as u64;
        Ok(buf.len())
    }
}

/// Writing view for a chunked body.
pub struct ChunkedWriter {
    conn: Arc<Connection>,
    finished: bool,
}

impl ChunkedWriter {
    pub(crate) fn new(conn: Arc<Connection>) -> ChunkedWriter {
        ChunkedWriter {
            conn,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, HttpError> {
        if self.finished {
            return Err(HttpError::Protocol("chunked body already finished".into()));
        }
        if buf.is_empty() {
            // An empty chunk would be the terminator; skip it.
            return Ok(0);
        }
        let mut frame = Vec::with_capacity(buf.len() + 16);
        frame.extend_from_slice(format!("{:X}\r\n", buf.len()).as_bytes());
        frame.extend_from_slice(buf);
        frame.extend_from_slice(b"\r\n");
        self.conn.stream().write_all(&frame)?;
        Ok(buf.len())
    }

    /// Emit the last chunk, the trailer (if any), and the final blank
    /// line.
    pub fn finish(&mut self, trailer: &Headers) -> Result<(), HttpError> {
        if self.finished {
            return Ok(());
        }
        let mut frame = Vec::with_capacity(32);
        frame.extend_from_slice(b"0\r\n");
        trailer.write_to(&mut frame);
        frame.extend_from_slice(b"\r\n");
        self.conn.stream().write_all(&frame)?;
        self.finished = true;
        Ok(())
    }
}
