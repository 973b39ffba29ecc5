//! In-memory stream with a scripted input half and a captured output
//! half. The workhorse of protocol tests: seed it with the bytes a peer
//! would send, run the code under test, inspect what was written.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};

use crate::error::{Error, ErrorKind, Result};
use crate::stream::{CloseHow, Stream};

struct Inner {
    input: Bytes,
    output: BytesMut,
    read_closed: bool,
    write_closed: bool,
    total_read: usize,
    total_written: usize,
    /// Fail reads once `total_read` reaches the threshold.
    fail_read: Option<(usize, ErrorKind)>,
    /// Fail writes once `total_written` reaches the threshold.
    fail_write: Option<(usize, ErrorKind)>,
}

/// A full-duplex in-memory stream.
pub struct MemoryStream {
    inner: Mutex<Inner>,
    /// Largest chunk a single read will return; lets tests exercise
    /// short-read handling.
    max_read: usize,
}

impl MemoryStream {
    pub fn new() -> MemoryStream {
        Self::with_input(Bytes::new())
    }

    /// A stream whose read half yields `input` and then EOF.
    pub fn with_input(input: impl Into<Bytes>) -> MemoryStream {
        MemoryStream {
            inner: Mutex::new(Inner {
                input: input.into(),
                output: BytesMut::new(),
                read_closed: false,
                write_closed: false,
                total_read: 0,
                total_written: 0,
                fail_read: None,
                fail_write: None,
            }),
            max_read: usize::MAX,
        }
    }

    /// Cap how many bytes a single `read` call returns.
    pub fn with_max_read(mut self, max_read: usize) -> MemoryStream {
        self.max_read = max_read.max(1);
        self
    }

    /// Append more scripted input (multi-phase tests).
    pub fn push_input(&self, data: impl Into<Bytes>) {
        let mut inner = self.lock();
        let mut all = BytesMut::with_capacity(inner.input.len());
        all.extend_from_slice(&inner.input);
        all.extend_from_slice(&data.into());
        inner.input = all.freeze();
    }

    /// Error every read once `after` total bytes have been read.
    pub fn fail_reads_after(&self, after: usize, kind: ErrorKind) {
        self.lock().fail_read = Some((after, kind));
    }

    /// Error every write once `after` total bytes have been written.
    pub fn fail_writes_after(&self, after: usize, kind: ErrorKind) {
        self.lock().fail_write = Some((after, kind));
    }

    /// Everything written so far.
    pub fn output(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock().output)
    }

    pub fn read_closed(&self) -> bool {
        self.lock().read_closed
    }

    pub fn write_closed(&self) -> bool {
        self.lock().write_closed
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for MemoryStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.lock();
        if inner.read_closed {
            return Err(Error::Closed);
        }
        if let Some((after, kind)) = inner.fail_read
            && inner.total_read >= after
        {
            return Err(kind.into());
        }
        if inner.input.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(inner.input.len()).min(self.max_read);
        let chunk = inner.input.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        inner.total_read += n;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut inner = self.lock();
        if inner.write_closed {
            return Err(Error::Closed);
        }
        if let Some((after, kind)) = inner.fail_write
            && inner.total_written + buf.len() > after
        {
            return Err(kind.into());
        }
        inner.output.extend_from_slice(buf);
        inner.total_written += buf.len();
        Ok(buf.len())
    }

    fn close(&self, how: CloseHow) -> Result<()> {
        let mut inner = self.lock();
        match how {
            CloseHow::Read => inner.read_closed = true,
            CloseHow::Write => inner.write_closed = true,
            CloseHow::Both => {
                inner.read_closed = true;
                inner.write_closed = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_input_then_eof() {
        let stream = MemoryStream::with_input(&b"hello"[..]);
        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn captures_writes() {
        let stream = MemoryStream::new();
        stream.write_all(b"abc").unwrap();
        stream.write_all(b"def").unwrap();
        assert_eq!(&stream.output()[..], b"abcdef");
    }

    #[test]
    fn max_read_shortens_reads() {
        let stream = MemoryStream::with_input(&b"abcdef"[..]).with_max_read(2);
        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
    }

    #[test]
    fn close_is_per_direction() {
        let stream = MemoryStream::with_input(&b"x"[..]);
        stream.close(CloseHow::Write).unwrap();
        assert!(matches!(stream.write(b"y"), Err(Error::Closed)));
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).unwrap(), 1);
        stream.close(CloseHow::Read).unwrap();
        assert!(matches!(stream.read(&mut buf), Err(Error::Closed)));
    }

    #[test]
    fn scripted_write_failure() {
        let stream = MemoryStream::new();
        stream.fail_writes_after(4, ErrorKind::Reset);
        assert_eq!(stream.write(b"abcd").unwrap(), 4);
        assert!(matches!(stream.write(b"e"), Err(Error::Reset)));
    }

    #[test]
    fn scripted_read_failure() {
        let stream = MemoryStream::with_input(&b"abcdef"[..]);
        stream.fail_reads_after(2, ErrorKind::Io);
        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert!(matches!(stream.read(&mut buf), Err(Error::Io(_))));
    }
}
