//! Blocking TCP transport behind the [`Stream`] trait.
//!
//! A thin adapter over `std::net::TcpStream`: reads and writes block the
//! worker thread rather than suspending the fiber, which is acceptable
//! for tools and examples. Half-close maps to `shutdown()` per
//! direction.

use std::io::{Read, Write};
use std::net::{Shutdown, ToSocketAddrs};

use crate::error::{Error, Result};
use crate::stream::{CloseHow, Stream};

/// A connected TCP stream.
pub struct TcpStream {
    inner: std::net::TcpStream,
}

impl TcpStream {
    /// Connect to the first resolvable address.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<TcpStream> {
        let inner = std::net::TcpStream::connect(addr).map_err(map_io)?;
        inner.set_nodelay(true).map_err(map_io)?;
        Ok(TcpStream { inner })
    }

    pub fn from_std(inner: std::net::TcpStream) -> TcpStream {
        TcpStream { inner }
    }

    pub fn peer_addr(&self) -> Result<std::net::SocketAddr> {
        self.inner.peer_addr().map_err(map_io)
    }
}

impl Stream for TcpStream {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        (&self.inner).read(buf).map_err(map_io)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        (&self.inner).write(buf).map_err(map_io)
    }

    fn close(&self, how: CloseHow) -> Result<()> {
        let how = match how {
            CloseHow::Read => Shutdown::Read,
            CloseHow::Write => Shutdown::Write,
            CloseHow::Both => Shutdown::Both,
        };
        match self.inner.shutdown(how) {
            Ok(()) => Ok(()),
            // Already gone; closing an errored socket is not an error.
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(map_io(err)),
        }
    }

    fn flush(&self) -> Result<()> {
        (&self.inner).flush().map_err(map_io)
    }
}

fn map_io(err: std::io::Error) -> Error {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            Error::Reset
        }
        ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::Timeout,
        ErrorKind::NotConnected => Error::Closed,
        _ => Error::Io(err),
    }
}
