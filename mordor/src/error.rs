use std::io;

use thiserror::Error;

/// Errors returned by the mordor runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// Fiber stack allocation failed.
    #[error("out of memory allocating fiber stack")]
    OutOfMemory,
    /// The target fiber is not in a state that permits the requested
    /// transfer (e.g. calling a fiber that is already executing).
    #[error("fiber is not schedulable: {0}")]
    NotSchedulable(&'static str),
    /// The stream was closed in the direction of the operation.
    #[error("stream closed")]
    Closed,
    /// The peer reset the connection.
    #[error("connection reset")]
    Reset,
    /// A layered timeout expired and tore down the stream.
    #[error("operation timed out")]
    Timeout,
    /// Any other I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Collapse to the wire-independent failure category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::OutOfMemory => ErrorKind::OutOfMemory,
            Error::NotSchedulable(_) => ErrorKind::NotSchedulable,
            Error::Closed => ErrorKind::Closed,
            Error::Reset => ErrorKind::Reset,
            Error::Timeout => ErrorKind::Timeout,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

/// Lightweight, copyable category for [`Error`].
///
/// Latched per-connection failures are stored as a kind and rehydrated
/// into a full error at each delivery site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    NotSchedulable,
    Closed,
    Reset,
    Timeout,
    Io,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        match kind {
            ErrorKind::OutOfMemory => Error::OutOfMemory,
            ErrorKind::NotSchedulable => Error::NotSchedulable("rehydrated"),
            ErrorKind::Closed => Error::Closed,
            ErrorKind::Reset => Error::Reset,
            ErrorKind::Timeout => Error::Timeout,
            ErrorKind::Io => Error::Io(io::Error::other("latched I/O failure")),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
