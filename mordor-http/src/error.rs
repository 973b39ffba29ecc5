use thiserror::Error;

/// Errors produced by the HTTP client.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The connection no longer admits new requests.
    #[error("connection is closing; no new requests accepted")]
    ConnectionClosing,

    /// This request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The connection was torn down with `cancel(abort)`.
    #[error("connection aborted")]
    Aborted,

    /// An earlier request on the same connection side failed first.
    #[error("a prior request on this connection failed")]
    PriorRequestFailed,

    /// Malformed headers or framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport failure.
    #[error(transparent)]
    Stream(#[from] mordor::Error),
}

impl HttpError {
    /// Map to a [`mordor::Error`] for delivery through the plain
    /// [`Stream`](mordor::Stream) trait; the original error rides along
    /// as the source of an I/O error.
    pub fn into_stream_error(self) -> mordor::Error {
        match self {
            HttpError::Stream(err) => err,
            other => mordor::Error::Io(std::io::Error::other(other)),
        }
    }
}

/// Latched failure state for one side of a connection.
///
/// Stored once per side and rehydrated into an [`HttpError`] at every
/// delivery site; a tagged value keeps room for richer failure detail
/// without committing the latch to one concrete error type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FailureKind {
    Stream(mordor::ErrorKind),
    Cancelled,
    Aborted,
    ConnectionClosing,
    PriorRequestFailed,
    Protocol(String),
}

impl FailureKind {
    pub(crate) fn of(err: &HttpError) -> FailureKind {
        match err {
            HttpError::ConnectionClosing => FailureKind::ConnectionClosing,
            HttpError::Cancelled => FailureKind::Cancelled,
            HttpError::Aborted => FailureKind::Aborted,
            HttpError::PriorRequestFailed => FailureKind::PriorRequestFailed,
            HttpError::Protocol(msg) => FailureKind::Protocol(msg.clone()),
            HttpError::Stream(err) => FailureKind::Stream(err.kind()),
        }
    }

    pub(crate) fn rehydrate(&self) -> HttpError {
        match self {
            FailureKind::Stream(kind) => HttpError::Stream((*kind).into()),
            FailureKind::Cancelled => HttpError::Cancelled,
            FailureKind::Aborted => HttpError::Aborted,
            FailureKind::ConnectionClosing => HttpError::ConnectionClosing,
            FailureKind::PriorRequestFailed => HttpError::PriorRequestFailed,
            FailureKind::Protocol(msg) => HttpError::Protocol(msg.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_round_trip() {
        let err = HttpError::Stream(mordor::Error::Reset);
        let kind = FailureKind::of(&err);
        assert!(matches!(
            kind.rehydrate(),
            HttpError::Stream(mordor::Error::Reset)
        ));
        assert!(matches!(
            FailureKind::of(&HttpError::Aborted).rehydrate(),
            HttpError::Aborted
        ));
    }

    #[test]
    fn stream_error_mapping_preserves_source() {
        let err = HttpError::Aborted.into_stream_error();
        let mordor::Error::Io(io_err) = err else {
            panic!("expected Io");
        };
        let source = io_err.get_ref().expect("source");
        assert!(source.downcast_ref::<HttpError>().is_some());
    }
}
