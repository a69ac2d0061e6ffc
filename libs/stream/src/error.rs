//! Stream adapter errors.

use std::io;

use thiserror::Error;

/// Errors raised by the packet adapters.
///
/// They travel inside `io::Error` so relays can stay on `io::Result`;
/// use [`StreamError::from_io`] to recover them.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The transport accepted fewer bytes than one chunk.
    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// The pipe or transport has been closed.
    #[error("pipe closed")]
    Closed,

    /// The pipe queue is full and the packet was not enqueued.
    #[error("pipe full")]
    Full,
}

impl StreamError {
    /// Find a `StreamError` carried by an `io::Error`.
    pub fn from_io(err: &io::Error) -> Option<&StreamError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<StreamError>())
    }

    /// Whether `err` is a short write.
    pub fn is_short_write(err: &io::Error) -> bool {
        matches!(Self::from_io(err), Some(StreamError::ShortWrite { .. }))
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match err {
            StreamError::ShortWrite { .. } => io::ErrorKind::WriteZero,
            StreamError::Closed => io::ErrorKind::BrokenPipe,
            StreamError::Full => io::ErrorKind::WouldBlock,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_write_roundtrips_through_io_error() {
        let err: io::Error = StreamError::ShortWrite {
            written: 3,
            expected: 5,
        }
        .into();

        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert!(StreamError::is_short_write(&err));
        assert_eq!(err.to_string(), "short write: wrote 3 of 5 bytes");
    }

    #[test]
    fn test_plain_io_error_is_not_stream_error() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(StreamError::from_io(&err).is_none());
        assert!(!StreamError::is_short_write(&err));
    }
}
