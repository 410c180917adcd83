use std::{io, sync::Arc};

/// Errors surfaced by the codec, the connection and the client library.
///
/// The type is `Clone` because the demultiplexer records a terminal read error
/// once and hands the same value to every waiter that comes after it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The peer sent bytes that do not form a valid frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The underlying stream failed.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// The peer closed the stream, or the connection was closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered with an `ERROR` reply.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// A reply arrived whose pairs do not match what its tag promises.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Error::MalformedFrame(reason.into())
    }

    /// True for errors that mean the connection is gone for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MalformedFrame(_) | Error::Io(_) | Error::ConnectionClosed
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
