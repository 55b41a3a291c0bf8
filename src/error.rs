//! Error types for the weft engine.

use std::io;

use crate::frame::ErrorCode;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the application.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A connection-scope protocol fault, local or remote. The connection
    /// is being torn down with a GOAWAY carrying `code`.
    #[error("connection error {code:?}: {reason}")]
    Connection { code: ErrorCode, reason: String },

    /// The stream was reset, by either endpoint.
    #[error("stream {id} reset: {code:?}")]
    Reset { id: u32, code: ErrorCode },

    /// The connection is closed; no further stream operations are possible.
    #[error("connection closed: {code:?}")]
    Closed { code: ErrorCode },

    /// An application-supplied header list failed validation before any
    /// bytes were framed.
    #[error("malformed header list: {0}")]
    MalformedHeader(String),

    /// A stream operation was used out of order (e.g. data before headers).
    #[error("invalid stream usage: {0}")]
    InvalidUsage(&'static str),

    /// Transport IO failure. Fatal to the connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl From<crate::headers::InvalidHeader> for Error {
    fn from(e: crate::headers::InvalidHeader) -> Self {
        Error::MalformedHeader(e.0.to_string())
    }
}

impl Error {
    pub(crate) fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Connection {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn reset(id: u32, code: ErrorCode) -> Self {
        Self::Reset { id, code }
    }

    pub(crate) fn closed(code: ErrorCode) -> Self {
        Self::Closed { code }
    }
}

/// Fault classification per RFC 7540 section 5.4: every detected
/// protocol violation is either stream-scope (RST_STREAM, connection
/// survives) or connection-scope (GOAWAY, connection dies). The typed
/// frame parsers in [`crate::wire`] report their findings in these terms.
#[derive(Debug)]
pub enum ProtoError {
    Connection { code: ErrorCode, reason: String },
    Stream { id: u32, code: ErrorCode },
}

impl ProtoError {
    pub(crate) fn conn(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Connection {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn stream(id: u32, code: ErrorCode) -> Self {
        Self::Stream { id, code }
    }
}

impl From<ProtoError> for Error {
    fn from(e: ProtoError) -> Self {
        match e {
            ProtoError::Connection { code, reason } => Error::Connection { code, reason },
            ProtoError::Stream { id, code } => Error::Reset { id, code },
        }
    }
}
