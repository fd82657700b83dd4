//! Error types for the RTSP control-plane library.

use std::fmt;

/// Errors that can occur in the RTSP control-plane library.
///
/// Protocol-level failures (bad request line, unknown stream, unsupported
/// transport, ...) never surface here: they are translated into RTSP
/// responses inside the command handler. This enum covers the failures a
/// caller of the library API can actually see.
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// The method token was not an ASCII uppercase word.
    InvalidMethod,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidMethod => write!(f, "invalid method token"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
