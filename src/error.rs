//! Error types for the spindle crate.

use crate::frame::{GoAwayStatus, StreamStatus};

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while multiplexing a session.
///
/// The protocol distinguishes two scopes: stream-local errors terminate a
/// single stream (and are answered with RST_STREAM on the wire), while
/// session errors terminate the whole connection (GOAWAY).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Fatal framing error; the byte stream can no longer be decoded.
    #[error("frame error: {0}")]
    Frame(String),

    /// A single stream was terminated with the given status.
    #[error("stream {id} error: {status:?}")]
    Stream { id: u32, status: StreamStatus },

    /// The session was terminated with the given status.
    #[error("session error ({status:?}): {reason}")]
    Session {
        status: GoAwayStatus,
        reason: String,
    },

    /// Transport I/O error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// The session is closed (or closed underneath an in-flight request).
    #[error("session closed: {0}")]
    Closed(String),

    /// A URL that cannot name an origin.
    #[error("invalid origin url: {0}")]
    InvalidUrl(String),

    /// The request was canceled before completion.
    #[error("request canceled")]
    Canceled,
}

impl Error {
    /// Create a fatal framing error.
    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame(message.into())
    }

    /// Create a stream-scoped error.
    pub fn stream(id: u32, status: StreamStatus) -> Self {
        Self::Stream { id, status }
    }

    /// Create a session-scoped error.
    pub fn session(status: GoAwayStatus, reason: impl Into<String>) -> Self {
        Self::Session {
            status,
            reason: reason.into(),
        }
    }

    /// Create a session-closed error.
    pub fn closed(message: impl Into<String>) -> Self {
        Self::Closed(message.into())
    }
}
