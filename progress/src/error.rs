//! Error types for the `progress` crate.
//!
//! Follows the platform-wide pattern: a root `Error` struct holding an error
//! kind enum and an optional boxed source for chaining.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for the reliable progress channel.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors on the reliable channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The registry already holds the configured maximum of live connections.
    CapacityExceeded,
    /// A frame could not be accepted.
    Protocol(ProtocolErrorKind),
    /// Reading from or writing to a stream failed.
    Transport,
    /// The dispatch worker is gone and no longer accepts events.
    DispatcherClosed,
}

/// Errors caused by what a peer sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// The authentication record was not valid JSON.
    InvalidAuthMessage,
    /// The first record was valid JSON but not an `auth` record.
    ExpectedAuthMessage,
    /// No user identity was supplied.
    MissingUserId,
    /// A post-authentication record could not be parsed.
    InvalidFrame,
}

impl ErrorKind {
    /// Stable reason string sent to the peer in a negative acknowledgment.
    pub fn reason(&self) -> &'static str {
        match self {
            ErrorKind::CapacityExceeded => "server_at_capacity",
            ErrorKind::Protocol(ProtocolErrorKind::InvalidAuthMessage) => "invalid_auth_message",
            ErrorKind::Protocol(ProtocolErrorKind::ExpectedAuthMessage) => "expected_auth_message",
            ErrorKind::Protocol(ProtocolErrorKind::MissingUserId) => "missing_user_id",
            ErrorKind::Protocol(ProtocolErrorKind::InvalidFrame) => "invalid_frame",
            ErrorKind::Transport | ErrorKind::DispatcherClosed => "registration_failed",
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.error_kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "Progress error ({:?}): {source}", self.error_kind),
            None => write!(f, "Progress error: {:?}", self.error_kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Transport,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Protocol(ProtocolErrorKind::InvalidFrame),
        }
    }
}

/// Helper function to create protocol errors.
pub fn protocol_error(kind: ProtocolErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Protocol(kind),
    }
}

/// Helper function to create the capacity error.
pub fn capacity_error(max_connections: usize) -> Error {
    Error {
        source: Some(format!("limit of {max_connections} live connections reached").into()),
        error_kind: ErrorKind::CapacityExceeded,
    }
}

/// Helper function to create the error returned once the dispatch worker has stopped.
pub fn dispatcher_closed() -> Error {
    Error {
        source: None,
        error_kind: ErrorKind::DispatcherClosed,
    }
}
