use std::time::Duration;
use thiserror::Error;

/// Broad category of an [`HsError`], used to decide who handles it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller misuse, detected before any I/O.
    Argument,
    /// The server (or the client on its behalf) rejected the operation.
    Protocol,
    /// The byte stream could not be parsed; fatal to the owning session.
    Frame,
    /// Transport-level failure, timeout or shutdown.
    Connection,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HsError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Index {0} has not been opened")]
    IndexNotOpened(i32),

    #[error("Index {id} is already bound to {existing}")]
    IndexConflict { id: i32, existing: String },

    #[error("Server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("No ready session available, reconnection in progress")]
    Unavailable,

    #[error("Connection permanently failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Client has been shut down")]
    Shutdown,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type HsResult<T> = Result<T, HsError>;

impl HsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HsError::InvalidArgument(_) | HsError::Config(_) => ErrorKind::Argument,
            HsError::IndexNotOpened(_) | HsError::IndexConflict { .. } | HsError::Server { .. } => {
                ErrorKind::Protocol
            }
            HsError::Frame(_) => ErrorKind::Frame,
            HsError::Connect(_)
            | HsError::ConnectionLost(_)
            | HsError::Unavailable
            | HsError::ConnectionFailed(_)
            | HsError::Timeout(_)
            | HsError::Shutdown => ErrorKind::Connection,
        }
    }

    /// True when the session that produced this error cannot continue and
    /// must be replaced.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, HsError::Frame(_))
    }

    /// True for connection errors the reconnect supervisor is still working
    /// on; a later call may succeed without any caller intervention.
    pub fn is_retrying(&self) -> bool {
        matches!(
            self,
            HsError::ConnectionLost(_) | HsError::Unavailable | HsError::Timeout(_)
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        HsError::InvalidArgument(msg.into())
    }

    pub(crate) fn frame(msg: impl Into<String>) -> Self {
        HsError::Frame(msg.into())
    }
}

impl From<std::io::Error> for HsError {
    fn from(err: std::io::Error) -> Self {
        HsError::ConnectionLost(err.to_string())
    }
}
