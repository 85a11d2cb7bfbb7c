use std::path::PathBuf;

use crate::transport::TransferId;

/// Errors raised while assembling a client or a task, before any transfer
/// exists. Failures that happen once a transfer is in flight are reported
/// through [`TaskError`] instead.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Errors reported by a transport for a single transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transfer cancelled")]
    Cancelled,

    #[error("transfer timed out: {0}")]
    TimedOut(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport invalidated")]
    Invalidated,

    #[error("transport IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

/// Errors raised while moving a downloaded file to its durable location.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelocationError {
    #[error("failed to relocate {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("transient location {0} has no file name")]
    MissingFileName(PathBuf),

    #[error("relocation did not finish within {0}ms")]
    TimedOut(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("transfer {0} is already registered")]
    Duplicate(TransferId),
}

/// The failure cause carried by [`Outcome::Failure`](crate::Outcome::Failure).
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("response body is empty")]
    EmptyBody,

    #[error("relocation error: {0}")]
    Relocation(#[from] RelocationError),

    #[error("no downloaded file is available")]
    MissingFile,

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("owning client has been released")]
    ClientReleased,

    #[error("{0}")]
    Domain(String),
}

impl TaskError {
    /// Create a handler-reported domain error
    pub fn domain(message: impl Into<String>) -> Self {
        TaskError::Domain(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Transport(TransportError::Cancelled))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Decode(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}
