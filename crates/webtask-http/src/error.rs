use webtask::ClientError;

/// Errors raised while setting up the HTTP transport. Per-transfer failures
/// are reported to the client as [`webtask::TransportError`].
#[derive(Debug, thiserror::Error)]
pub enum HttpTransportError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Client(#[from] ClientError),
}

pub type HttpResult<T> = Result<T, HttpTransportError>;
