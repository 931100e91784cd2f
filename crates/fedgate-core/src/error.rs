use thiserror::Error;

/// Errors produced by the federation protocol layer.
#[derive(Debug, Error)]
pub enum FedError {
    #[error("xml error: {0}")]
    Xml(String),

    #[error("invalid stream header: {0}")]
    InvalidStream(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("dialback failed: {0}")]
    DialbackFailed(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type FedResult<T> = Result<T, FedError>;
