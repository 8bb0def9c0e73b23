use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("connection timed out")]
    Timeout,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("connection closed unexpectedly")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<tokio::time::error::Elapsed> for ConnectionError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

pub type Result<T> = std::result::Result<T, ConnectionError>;
