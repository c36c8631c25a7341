//! API Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The server loop failed
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    #[error("Invalid CORS origin: {0}")]
    InvalidOrigin(String),
}

pub type ApiResult<T> = Result<T, ApiError>;
