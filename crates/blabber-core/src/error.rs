//! Error types for the Blabber speech pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O operation on closed accessor")]
    ClosedAccessor,

    #[error("Open read accessor already attached")]
    AlreadyAttached,

    #[error("Audio frame decode error: {0}")]
    Decode(String),

    #[error("Synthesis request failed with status {status}: {message}")]
    Synthesis { status: u16, message: String },

    #[error("Invalid synthesis request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Synthesis pool is shut down")]
    PoolShutdown,

    #[error("Synthesis worker panicked: {0}")]
    WorkerPanic(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Decode(e.to_string())
    }
}
