//! Common error types for the fba workspace.

use thiserror::Error;

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Canonical encoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid data.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}
