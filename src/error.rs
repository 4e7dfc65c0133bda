//! mtuned Error Types

use thiserror::Error;

/// Result type alias for mtuned operations
pub type Result<T> = std::result::Result<T, Error>;

/// mtuned error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] ini::Error),

    // Database errors (recoverable; the current iteration aborts)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // External-tool output that could not be understood
    #[error("Parse error: {0}")]
    Parse(String),

    // Subprocess failures (feature degrades)
    #[error("Subprocess error: {0}")]
    Subprocess(String),

    // Notification delivery errors (record not updated, next send retries)
    #[error("Notification error: {0}")]
    Notify(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
