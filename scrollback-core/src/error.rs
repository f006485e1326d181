//! Error types for scrollback-core

use thiserror::Error;

/// Main error type for the scrollback-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Parse error for agent transcripts (unreadable input)
    #[error("parse error in {agent} transcript: {message}")]
    Parse { agent: String, message: String },

    /// A record parsed but is semantically invalid
    #[error("corrupt record in {path}: {message}")]
    Corrupt { path: String, message: String },

    /// Invalid caller input (bad cursor, unknown agent, malformed filter)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Feature not compiled into the embedded database engine
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Entity absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation cancelled by the owner context
    #[error("cancelled")]
    Cancelled,

    /// Read deadline exceeded
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Configuration error (fatal at startup)
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True when the underlying IO error means the path no longer exists
    /// (the file is gone or a parent component is not a directory), as
    /// opposed to a transient failure such as a permission problem.
    pub fn is_missing_path(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
            ),
            _ => false,
        }
    }
}

/// Result type alias for scrollback-core
pub type Result<T> = std::result::Result<T, Error>;
