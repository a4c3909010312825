use thiserror::Error;

/// Errors surfaced by blockstore operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    #[error("bad extent: {0}")]
    BadExtent(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Programmer error caught at an API boundary, distinct from anything a
    /// user could cause through input.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
