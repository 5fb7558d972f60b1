use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced across the persistence boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Database(format!("{err:#}"))
    }
}

/// Errors the `Cache` facade can return to callers.
///
/// Validation failures, corrupt rows, and unknown flags are never
/// represented here: they are control signals handled inline.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("imap error: {0}")]
    Imap(String),
}

impl CacheError {
    pub fn imap(err: impl std::fmt::Display) -> Self {
        CacheError::Imap(err.to_string())
    }
}
