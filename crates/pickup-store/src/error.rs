use pickup_core::CapacityExceeded;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Sqlite(tokio_rusqlite::Error),
    #[error(transparent)]
    CapacityExceeded(#[from] CapacityExceeded),
    #[error("unknown guardian: {0}")]
    UnknownGuardian(String),
    #[error("unknown child: {0}")]
    UnknownChild(String),
    #[error("record id already exists: {0}")]
    DuplicateId(String),
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::ConnectionClosed => {
                StoreError::Unavailable("database connection closed".into())
            }
            other => StoreError::Sqlite(other),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(tokio_rusqlite::Error::Rusqlite(err))
    }
}

/// Domain rejection raised inside a transaction. The transaction is rolled
/// back and the rejection surfaces as the matching [`StoreError`].
#[derive(Debug)]
pub(crate) enum Rejected {
    Capacity(CapacityExceeded),
    UnknownGuardian(String),
    UnknownChild(String),
    Duplicate(String),
}

impl From<Rejected> for StoreError {
    fn from(rejected: Rejected) -> Self {
        match rejected {
            Rejected::Capacity(err) => StoreError::CapacityExceeded(err),
            Rejected::UnknownGuardian(id) => StoreError::UnknownGuardian(id),
            Rejected::UnknownChild(id) => StoreError::UnknownChild(id),
            Rejected::Duplicate(id) => StoreError::DuplicateId(id),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
