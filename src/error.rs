//! Error types for the lstore storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Record not found: rid {0}")]
    RecordNotFound(u64),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
