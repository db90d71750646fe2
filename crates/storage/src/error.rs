use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    /// Error returned by the LMDB environment or a transaction
    #[error("lmdb error: {0}")]
    Lmdb(#[from] lmdb::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes could not be interpreted
    #[error("corrupted entry at key {key}: {reason}")]
    Corrupted {
        key: String,
        reason: String,
    },
}
