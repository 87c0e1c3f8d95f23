//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open the storage backend at the given path.
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// Failed to read a value from storage.
    #[error("failed to read '{bucket}/{key}': {reason}")]
    Read {
        bucket: String,
        key: String,
        reason: String,
    },

    /// Failed to write a value to storage.
    #[error("failed to write '{bucket}/{key}': {reason}")]
    Write {
        bucket: String,
        key: String,
        reason: String,
    },

    /// Failed to delete a key from storage.
    #[error("failed to delete '{bucket}/{key}': {reason}")]
    Delete {
        bucket: String,
        key: String,
        reason: String,
    },

    /// Failed to iterate a bucket or the bucket catalogue.
    #[error("failed to list bucket '{bucket}': {reason}")]
    List { bucket: String, reason: String },

    /// A bucket could not be opened or created.
    #[error("missing or unusable bucket '{name}'")]
    MissingTable { name: String },

    /// Failed to begin or commit a transaction.
    #[error("transaction failed: {reason}")]
    Transaction { reason: String },

    /// A stored key contained invalid UTF-8.
    #[error("invalid key encoding: {reason}")]
    InvalidKey { reason: String },
}
