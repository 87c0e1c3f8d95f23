//! Storage backend abstraction for Slate.
//!
//! This crate defines the [`StorageBackend`] trait, a bucketed key-value
//! interface that knows nothing about content items, sessions, or HTTP. Keys
//! live inside named buckets (partitions); values are opaque byte arrays.
//!
//! Two implementations are provided:
//!
//! - [`RedbBackend`]: transactional, file-backed, built on redb (feature `redb-backend`)
//! - [`MemoryBackend`]: in-memory, for tests and throwaway deployments

use std::collections::BTreeMap;

mod error;
mod memory;
#[cfg(feature = "redb-backend")]
mod redb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;

/// A point-in-time copy of every bucket: bucket name → key → value.
pub type Snapshot = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// A pluggable, bucketed key-value storage backend.
///
/// Every method runs as a single transaction of the underlying engine, so
/// callers observe each operation atomically. Nothing spans two calls: a
/// `get` followed by a `put` is two transactions.
///
/// A bucket that has never been created behaves as an empty bucket on the
/// read path. Writes create the bucket on demand.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key (or the whole bucket) does not exist.
    /// The returned bytes are an owned copy.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Overwrite a key only if it already exists.
    ///
    /// Returns `Ok(false)` and writes nothing when the key is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn replace(&self, bucket: &str, key: &str, value: &[u8]) -> Result<bool, StorageError>;

    /// Delete a key. This is idempotent; deleting a non-existent key is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError>;

    /// Return every key-value pair in a bucket.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn scan(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    /// Count the keys in a bucket.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn count(&self, bucket: &str) -> Result<usize, StorageError>;

    /// List the names of all existing buckets.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn buckets(&self) -> Result<Vec<String>, StorageError>;

    /// Create a bucket if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingTable`] or [`StorageError::Transaction`]
    /// if the bucket cannot be created.
    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Copy every bucket and every pair inside one read transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] or [`StorageError::Transaction`] if the
    /// underlying backend fails.
    async fn snapshot(&self) -> Result<Snapshot, StorageError>;

    /// Merge a snapshot into storage inside one write transaction.
    ///
    /// Buckets are created as needed and every listed key is overwritten.
    /// Keys not mentioned in the snapshot are left untouched. Concurrent
    /// readers see either none or all of the merge.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] or [`StorageError::Transaction`] if the
    /// underlying backend fails; nothing is committed in that case.
    async fn restore(&self, snapshot: Snapshot) -> Result<(), StorageError>;

    /// Check whether a key exists in a bucket.
    ///
    /// The default implementation calls [`get`](StorageBackend::get) and checks
    /// for `Some`. Backends may override this with a more efficient check.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(bucket, key).await?.is_some())
    }
}
