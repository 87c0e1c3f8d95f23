//! Shared-mode content store.
//!
//! [`ContentStore`] wraps a storage backend the way every shared-mode request
//! sees it: one partition of content items plus the placeholder `settings`
//! and `users` partitions. Each operation is one backend transaction and, on
//! top of that, holds an application-level shared/exclusive lock for its full
//! duration: reads share, writes exclude everything.
//!
//! Lock acquisition is bounded. A stuck writer makes other requests fail
//! fast with [`ContentError::LockTimeout`] instead of parking them forever.
//! Nothing is retried here; callers may retry the whole request.
//!
//! There is no cross-operation transaction: a `get` followed by an `update`
//! of the same item races with other requests, and the last write wins.

use std::sync::Arc;
use std::time::Duration;

use slate_storage::StorageBackend;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::content::{CONTENT_BUCKET, Content, PARTITIONS};
use crate::envelope::ExportEnvelope;
use crate::error::ContentError;

/// Default bound on lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Transactional content store over a shared storage backend.
pub struct ContentStore {
    storage: Arc<dyn StorageBackend>,
    lock: RwLock<()>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl ContentStore {
    /// Wrap a storage backend with the default lock timeout.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self::with_lock_timeout(storage, DEFAULT_LOCK_TIMEOUT)
    }

    /// Wrap a storage backend with a custom lock timeout.
    #[must_use]
    pub fn with_lock_timeout(storage: Arc<dyn StorageBackend>, lock_timeout: Duration) -> Self {
        Self {
            storage,
            lock: RwLock::new(()),
            lock_timeout,
        }
    }

    /// Create the `content`, `settings` and `users` partitions if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Storage`] if a partition cannot be created.
    pub async fn ensure_partitions(&self) -> Result<(), ContentError> {
        let _guard = self.write("ensure_partitions").await?;
        for name in PARTITIONS {
            self.storage.create_bucket(name).await?;
        }
        Ok(())
    }

    /// Point lookup of an item's stored payload.
    ///
    /// Returns an owned copy, or `Ok(None)` when the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::LockTimeout`] or [`ContentError::Storage`].
    pub async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, ContentError> {
        let _guard = self.read("get").await?;
        Ok(self.storage.get(CONTENT_BUCKET, id).await?)
    }

    /// Decode every item in the content partition.
    ///
    /// A record that fails to decode is logged and skipped; the rest of the
    /// listing is still returned. Order is unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::LockTimeout`] or [`ContentError::Storage`].
    pub async fn list(&self) -> Result<Vec<Content>, ContentError> {
        let _guard = self.read("list").await?;
        let pairs = self.storage.scan(CONTENT_BUCKET).await?;
        let items = pairs
            .into_iter()
            .filter_map(|(key, bytes)| match Content::decode(&key, &bytes) {
                Ok(item) => Some(item),
                Err(e) => {
                    tracing::warn!(id = %key, error = %e, "skipping undecodable content record");
                    None
                }
            })
            .collect();
        Ok(items)
    }

    /// Number of items in the content partition.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::LockTimeout`] or [`ContentError::Storage`].
    pub async fn count(&self) -> Result<usize, ContentError> {
        let _guard = self.read("count").await?;
        Ok(self.storage.count(CONTENT_BUCKET).await?)
    }

    /// Unconditional upsert.
    ///
    /// No existence check is made: identifiers are 64 random bits, so a
    /// collision with a live item is not guarded against.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::LockTimeout`] or [`ContentError::Storage`].
    pub async fn create(&self, id: &str, payload: &[u8]) -> Result<(), ContentError> {
        let _guard = self.write("create").await?;
        self.storage.put(CONTENT_BUCKET, id, payload).await?;
        Ok(())
    }

    /// Upsert unless the partition already holds `limit` items.
    ///
    /// Count and insert happen under one exclusive lock, so concurrent
    /// creators cannot jointly overshoot the limit.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Capacity`] when the partition is full, or
    /// [`ContentError::LockTimeout`] / [`ContentError::Storage`].
    pub async fn insert_bounded(
        &self,
        id: &str,
        payload: &[u8],
        limit: usize,
    ) -> Result<(), ContentError> {
        let _guard = self.write("create").await?;
        let current = self.storage.count(CONTENT_BUCKET).await?;
        if current >= limit {
            return Err(ContentError::Capacity {
                limit,
                requested: current.saturating_add(1),
            });
        }
        self.storage.put(CONTENT_BUCKET, id, payload).await?;
        Ok(())
    }

    /// Overwrite an existing item.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::NotFound`] if the id is unknown, or
    /// [`ContentError::LockTimeout`] / [`ContentError::Storage`].
    pub async fn update(&self, id: &str, payload: &[u8]) -> Result<(), ContentError> {
        let _guard = self.write("update").await?;
        if self.storage.replace(CONTENT_BUCKET, id, payload).await? {
            Ok(())
        } else {
            Err(ContentError::NotFound { id: id.to_owned() })
        }
    }

    /// Delete an item. Deleting an unknown id succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::LockTimeout`] or [`ContentError::Storage`].
    pub async fn delete(&self, id: &str) -> Result<(), ContentError> {
        let _guard = self.write("delete").await?;
        self.storage.delete(CONTENT_BUCKET, id).await?;
        Ok(())
    }

    /// Snapshot every partition in one read transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::LockTimeout`] or [`ContentError::Storage`].
    /// Payloads that are not JSON are skipped, not reported.
    pub async fn export(&self) -> Result<ExportEnvelope, ContentError> {
        let snapshot = {
            let _guard = self.read("export").await?;
            self.storage.snapshot().await?
        };
        Ok(ExportEnvelope::from_snapshot(snapshot))
    }

    /// Merge an envelope into storage in one write transaction.
    ///
    /// Partitions are created as needed; listed keys are overwritten and
    /// unlisted keys are kept.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::LockTimeout`] or [`ContentError::Storage`];
    /// nothing is written on error.
    pub async fn import(&self, envelope: ExportEnvelope) -> Result<(), ContentError> {
        let snapshot = envelope.into_snapshot();
        let _guard = self.write("import").await?;
        self.storage.restore(snapshot).await?;
        Ok(())
    }

    /// [`import`](Self::import) unless the merged content partition would
    /// exceed `limit` items.
    ///
    /// The count and the merge happen under one exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Capacity`] when the merge would overshoot, or
    /// [`ContentError::LockTimeout`] / [`ContentError::Storage`]. Nothing is
    /// written on error.
    pub async fn import_bounded(
        &self,
        envelope: ExportEnvelope,
        limit: usize,
    ) -> Result<(), ContentError> {
        let snapshot = envelope.into_snapshot();
        let _guard = self.write("import").await?;
        if let Some(incoming) = snapshot.get(CONTENT_BUCKET) {
            let existing = self.storage.scan(CONTENT_BUCKET).await?;
            let added = incoming
                .keys()
                .filter(|key| !existing.iter().any(|(k, _)| k == *key))
                .count();
            let total = existing.len().saturating_add(added);
            if total > limit {
                return Err(ContentError::Capacity {
                    limit,
                    requested: total,
                });
            }
        }
        self.storage.restore(snapshot).await?;
        Ok(())
    }

    async fn read(&self, operation: &'static str) -> Result<RwLockReadGuard<'_, ()>, ContentError> {
        tokio::time::timeout(self.lock_timeout, self.lock.read())
            .await
            .map_err(|_| self.timed_out(operation))
    }

    async fn write(
        &self,
        operation: &'static str,
    ) -> Result<RwLockWriteGuard<'_, ()>, ContentError> {
        tokio::time::timeout(self.lock_timeout, self.lock.write())
            .await
            .map_err(|_| self.timed_out(operation))
    }

    fn timed_out(&self, operation: &'static str) -> ContentError {
        let waited_ms = u64::try_from(self.lock_timeout.as_millis()).unwrap_or(u64::MAX);
        tracing::error!(operation, waited_ms, "content store lock acquisition timed out");
        ContentError::LockTimeout {
            operation,
            waited_ms,
        }
    }
}
