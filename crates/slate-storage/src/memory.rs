//! In-memory storage backend.
//!
//! Stores every bucket in a `BTreeMap` behind a single `RwLock`. It is not
//! persistent; all data is lost when the process exits. Each trait method
//! holds the lock for its whole duration, which gives the same
//! one-operation-one-transaction behaviour as the redb backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{Snapshot, StorageBackend, StorageError};

/// An in-memory storage backend backed by nested `BTreeMap`s.
///
/// Thread-safe and async-compatible. Clones share the same data.
///
/// # Examples
///
/// ```
/// # use slate_storage::{MemoryBackend, StorageBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// backend.put("content", "abc", b"data").await.unwrap();
/// let val = backend.get("content", "abc").await.unwrap();
/// assert_eq!(val, Some(b"data".to_vec()));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<Snapshot>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(bucket).and_then(|b| b.get(key)).cloned())
    }

    async fn put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.entry(bucket.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn replace(&self, bucket: &str, key: &str, value: &[u8]) -> Result<bool, StorageError> {
        let mut data = self.data.write().await;
        match data.get_mut(bucket).and_then(|b| b.get_mut(key)) {
            Some(slot) => {
                *slot = value.to_vec();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        if let Some(b) = data.get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    async fn scan(&self, bucket: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let data = self.data.read().await;
        Ok(data
            .get(bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn count(&self, bucket: &str) -> Result<usize, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(bucket).map_or(0, BTreeMap::len))
    }

    async fn buckets(&self) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        Ok(data.keys().cloned().collect())
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.entry(bucket.to_owned()).or_default();
        Ok(())
    }

    async fn snapshot(&self) -> Result<Snapshot, StorageError> {
        Ok(self.data.read().await.clone())
    }

    async fn restore(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        for (bucket, pairs) in snapshot {
            data.entry(bucket).or_default().extend(pairs);
        }
        Ok(())
    }

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(bucket).is_some_and(|b| b.contains_key(key)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_from_missing_bucket_returns_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("content", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_overwrites_existing() {
        let backend = MemoryBackend::new();
        backend.put("content", "key", b"v1").await.unwrap();
        backend.put("content", "key", b"v2").await.unwrap();
        let val = backend.get("content", "key").await.unwrap();
        assert_eq!(val, Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn buckets_are_independent() {
        let backend = MemoryBackend::new();
        backend.put("content", "key", b"a").await.unwrap();
        backend.put("settings", "key", b"b").await.unwrap();
        assert_eq!(backend.get("content", "key").await.unwrap(), Some(b"a".to_vec()));
        assert_eq!(backend.get("settings", "key").await.unwrap(), Some(b"b".to_vec()));
        assert_eq!(backend.get("users", "key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn replace_only_touches_existing_keys() {
        let backend = MemoryBackend::new();
        assert!(!backend.replace("content", "key", b"v1").await.unwrap());
        assert_eq!(backend.get("content", "key").await.unwrap(), None);

        backend.put("content", "key", b"v1").await.unwrap();
        assert!(backend.replace("content", "key", b"v2").await.unwrap());
        assert_eq!(backend.get("content", "key").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn delete_nonexistent_is_noop() {
        let backend = MemoryBackend::new();
        backend.delete("content", "nope").await.unwrap();
        backend.put("content", "key", b"val").await.unwrap();
        backend.delete("content", "key").await.unwrap();
        backend.delete("content", "key").await.unwrap();
        assert!(!backend.exists("content", "key").await.unwrap());
    }

    #[tokio::test]
    async fn scan_and_count_cover_one_bucket() {
        let backend = MemoryBackend::new();
        backend.put("content", "a", b"1").await.unwrap();
        backend.put("content", "b", b"2").await.unwrap();
        backend.put("users", "c", b"3").await.unwrap();

        let pairs = backend.scan("content").await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(backend.count("content").await.unwrap(), 2);
        assert_eq!(backend.count("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn create_bucket_shows_up_in_catalogue() {
        let backend = MemoryBackend::new();
        backend.create_bucket("settings").await.unwrap();
        backend.create_bucket("settings").await.unwrap();
        assert_eq!(backend.buckets().await.unwrap(), vec!["settings"]);
    }

    #[tokio::test]
    async fn restore_merges_without_dropping_other_keys() {
        let backend = MemoryBackend::new();
        backend.put("content", "keep", b"old").await.unwrap();
        backend.put("content", "over", b"old").await.unwrap();

        let mut snapshot = Snapshot::new();
        snapshot
            .entry("content".to_owned())
            .or_default()
            .insert("over".to_owned(), b"new".to_vec());
        snapshot.entry("users".to_owned()).or_default();
        backend.restore(snapshot).await.unwrap();

        assert_eq!(backend.get("content", "keep").await.unwrap(), Some(b"old".to_vec()));
        assert_eq!(backend.get("content", "over").await.unwrap(), Some(b"new".to_vec()));
        assert!(backend.buckets().await.unwrap().contains(&"users".to_owned()));
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put("content", "key", b"val").await.unwrap();
        assert_eq!(clone.get("content", "key").await.unwrap(), Some(b"val".to_vec()));
    }
}
