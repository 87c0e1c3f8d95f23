//! Packaged seed dataset.
//!
//! The seed is read once at startup. Two encodings are accepted: a binary
//! redb database file, or an export envelope. A redb snapshot is written to
//! a private temporary directory, opened read-only through
//! [`RedbBackend::open_existing`], copied out, and the directory removed.
//!
//! Session mode wants the seed as an in-memory [`ContentSet`]
//! ([`load_content_map`]); shared mode wants a live writable store holding
//! the same records ([`load_into_store`]). A record that fails to decode is
//! logged and skipped. A seed that cannot be read at all is fatal.

use std::sync::Arc;
use std::time::Duration;

use slate_storage::{RedbBackend, Snapshot, StorageBackend};

use crate::content::{CONTENT_BUCKET, Content, ContentSet, PARTITIONS};
use crate::envelope::ExportEnvelope;
use crate::error::SeedError;
use crate::store::ContentStore;

/// File name used for an extracted snapshot inside its scratch directory.
const SNAPSHOT_FILE: &str = "seed.redb";

/// Raw seed bytes and how to interpret them.
#[derive(Debug, Clone, Copy)]
pub enum SeedSource<'a> {
    /// A complete redb database file.
    Snapshot(&'a [u8]),
    /// An export envelope document.
    Envelope(&'a [u8]),
}

impl<'a> SeedSource<'a> {
    /// Pick an interpretation from the bytes themselves: anything that
    /// starts like a JSON object is an envelope, the rest a snapshot.
    #[must_use]
    pub fn detect(bytes: &'a [u8]) -> Self {
        match bytes.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => Self::Envelope(bytes),
            _ => Self::Snapshot(bytes),
        }
    }
}

/// Read the seed's content partition into memory.
///
/// A seed without a content partition yields an empty set.
///
/// # Errors
///
/// Returns [`SeedError`] if the seed as a whole cannot be read.
pub async fn load_content_map(source: SeedSource<'_>) -> Result<ContentSet, SeedError> {
    let snapshot = read_snapshot(source).await?;
    let Some(records) = snapshot.get(CONTENT_BUCKET) else {
        tracing::warn!("seed has no content partition, starting empty");
        return Ok(ContentSet::new());
    };
    let set: ContentSet = records
        .iter()
        .filter_map(|(key, bytes)| decode_record(key, bytes))
        .map(|item| (item.id.clone(), item))
        .collect();
    tracing::info!(items = set.len(), "seed content loaded");
    Ok(set)
}

/// Populate `storage` with the seed and wrap it as a shared-mode store.
///
/// All three partitions exist afterwards, even if the seed lacks some.
/// Undecodable content records are left out.
///
/// # Errors
///
/// Returns [`SeedError`] if the seed cannot be read or `storage` cannot be
/// written.
pub async fn load_into_store(
    source: SeedSource<'_>,
    storage: Arc<dyn StorageBackend>,
    lock_timeout: Duration,
) -> Result<ContentStore, SeedError> {
    let mut snapshot = read_snapshot(source).await?;
    if let Some(records) = snapshot.get_mut(CONTENT_BUCKET) {
        records.retain(|key, bytes| decode_record(key, bytes).is_some());
    }
    let items = snapshot.get(CONTENT_BUCKET).map_or(0, |r| r.len());

    for name in PARTITIONS {
        storage.create_bucket(name).await?;
    }
    storage.restore(snapshot).await?;
    tracing::info!(items, "seed copied into shared store");
    Ok(ContentStore::with_lock_timeout(storage, lock_timeout))
}

fn decode_record(key: &str, bytes: &[u8]) -> Option<Content> {
    match Content::decode(key, bytes) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::warn!(id = %key, error = %e, "skipping undecodable seed record");
            None
        }
    }
}

async fn read_snapshot(source: SeedSource<'_>) -> Result<Snapshot, SeedError> {
    match source {
        SeedSource::Envelope(bytes) => ExportEnvelope::parse(bytes)
            .map(ExportEnvelope::into_snapshot)
            .map_err(|e| SeedError::Malformed {
                reason: e.to_string(),
            }),
        SeedSource::Snapshot(bytes) => read_redb_snapshot(bytes).await,
    }
}

async fn read_redb_snapshot(bytes: &[u8]) -> Result<Snapshot, SeedError> {
    let scratch = tempfile::Builder::new()
        .prefix("slate-seed-")
        .tempdir()
        .map_err(|e| SeedError::Extract {
            reason: format!("failed to create scratch directory: {e}"),
        })?;
    let path = scratch.path().join(SNAPSHOT_FILE);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| SeedError::Extract {
            reason: format!("failed to write {}: {e}", path.display()),
        })?;

    let backend = tokio::task::spawn_blocking(move || RedbBackend::open_existing(path))
        .await
        .map_err(|e| SeedError::Extract {
            reason: format!("snapshot open task failed: {e}"),
        })??;
    let snapshot = backend.snapshot().await?;
    drop(backend);

    if let Err(e) = scratch.close() {
        tracing::warn!(error = %e, "failed to remove seed scratch directory");
    }
    Ok(snapshot)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::content::prepare_new;
    use chrono::Utc;
    use serde_json::json;
    use slate_storage::MemoryBackend;

    fn payload(title: &str, id: &str) -> Vec<u8> {
        let body = json!({ "title": title }).as_object().cloned().unwrap();
        prepare_new(body, id, Utc::now()).unwrap().payload
    }

    /// Build a real redb file and return its bytes.
    async fn redb_bytes(records: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.redb");
        {
            let backend = RedbBackend::open(&path).unwrap();
            for (key, bytes) in records {
                backend.put(CONTENT_BUCKET, key, bytes).await.unwrap();
            }
        }
        std::fs::read(&path).unwrap()
    }

    #[test]
    fn detect_prefers_envelope_for_json_objects() {
        assert!(matches!(SeedSource::detect(b"  {\"content\":{}}"), SeedSource::Envelope(_)));
        assert!(matches!(SeedSource::detect(b"\x00redb"), SeedSource::Snapshot(_)));
    }

    #[tokio::test]
    async fn content_map_from_redb_snapshot() {
        let bytes = redb_bytes(&[("a", payload("Alpha", "a")), ("b", payload("Beta", "b"))]).await;
        let set = load_content_map(SeedSource::Snapshot(&bytes)).await.unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set["a"].title, "Alpha");
    }

    #[tokio::test]
    async fn bad_records_are_skipped() {
        let bytes = redb_bytes(&[("a", payload("Alpha", "a")), ("junk", b"nope".to_vec())]).await;
        let set = load_content_map(SeedSource::Snapshot(&bytes)).await.unwrap();
        assert_eq!(set.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn garbage_snapshot_is_fatal() {
        let result = load_content_map(SeedSource::Snapshot(b"definitely not redb")).await;
        assert!(matches!(result, Err(SeedError::Storage(_))));
    }

    #[tokio::test]
    async fn malformed_envelope_is_fatal() {
        let result = load_content_map(SeedSource::Envelope(b"{\"content\": [")).await;
        assert!(matches!(result, Err(SeedError::Malformed { .. })));
    }

    #[tokio::test]
    async fn envelope_without_content_is_empty() {
        let set = load_content_map(SeedSource::Envelope(br#"{"settings":{}}"#)).await.unwrap();
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn load_into_store_creates_every_partition() {
        let mut envelope = ExportEnvelope::default();
        envelope.insert(CONTENT_BUCKET, "a", payload("Alpha", "a")).unwrap();
        envelope.insert(CONTENT_BUCKET, "junk", b"[1]".to_vec()).unwrap();
        let bytes = envelope.to_vec().unwrap();

        let backend = Arc::new(MemoryBackend::new());
        let store = load_into_store(
            SeedSource::Envelope(&bytes),
            backend.clone(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let mut buckets = backend.buckets().await.unwrap();
        buckets.sort();
        let mut expected: Vec<String> = PARTITIONS.iter().map(ToString::to_string).collect();
        expected.sort();
        assert_eq!(buckets, expected);
    }
}
