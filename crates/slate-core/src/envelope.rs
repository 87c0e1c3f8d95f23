//! Export envelope: the bulk backup and restore format.
//!
//! A JSON object keyed by partition name, each value a JSON object keyed by
//! item identifier whose values are the stored payloads, embedded verbatim.
//! Payloads are carried as [`RawValue`] so an export followed by an import
//! writes back byte-identical values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use slate_storage::Snapshot;

use crate::content::CONTENT_BUCKET;
use crate::error::ContentError;

/// Items of one partition, keyed by identifier.
pub type Partition = BTreeMap<String, Box<RawValue>>;

/// Partition name → identifier → raw stored payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportEnvelope {
    partitions: BTreeMap<String, Partition>,
}

impl ExportEnvelope {
    /// Parse an uploaded envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Validation`] if the document is not a JSON
    /// object of objects.
    pub fn parse(bytes: &[u8]) -> Result<Self, ContentError> {
        serde_json::from_slice(bytes).map_err(|e| ContentError::Validation {
            reason: format!("invalid import file: {e}"),
        })
    }

    /// Build an envelope from a storage snapshot.
    ///
    /// A payload that is not JSON cannot be embedded; it is left out with a
    /// warning and the rest of the snapshot is kept.
    #[must_use]
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut envelope = Self::default();
        for (bucket, pairs) in snapshot {
            let partition = envelope.partitions.entry(bucket.clone()).or_default();
            for (key, value) in pairs {
                match raw_payload(&bucket, &key, value) {
                    Ok(raw) => {
                        partition.insert(key, raw);
                    }
                    Err(e) => tracing::warn!(error = %e, "skipping unexportable payload"),
                }
            }
        }
        envelope
    }

    /// Convert into a storage snapshot, keeping each payload's exact bytes.
    #[must_use]
    pub fn into_snapshot(self) -> Snapshot {
        self.partitions
            .into_iter()
            .map(|(bucket, items)| {
                let pairs = items
                    .into_iter()
                    .map(|(key, raw)| (key, raw.get().as_bytes().to_vec()))
                    .collect();
                (bucket, pairs)
            })
            .collect()
    }

    /// Add or overwrite one payload.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Serialization`] if `payload` is not valid JSON.
    pub fn insert(
        &mut self,
        partition: &str,
        id: &str,
        payload: Vec<u8>,
    ) -> Result<(), ContentError> {
        let raw = raw_payload(partition, id, payload)?;
        self.partitions
            .entry(partition.to_owned())
            .or_default()
            .insert(id.to_owned(), raw);
        Ok(())
    }

    /// Make sure a partition is present, even if empty.
    pub fn ensure_partition(&mut self, partition: &str) {
        self.partitions.entry(partition.to_owned()).or_default();
    }

    /// Look up one partition.
    #[must_use]
    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.get(name)
    }

    /// Names of all partitions in the envelope.
    pub fn partition_names(&self) -> impl Iterator<Item = &str> {
        self.partitions.keys().map(String::as_str)
    }

    /// The content partition, which the API import path requires.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Validation`] if the envelope has no `content`
    /// key.
    pub fn require_content(&self) -> Result<&Partition, ContentError> {
        self.partition(CONTENT_BUCKET)
            .ok_or_else(|| ContentError::Validation {
                reason: format!("import file must contain a '{CONTENT_BUCKET}' partition"),
            })
    }

    /// Serialize for download.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Serialization`] if encoding fails.
    pub fn to_vec(&self) -> Result<Vec<u8>, ContentError> {
        serde_json::to_vec(self).map_err(|e| ContentError::Serialization {
            reason: e.to_string(),
        })
    }
}

fn raw_payload(partition: &str, id: &str, payload: Vec<u8>) -> Result<Box<RawValue>, ContentError> {
    let text = String::from_utf8(payload).map_err(|e| ContentError::Serialization {
        reason: format!("payload '{partition}/{id}' is not UTF-8: {e}"),
    })?;
    RawValue::from_string(text).map_err(|e| ContentError::Serialization {
        reason: format!("payload '{partition}/{id}' is not JSON: {e}"),
    })
}
