//! Content item model, identifier generation, and request enrichment.
//!
//! Both deployment modes accept the same loosely-shaped JSON bodies from
//! callers. [`prepare_new`] and [`apply_update`] turn such a body into a
//! stored payload plus the typed [`Content`] view of it, so the shared store
//! and the session projector enrich items identically.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ContentError;

/// Partition holding content items.
pub const CONTENT_BUCKET: &str = "content";
/// Placeholder partition for site settings.
pub const SETTINGS_BUCKET: &str = "settings";
/// Placeholder partition for user records.
pub const USERS_BUCKET: &str = "users";
/// Every partition a writable store is guaranteed to have.
pub const PARTITIONS: [&str; 3] = [CONTENT_BUCKET, SETTINGS_BUCKET, USERS_BUCKET];

/// Maximum number of items in a content set.
pub const MAX_ITEMS: usize = 50;

/// Status assigned to new items that do not name one.
pub const DEFAULT_STATUS: &str = "draft";

/// Number of random bytes behind a content identifier (16 hex characters).
const ID_BYTES: usize = 8;

/// A single content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Opaque 16-hex-character identifier, immutable once assigned.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub slug: String,
    /// Body text.
    #[serde(default, rename = "content")]
    pub body: String,
    /// Records written without timestamps decode as the Unix epoch.
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Free-form workflow status (`draft`, `published`, ...).
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    DEFAULT_STATUS.to_owned()
}

/// A session's or store's content, keyed by identifier.
pub type ContentSet = BTreeMap<String, Content>;

impl Content {
    /// Decode a stored payload.
    ///
    /// The item always takes `key`, the identifier it is stored under, as its
    /// `id`. An `id` field inside the payload is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Serialization`] if the bytes are not a valid
    /// content record.
    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, ContentError> {
        let mut item: Self =
            serde_json::from_slice(bytes).map_err(|e| ContentError::Serialization {
                reason: format!("item '{key}': {e}"),
            })?;
        key.clone_into(&mut item.id);
        Ok(item)
    }

    /// Encode as a stored payload.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Serialization`] if encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, ContentError> {
        serde_json::to_vec(self).map_err(|e| ContentError::Serialization {
            reason: e.to_string(),
        })
    }

    fn to_object(&self) -> Result<Map<String, Value>, ContentError> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ContentError::Serialization {
                reason: "content did not encode as an object".to_owned(),
            }),
            Err(e) => Err(ContentError::Serialization {
                reason: e.to_string(),
            }),
        }
    }
}

/// Generate a fresh content identifier from the OS random source.
///
/// # Errors
///
/// Returns [`ContentError::Internal`] if the OS random source fails.
pub fn generate_id() -> Result<String, ContentError> {
    let mut bytes = [0u8; ID_BYTES];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| ContentError::Internal {
            reason: format!("failed to generate random id: {e}"),
        })?;
    Ok(hex::encode(bytes))
}

/// Parse a request body as a JSON object.
///
/// # Errors
///
/// Returns [`ContentError::Validation`] for an empty body, malformed JSON, or
/// any JSON value other than an object.
pub fn parse_body(bytes: &[u8]) -> Result<Map<String, Value>, ContentError> {
    if bytes.is_empty() {
        return Err(ContentError::Validation {
            reason: "request body is empty".to_owned(),
        });
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ContentError::Validation {
            reason: "request body must be a JSON object".to_owned(),
        }),
        Err(e) => Err(ContentError::Validation {
            reason: format!("invalid JSON: {e}"),
        }),
    }
}

/// An enriched item: the typed view plus the exact bytes to store.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub item: Content,
    pub payload: Vec<u8>,
}

/// Enrich a create request with server-assigned fields.
///
/// Sets `id`, `created_at` and `updated_at`, and defaults `status` to
/// `draft` when the body does not carry one. Unknown fields in the body are
/// kept in the stored payload.
///
/// # Errors
///
/// Returns [`ContentError::Validation`] if the enriched body does not form a
/// valid content item (for example a non-string title).
pub fn prepare_new(
    mut body: Map<String, Value>,
    id: &str,
    now: DateTime<Utc>,
) -> Result<Prepared, ContentError> {
    let stamp = timestamp(now)?;
    body.insert("id".to_owned(), Value::String(id.to_owned()));
    body.insert("created_at".to_owned(), stamp.clone());
    body.insert("updated_at".to_owned(), stamp);
    body.entry("status")
        .or_insert_with(|| Value::String(DEFAULT_STATUS.to_owned()));
    finish(body)
}

/// Merge an update request over an existing stored payload.
///
/// Fields present in `body` overwrite the stored ones; fields it omits are
/// kept. `id` and `created_at` are pinned to their stored values and
/// `updated_at` never moves backwards.
///
/// # Errors
///
/// Returns [`ContentError::Validation`] if the merged body does not form a
/// valid content item, or [`ContentError::Serialization`] if `existing` is
/// itself unreadable.
pub fn apply_update(
    existing: &[u8],
    id: &str,
    body: Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<Prepared, ContentError> {
    let mut merged = match serde_json::from_slice::<Value>(existing) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            return Err(ContentError::Serialization {
                reason: format!("stored item '{id}' is not a JSON object"),
            });
        }
    };
    let previous = Content::decode(id, existing)?;

    merged.extend(body);
    merged.insert("id".to_owned(), Value::String(id.to_owned()));
    merged.insert("created_at".to_owned(), timestamp(previous.created_at)?);
    merged.insert(
        "updated_at".to_owned(),
        timestamp(now.max(previous.updated_at))?,
    );
    finish(merged)
}

/// [`apply_update`] for callers that hold a typed item rather than bytes.
///
/// # Errors
///
/// Same as [`apply_update`].
pub fn apply_update_to(
    existing: &Content,
    body: Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<Prepared, ContentError> {
    let bytes = serde_json::to_vec(&Value::Object(existing.to_object()?)).map_err(|e| {
        ContentError::Serialization {
            reason: e.to_string(),
        }
    })?;
    apply_update(&bytes, &existing.id, body, now)
}

fn timestamp(t: DateTime<Utc>) -> Result<Value, ContentError> {
    serde_json::to_value(t).map_err(|e| ContentError::Serialization {
        reason: e.to_string(),
    })
}

fn finish(map: Map<String, Value>) -> Result<Prepared, ContentError> {
    let value = Value::Object(map);
    let item: Content =
        serde_json::from_value(value.clone()).map_err(|e| ContentError::Validation {
            reason: format!("invalid content fields: {e}"),
        })?;
    let payload = serde_json::to_vec(&value).map_err(|e| ContentError::Serialization {
        reason: e.to_string(),
    })?;
    Ok(Prepared { item, payload })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn object(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => Map::new(),
        }
    }

    #[test]
    fn generated_ids_are_sixteen_lowercase_hex() {
        let id = generate_id().unwrap();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_ne!(id, generate_id().unwrap());
    }

    #[test]
    fn parse_body_rejects_empty_and_non_objects() {
        assert!(matches!(parse_body(b""), Err(ContentError::Validation { .. })));
        assert!(matches!(parse_body(b"{oops"), Err(ContentError::Validation { .. })));
        assert!(matches!(parse_body(b"[1,2]"), Err(ContentError::Validation { .. })));
        assert!(parse_body(br#"{"title":"x"}"#).is_ok());
    }

    #[test]
    fn prepare_new_assigns_server_fields() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let body = object(json!({"title": "Hello", "slug": "hello", "content": "Hi there", "id": "spoofed"}));
        let prepared = prepare_new(body, "0123456789abcdef", now).unwrap();

        assert_eq!(prepared.item.id, "0123456789abcdef");
        assert_eq!(prepared.item.title, "Hello");
        assert_eq!(prepared.item.body, "Hi there");
        assert_eq!(prepared.item.status, DEFAULT_STATUS);
        assert_eq!(prepared.item.created_at, now);
        assert_eq!(prepared.item.updated_at, now);
        assert_eq!(Content::decode(&prepared.item.id, &prepared.payload).unwrap(), prepared.item);
    }

    #[test]
    fn prepare_new_keeps_explicit_status_and_extra_fields() {
        let now = Utc::now();
        let body = object(json!({"title": "T", "status": "published", "tags": ["a"]}));
        let prepared = prepare_new(body, "aaaaaaaaaaaaaaaa", now).unwrap();
        assert_eq!(prepared.item.status, "published");
        let raw: Value = serde_json::from_slice(&prepared.payload).unwrap();
        assert_eq!(raw["tags"], json!(["a"]));
    }

    #[test]
    fn prepare_new_rejects_ill_typed_fields() {
        let body = object(json!({"title": 42}));
        let result = prepare_new(body, "aaaaaaaaaaaaaaaa", Utc::now());
        assert!(matches!(result, Err(ContentError::Validation { .. })));
    }

    #[test]
    fn update_pins_created_and_advances_updated() {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let original = prepare_new(object(json!({"title": "Old", "slug": "old"})), "bbbbbbbbbbbbbbbb", created).unwrap();

        let later = created + Duration::hours(2);
        let body = object(json!({"title": "New", "created_at": "1999-01-01T00:00:00Z", "id": "zzzz"}));
        let updated = apply_update(&original.payload, "bbbbbbbbbbbbbbbb", body, later).unwrap();

        assert_eq!(updated.item.id, "bbbbbbbbbbbbbbbb");
        assert_eq!(updated.item.title, "New");
        assert_eq!(updated.item.slug, "old");
        assert_eq!(updated.item.created_at, created);
        assert_eq!(updated.item.updated_at, later);
    }

    #[test]
    fn update_never_moves_updated_backwards() {
        let created = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let original = prepare_new(object(json!({"title": "Future"})), "cccccccccccccccc", created).unwrap();
        let earlier = created - Duration::days(1);
        let updated = apply_update_to(&original.item, object(json!({"title": "x"})), earlier).unwrap();
        assert_eq!(updated.item.updated_at, created);
    }

    #[test]
    fn decode_adopts_storage_key_when_id_missing() {
        let raw = br#"{"title":"Hello","created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}"#;
        let item = Content::decode("abc123", raw).unwrap();
        assert_eq!(item.id, "abc123");
        assert_eq!(item.status, "draft");
        assert!(item.published_at.is_none());
    }

    #[test]
    fn decode_prefers_storage_key_over_payload_id() {
        let raw = br#"{"id":"other","title":"Moved","created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}"#;
        let item = Content::decode("abc123", raw).unwrap();
        assert_eq!(item.id, "abc123");
    }

    #[test]
    fn decode_defaults_missing_timestamps_to_epoch() {
        let item = Content::decode("k", br#"{"title":"x"}"#).unwrap();
        assert_eq!(item.title, "x");
        assert_eq!(item.created_at, DateTime::<Utc>::default());
        assert_eq!(item.updated_at, DateTime::<Utc>::default());
    }
}
