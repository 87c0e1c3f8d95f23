//! Per-session copy-on-first-touch view of the seed.
//!
//! In session mode every browser session owns a private content set stored
//! under [`CONTENT_KEY`] in its session payload. The first read clones the
//! seed into the session and saves it immediately; from then on all reads
//! and writes go to the session's copy and nothing is ever shared.
//!
//! The session layer may hand the set back in a different shape than it was
//! written (bytes, text, or an already-parsed structure). All three decode
//! to the same set. When the structured shape is seen it is written back as
//! canonical bytes; a failed write-back is only logged.

use std::sync::Arc;

use serde::Deserialize as _;

use crate::content::{ContentSet, MAX_ITEMS};
use crate::error::ContentError;
use crate::session::{Session, SessionStore, SessionValue};

/// Session key holding the session's content set.
pub const CONTENT_KEY: &str = "user_content";

/// Reads and writes a session's private content set.
pub struct SessionContentProjector {
    seed: Arc<ContentSet>,
    sessions: Arc<dyn SessionStore>,
    limit: usize,
}

impl std::fmt::Debug for SessionContentProjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContentProjector")
            .field("seed_items", &self.seed.len())
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl SessionContentProjector {
    #[must_use]
    pub fn new(seed: ContentSet, sessions: Arc<dyn SessionStore>) -> Self {
        Self::with_limit(seed, sessions, MAX_ITEMS)
    }

    #[must_use]
    pub fn with_limit(seed: ContentSet, sessions: Arc<dyn SessionStore>, limit: usize) -> Self {
        Self {
            seed: Arc::new(seed),
            sessions,
            limit,
        }
    }

    /// Largest set a session may hold.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The session's content set, cloning the seed into it on first touch.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Serialization`] if the stored set is in an
    /// unrecognized shape or does not parse, or [`ContentError::Session`] if
    /// the first-touch copy cannot be saved.
    pub async fn read(&self, session: &mut Session) -> Result<ContentSet, ContentError> {
        let Some(value) = session.get(CONTENT_KEY) else {
            let set = (*self.seed).clone();
            tracing::debug!(session = %session.id(), items = set.len(), "cloning seed into session");
            self.write(session, &set).await?;
            return Ok(set);
        };

        let (set, canonical) = decode_content_set(value)?;
        if !canonical {
            let bytes = encode_content_set(&set)?;
            session.set(CONTENT_KEY, bytes);
            if let Err(e) = self.sessions.save(session).await {
                tracing::warn!(
                    session = %session.id(),
                    error = %e,
                    "failed to write back canonical session content"
                );
            }
        }
        Ok(set)
    }

    /// Replace the session's content set and persist the session.
    ///
    /// # Errors
    ///
    /// Returns [`ContentError::Capacity`] if `set` is over the limit,
    /// [`ContentError::Serialization`] if it cannot be encoded, or
    /// [`ContentError::Session`] if the session cannot be saved.
    pub async fn write(&self, session: &mut Session, set: &ContentSet) -> Result<(), ContentError> {
        if set.len() > self.limit {
            return Err(ContentError::Capacity {
                limit: self.limit,
                requested: set.len(),
            });
        }
        session.set(CONTENT_KEY, encode_content_set(set)?);
        self.sessions.save(session).await?;
        Ok(())
    }

    /// Forget the session's content set so the next read starts from the
    /// seed again. The caller saves the session.
    pub fn discard(session: &mut Session) {
        session.remove(CONTENT_KEY);
    }
}

/// Encode a content set in its canonical session form.
///
/// # Errors
///
/// Returns [`ContentError::Serialization`] if encoding fails.
pub fn encode_content_set(set: &ContentSet) -> Result<Vec<u8>, ContentError> {
    serde_json::to_vec(set).map_err(|e| ContentError::Serialization {
        reason: format!("failed to encode session content: {e}"),
    })
}

/// Decode a session-held content set from any shape the session layer
/// returns.
///
/// The flag is `true` when the value was already in canonical form (bytes).
/// Every item takes its map key as its id.
///
/// # Errors
///
/// Returns [`ContentError::Serialization`] for any other shape, or when the
/// payload does not parse as a content set.
pub fn decode_content_set(value: &SessionValue) -> Result<(ContentSet, bool), ContentError> {
    let (parsed, canonical) = match value {
        SessionValue::Bytes(b) => (serde_json::from_slice::<ContentSet>(b), true),
        SessionValue::Text(s) => (serde_json::from_str::<ContentSet>(s), false),
        SessionValue::Structured(v) => (ContentSet::deserialize(v), false),
        other => {
            return Err(ContentError::Serialization {
                reason: format!("unrecognized session content shape: {}", other.kind()),
            });
        }
    };
    let mut set = parsed.map_err(|e| ContentError::Serialization {
        reason: format!("failed to decode session content: {e}"),
    })?;
    for (key, item) in &mut set {
        key.clone_into(&mut item.id);
    }
    Ok((set, canonical))
}
