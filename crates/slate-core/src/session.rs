//! Session layer contract.
//!
//! A session is a per-browser key/value payload identified by an opaque id
//! carried in a cookie. Values are loosely typed: whatever a caller stores
//! may come back in a different shape once the backing store has
//! re-encoded it (an integer as a generic number, JSON bytes as a parsed
//! structure). [`SessionValue`] models that openly and its accessors accept
//! every reasonable shape instead of assuming the one that was written.
//!
//! [`SessionStore`] is the seam to the session backend. [`MemorySessionStore`]
//! keeps payloads in process memory with a sliding expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::SessionError;

/// Default idle lifetime of a session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Random bytes behind a session id (32 hex characters).
const SESSION_ID_BYTES: usize = 16;

/// Session key: whether the browser has logged in.
pub const AUTHENTICATED_KEY: &str = "authenticated";
/// Session key: the name the browser logged in with.
pub const USERNAME_KEY: &str = "username";
/// Session key: deep link to return to after login.
pub const REDIRECT_KEY: &str = "redirect_url";

/// A session value in any of the shapes the session layer may hand back.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    /// A generic number produced by a serialization layer.
    Number(serde_json::Number),
    Text(String),
    Bytes(Vec<u8>),
    /// A loosely-typed structure produced by a serialization layer.
    Structured(Value),
}

impl SessionValue {
    /// Short name of the variant, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Structured(_) => "structured",
        }
    }

    /// Read as a boolean flag.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) | Self::Structured(Value::Bool(b)) => Some(*b),
            Self::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Read as text.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) | Self::Structured(Value::String(s)) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Read as a non-negative counter, whatever numeric encoding it arrived
    /// in.
    #[must_use]
    pub fn as_count(&self) -> Option<u32> {
        match self {
            Self::Int(i) => u32::try_from(*i).ok(),
            Self::Float(f) => float_to_count(*f),
            Self::Number(n) | Self::Structured(Value::Number(n)) => number_to_count(n),
            Self::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Read as a point in time.
    ///
    /// Accepts RFC 3339 text or Unix seconds in any numeric encoding.
    /// Anything else yields `None`.
    #[must_use]
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Text(s) | Self::Structured(Value::String(s)) => parse_timestamp(s),
            Self::Int(i) => Utc.timestamp_opt(*i, 0).single(),
            Self::Float(f) => float_to_timestamp(*f),
            Self::Number(n) | Self::Structured(Value::Number(n)) => n
                .as_i64()
                .and_then(|i| Utc.timestamp_opt(i, 0).single())
                .or_else(|| n.as_f64().and_then(float_to_timestamp)),
            _ => None,
        }
    }
}

fn number_to_count(n: &serde_json::Number) -> Option<u32> {
    n.as_u64()
        .and_then(|u| u32::try_from(u).ok())
        .or_else(|| n.as_f64().and_then(float_to_count))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn float_to_count(f: f64) -> Option<u32> {
    (f.is_finite() && f >= 0.0 && f <= f64::from(u32::MAX)).then(|| f as u32)
}

#[allow(clippy::cast_possible_truncation)]
fn float_to_timestamp(f: f64) -> Option<DateTime<Utc>> {
    if !f.is_finite() {
        return None;
    }
    Utc.timestamp_opt(f.trunc() as i64, 0).single()
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| s.parse::<i64>().ok().and_then(|i| Utc.timestamp_opt(i, 0).single()))
}

impl From<bool> for SessionValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for SessionValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for SessionValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for SessionValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for SessionValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for SessionValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// One browser session's payload plus its identifier.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    values: HashMap<String, SessionValue>,
    fresh: bool,
}

impl Session {
    /// Start an empty session under a newly issued id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Load`] if no random id can be generated.
    pub fn issue() -> Result<Self, SessionError> {
        Ok(Self {
            id: new_session_id()?,
            values: HashMap::new(),
            fresh: true,
        })
    }

    fn resumed(id: String, values: HashMap<String, SessionValue>) -> Self {
        Self {
            id,
            values,
            fresh: false,
        }
    }

    /// The session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the id has not been sent to the browser yet.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&SessionValue> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<SessionValue>) {
        self.values.insert(key.to_owned(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<SessionValue> {
        self.values.remove(key)
    }

    /// Whether the login flag is set, in whatever shape it was stored.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.get(AUTHENTICATED_KEY)
            .and_then(SessionValue::as_bool)
            .unwrap_or(false)
    }

    /// Iterate over every stored key/value pair.
    pub fn values(&self) -> impl Iterator<Item = (&str, &SessionValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn new_session_id() -> Result<String, SessionError> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| SessionError::Load {
            reason: format!("failed to generate session id: {e}"),
        })?;
    Ok(hex::encode(bytes))
}

/// A backend that loads, saves, and rotates session payloads.
///
/// A save persists the whole payload atomically; there is no
/// compare-and-swap, so two concurrent requests on the same session race
/// and the last save wins.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Load the session named by `id`, or start a fresh one when `id` is
    /// `None`, unknown, or expired. A fresh session is not stored until it
    /// is saved.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Load`] if the backend cannot be read.
    async fn load(&self, id: Option<&str>) -> Result<Session, SessionError>;

    /// Persist the whole payload, replacing what was stored under its id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Save`] if the backend cannot be written.
    async fn save(&self, session: &Session) -> Result<(), SessionError>;

    /// Move the payload to a newly issued id and forget the old one.
    ///
    /// On error the session keeps its previous id.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Regenerate`] if a new id cannot be issued.
    async fn regenerate(&self, session: &mut Session) -> Result<(), SessionError>;

    /// Forget a session entirely.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Destroy`] if the backend cannot be written.
    async fn destroy(&self, id: &str) -> Result<(), SessionError>;
}

/// How [`MemorySessionStore`] encodes values on save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionCodec {
    /// Values are stored exactly as given.
    #[default]
    Native,
    /// Values pass through a JSON-style generic encoding: integers and
    /// floats become generic numbers and bytes holding a JSON document come
    /// back as a parsed structure (other UTF-8 bytes as text).
    Json,
}

impl SessionCodec {
    fn encode(self, value: &SessionValue) -> SessionValue {
        match (self, value) {
            (Self::Native, v) => v.clone(),
            (Self::Json, SessionValue::Int(i)) => SessionValue::Number((*i).into()),
            (Self::Json, SessionValue::Float(f)) => serde_json::Number::from_f64(*f)
                .map_or(SessionValue::Float(*f), SessionValue::Number),
            (Self::Json, SessionValue::Bytes(b)) => match serde_json::from_slice::<Value>(b) {
                Ok(v @ (Value::Object(_) | Value::Array(_))) => SessionValue::Structured(v),
                _ => match std::str::from_utf8(b) {
                    Ok(s) => SessionValue::Text(s.to_owned()),
                    Err(_) => SessionValue::Bytes(b.clone()),
                },
            },
            (Self::Json, v) => v.clone(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    values: HashMap<String, SessionValue>,
    expires_at: Instant,
}

/// In-process session store with a sliding expiry: loading or saving a
/// session pushes its deadline out by the TTL.
///
/// Clones share the same sessions.
#[derive(Debug, Clone)]
pub struct MemorySessionStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    ttl: Duration,
    codec: SessionCodec,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL, SessionCodec::Native)
    }
}

impl MemorySessionStore {
    #[must_use]
    pub fn new(ttl: Duration, codec: SessionCodec) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            codec,
        }
    }

    /// Drop every expired session and return how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before.saturating_sub(entries.len())
    }

    /// Number of stored sessions, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether no sessions are stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn deadline(&self) -> Instant {
        Instant::now()
            .checked_add(self.ttl)
            .unwrap_or_else(Instant::now)
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: Option<&str>) -> Result<Session, SessionError> {
        if let Some(id) = id {
            let deadline = self.deadline();
            let mut entries = self.entries.write().await;
            match entries.get_mut(id) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    entry.expires_at = deadline;
                    return Ok(Session::resumed(id.to_owned(), entry.values.clone()));
                }
                Some(_) => {
                    entries.remove(id);
                    tracing::debug!(session = %id, "session expired");
                }
                None => {}
            }
        }
        Session::issue()
    }

    async fn save(&self, session: &Session) -> Result<(), SessionError> {
        let values = session
            .values
            .iter()
            .map(|(k, v)| (k.clone(), self.codec.encode(v)))
            .collect();
        let entry = Entry {
            values,
            expires_at: self.deadline(),
        };
        self.entries.write().await.insert(session.id.clone(), entry);
        Ok(())
    }

    async fn regenerate(&self, session: &mut Session) -> Result<(), SessionError> {
        let new_id = new_session_id().map_err(|e| SessionError::Regenerate {
            id: session.id.clone(),
            reason: e.to_string(),
        })?;
        let old_id = std::mem::replace(&mut session.id, new_id);
        session.fresh = true;
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.remove(&old_id) {
            entries.insert(session.id.clone(), entry);
        }
        Ok(())
    }

    async fn destroy(&self, id: &str) -> Result<(), SessionError> {
        self.entries.write().await.remove(id);
        Ok(())
    }
}
