//! Error types for `slate-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Not-found is an ordinary outcome on the read path (`Ok(None)`)
//! and only becomes [`ContentError::NotFound`] where an operation requires the
//! item to exist.

use slate_storage::StorageError;

/// Errors from content operations in either deployment mode.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    /// The requested content item does not exist.
    #[error("content not found: {id}")]
    NotFound { id: String },

    /// The caller sent malformed input (empty body, bad JSON, wrong shape).
    #[error("invalid content request: {reason}")]
    Validation { reason: String },

    /// Accepting the request would push the content set past its ceiling.
    #[error("content limit of {limit} items reached ({requested} requested)")]
    Capacity { limit: usize, requested: usize },

    /// The content store lock could not be acquired in time.
    #[error("timed out after {waited_ms}ms waiting for the content store lock during {operation}")]
    LockTimeout {
        operation: &'static str,
        waited_ms: u64,
    },

    /// A stored or session-held payload could not be encoded or decoded as a
    /// whole.
    #[error("content serialization failed: {reason}")]
    Serialization { reason: String },

    /// The underlying storage backend returned an error.
    #[error("content storage error: {0}")]
    Storage(#[from] StorageError),

    /// The session layer returned an error.
    #[error("content session error: {0}")]
    Session(#[from] SessionError),

    /// Anything else that cannot be blamed on the caller.
    #[error("content internal error: {reason}")]
    Internal { reason: String },
}

/// Errors from loading the packaged seed dataset.
///
/// Any of these is fatal at startup: the system cannot run on a corrupt seed.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    /// The snapshot could not be copied into a usable location.
    #[error("failed to extract seed snapshot: {reason}")]
    Extract { reason: String },

    /// The snapshot was extracted but could not be opened or read.
    #[error("seed storage error: {0}")]
    Storage(#[from] StorageError),

    /// The snapshot as a whole is not decodable (not individual records).
    #[error("seed data is malformed: {reason}")]
    Malformed { reason: String },
}

/// Errors from the session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session payload could not be retrieved.
    #[error("failed to load session: {reason}")]
    Load { reason: String },

    /// The session payload could not be persisted.
    #[error("failed to save session '{id}': {reason}")]
    Save { id: String, reason: String },

    /// A fresh session identifier could not be issued.
    #[error("failed to regenerate session '{id}': {reason}")]
    Regenerate { id: String, reason: String },

    /// The session could not be destroyed.
    #[error("failed to destroy session '{id}': {reason}")]
    Destroy { id: String, reason: String },
}
