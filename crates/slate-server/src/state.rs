//! Shared application state for the Slate server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`. [`AppState::bootstrap`] loads the seed and
//! wires the content repository for the configured deployment mode.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use slate_core::content::MAX_ITEMS;
use slate_core::error::SeedError;
use slate_core::login::{LoginGuard, LoginPolicy};
use slate_core::projector::SessionContentProjector;
use slate_core::repository::{ContentRepository, Mode, SessionRepository, SharedRepository};
use slate_core::seed::{SeedSource, load_content_map, load_into_store};
use slate_core::session::{MemorySessionStore, SessionStore};
use slate_storage::{MemoryBackend, RedbBackend, StorageBackend, StorageError};

use crate::config::{ServerConfig, StorageKind};

/// The seed dataset compiled into the binary, as an export envelope.
pub const PACKAGED_SEED: &[u8] = include_bytes!("../assets/seed.json");

/// Errors that stop the server from starting.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// The seed file named in the configuration could not be read.
    #[error("failed to read seed file {path}: {reason}")]
    SeedFile { path: String, reason: String },

    /// The seed could not be loaded.
    #[error(transparent)]
    Seed(#[from] SeedError),

    /// The shared-mode storage could not be opened.
    #[error("failed to open content storage: {0}")]
    Storage(#[from] StorageError),
}

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Content operations for the configured mode.
    pub repository: Arc<dyn ContentRepository>,
    /// Session persistence.
    pub sessions: Arc<dyn SessionStore>,
    /// Login attempt limiting.
    pub login: LoginGuard,
    /// Lifetime advertised on the session cookie.
    pub session_ttl: Duration,
    /// Directory served under `/static`.
    pub static_dir: PathBuf,
    /// Upper bound on handling one request.
    pub request_timeout: Duration,
    /// Maximum number of requests handled at once.
    pub concurrency: usize,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("mode", &self.repository.mode())
            .finish_non_exhaustive()
    }
}

/// Result of [`AppState::bootstrap`].
#[derive(Debug)]
pub struct Bootstrapped {
    pub state: Arc<AppState>,
    /// The concrete session store, for the expiry sweeper.
    pub sessions: MemorySessionStore,
}

impl AppState {
    /// Load the seed and build the state for `config`.
    ///
    /// `SLATE_SEED_PATH` replaces the packaged seed when set.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError`] if the seed cannot be read or decoded, or
    /// shared-mode storage cannot be opened.
    pub async fn bootstrap(config: &ServerConfig) -> Result<Bootstrapped, BootstrapError> {
        let owned;
        let seed = match &config.seed_path {
            Some(path) => {
                owned = tokio::fs::read(path)
                    .await
                    .map_err(|e| BootstrapError::SeedFile {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
                tracing::info!(path = %path.display(), "using seed file");
                SeedSource::detect(&owned)
            }
            None => SeedSource::Envelope(PACKAGED_SEED),
        };
        Self::bootstrap_with_seed(config, seed).await
    }

    /// [`bootstrap`](Self::bootstrap) with explicit seed bytes.
    ///
    /// # Errors
    ///
    /// Same as [`bootstrap`](Self::bootstrap).
    pub async fn bootstrap_with_seed(
        config: &ServerConfig,
        seed: SeedSource<'_>,
    ) -> Result<Bootstrapped, BootstrapError> {
        let sessions = MemorySessionStore::new(config.session_ttl, config.session_codec);
        let session_store: Arc<dyn SessionStore> = Arc::new(sessions.clone());

        let repository: Arc<dyn ContentRepository> = match config.mode {
            Mode::Session => {
                let set = load_content_map(seed).await?;
                let projector = SessionContentProjector::new(set, Arc::clone(&session_store));
                Arc::new(SessionRepository::new(Arc::new(projector)))
            }
            Mode::Shared => {
                let storage = open_storage(config.storage).await?;
                let store = load_into_store(seed, storage, config.store_lock_timeout).await?;
                Arc::new(SharedRepository::new(Arc::new(store), MAX_ITEMS))
            }
        };

        if config.auth_user.is_empty() || config.auth_pass.is_empty() {
            tracing::warn!("AUTH_USER or AUTH_PASS not set, logins will be refused");
        }
        let policy = LoginPolicy::new(
            config.auth_user.clone(),
            config.auth_pass.clone(),
            config.login_limit,
            config.login_lock,
        );

        let state = Arc::new(Self {
            repository,
            sessions: Arc::clone(&session_store),
            login: LoginGuard::new(policy, session_store),
            session_ttl: config.session_ttl,
            static_dir: config.static_dir.clone(),
            request_timeout: config.request_timeout,
            concurrency: config.concurrency,
        });
        Ok(Bootstrapped { state, sessions })
    }
}

async fn open_storage(kind: StorageKind) -> Result<Arc<dyn StorageBackend>, BootstrapError> {
    match kind {
        StorageKind::Memory => {
            tracing::info!("using in-memory storage (data will not persist)");
            Ok(Arc::new(MemoryBackend::new()))
        }
        StorageKind::Redb => {
            let backend = tokio::task::spawn_blocking(RedbBackend::ephemeral)
                .await
                .map_err(|e| StorageError::Transaction {
                    reason: format!("storage open task failed: {e}"),
                })??;
            tracing::info!(path = %backend.path().display(), "using ephemeral redb storage");
            Ok(Arc::new(backend))
        }
    }
}
