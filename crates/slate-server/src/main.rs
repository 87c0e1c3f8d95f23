//! Slate server entry point.
//!
//! Loads configuration, bootstraps the content repository and session
//! store, then starts the Axum HTTP server with graceful shutdown. A
//! background worker sweeps expired sessions and is cancelled on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use slate_core::session::MemorySessionStore;
use slate_server::config::ServerConfig;
use slate_server::routes::build_router;
use slate_server::state::AppState;

/// How often expired sessions are swept from memory.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(mode = %config.mode, storage = ?config.storage, "Slate starting");

    let boot = AppState::bootstrap(&config)
        .await
        .context("failed to bootstrap application state")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper_handle = {
        let sessions = boot.sessions;
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            session_sweeper(sessions, &mut rx, SESSION_SWEEP_INTERVAL).await;
        })
    };

    let app = build_router(Arc::clone(&boot.state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "Slate server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    if tokio::time::timeout(Duration::from_secs(10), sweeper_handle)
        .await
        .is_err()
    {
        warn!("session sweeper did not stop in time");
    }

    info!("Slate server stopped");
    Ok(())
}

/// Periodically drop sessions that outlived their TTL.
async fn session_sweeper(
    sessions: MemorySessionStore,
    shutdown: &mut watch::Receiver<bool>,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    info!(interval_secs = every.as_secs(), "session sweeper started");

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let purged = sessions.purge_expired().await;
                if purged > 0 {
                    let remaining = sessions.len().await;
                    info!(purged, remaining, "expired sessions swept");
                }
            }
            _ = shutdown.changed() => {
                info!("session sweeper shutting down");
                return;
            }
        }
    }
}

/// Resolve on ctrl-c or SIGTERM and tell the workers to stop.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "cannot listen for ctrl-c");
            }
            "SIGINT"
        }
        () = terminate => "SIGTERM",
    };

    info!(signal, "shutting down");
    if shutdown_tx.send(true).is_err() {
        warn!("no background workers were listening for shutdown");
    }
}
