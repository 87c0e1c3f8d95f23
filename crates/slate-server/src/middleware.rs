//! Session and authentication middleware for Slate.
//!
//! Loads the browser's session from the `slate_session` cookie, turns away
//! unauthenticated requests for non-public paths (remembering where they
//! were headed), and injects a [`CurrentSession`] into the request
//! extensions for downstream handlers. On the way out it issues or clears
//! the cookie when the session id changed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use tokio::sync::{Mutex, MutexGuard};

use slate_core::session::{REDIRECT_KEY, Session};

use crate::error::AppError;
use crate::state::AppState;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "slate_session";

/// The request's session, shared between the middleware and the handler.
#[derive(Debug, Clone)]
pub struct CurrentSession {
    session: Arc<Mutex<Session>>,
    destroyed: Arc<AtomicBool>,
}

impl CurrentSession {
    fn new(session: Session) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            destroyed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Exclusive access to the session for the rest of the handler.
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().await
    }

    /// Record that the session was destroyed so the cookie is cleared.
    pub fn mark_destroyed(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
    }
}

/// Whether `path` is reachable without logging in.
fn is_public(path: &str) -> bool {
    matches!(path, "/" | "/login" | "/health") || path.starts_with("/static/")
}

/// Middleware that resolves the session and enforces login.
pub async fn session_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_owned();
    if path == "/health" || path.starts_with("/static/") {
        return next.run(req).await;
    }

    let incoming = session_cookie(req.headers());
    let mut session = match state.sessions.load(incoming.as_deref()).await {
        Ok(s) => s,
        Err(e) => return AppError::from(e).into_response(),
    };

    if !is_public(&path) && !session.is_authenticated() {
        tracing::info!(path = %path, "unauthenticated access, redirecting to login");
        session.set(REDIRECT_KEY, path.as_str());
        if let Err(e) = state.sessions.save(&session).await {
            tracing::warn!(error = %e, "failed to save redirect url");
        }
        let mut resp = Redirect::to("/login").into_response();
        if incoming.as_deref() != Some(session.id()) {
            set_cookie(resp.headers_mut(), session.id(), state.session_ttl);
        }
        return resp;
    }

    let current = CurrentSession::new(session);
    req.extensions_mut().insert(current.clone());
    let mut resp = next.run(req).await;

    if current.destroyed.load(Ordering::Relaxed) {
        clear_cookie(resp.headers_mut());
    } else {
        let session = current.lock().await;
        if incoming.as_deref() != Some(session.id()) {
            set_cookie(resp.headers_mut(), session.id(), state.session_ttl);
        }
    }
    resp
}

/// Extract the session id from the request's `Cookie` headers.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_owned())
        .filter(|value| !value.is_empty())
}

fn set_cookie(headers: &mut HeaderMap, id: &str, ttl: Duration) {
    let cookie = format!(
        "{SESSION_COOKIE}={id}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        ttl.as_secs()
    );
    append_cookie(headers, &cookie);
}

fn clear_cookie(headers: &mut HeaderMap) {
    let cookie = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax");
    append_cookie(headers, &cookie);
}

fn append_cookie(headers: &mut HeaderMap, cookie: &str) {
    match HeaderValue::from_str(cookie) {
        Ok(v) => {
            headers.append(header::SET_COOKIE, v);
        }
        Err(e) => tracing::warn!(error = %e, "session cookie is not a valid header value"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn finds_session_cookie_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("a=1; slate_session=abc; b=2"));
        assert_eq!(session_cookie(&headers).as_deref(), Some("abc"));
    }

    #[test]
    fn missing_or_empty_cookie_is_none() {
        let mut headers = HeaderMap::new();
        assert!(session_cookie(&headers).is_none());
        headers.insert(header::COOKIE, HeaderValue::from_static("slate_session="));
        assert!(session_cookie(&headers).is_none());
    }

    #[test]
    fn public_paths() {
        assert!(is_public("/"));
        assert!(is_public("/login"));
        assert!(is_public("/static/style.css"));
        assert!(!is_public("/content"));
        assert!(!is_public("/api/content"));
        assert!(!is_public("/staticky"));
    }

    #[test]
    fn cookie_attributes() {
        let mut headers = HeaderMap::new();
        set_cookie(&mut headers, "abc", Duration::from_secs(60));
        let value = headers.get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert_eq!(value, "slate_session=abc; Path=/; Max-Age=60; HttpOnly; SameSite=Lax");
    }
}
