//! HTTP route modules and the router that ties them together.

pub mod content;
pub mod pages;

use std::sync::Arc;

use axum::http::{HeaderValue, Method, header};
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::session_middleware;
use crate::state::AppState;

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .merge(content::router())
        .merge(pages::router())
        .route("/health", get(health))
        .nest_service("/static", ServeDir::new(&state.static_dir))
        .fallback(pages::fallback)
        .layer(from_fn_with_state(Arc::clone(&state), session_middleware))
        .layer(TimeoutLayer::new(state.request_timeout))
        .layer(request_limit(state.concurrency))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Cap on requests in flight across every route.
///
/// `Router::layer` wraps each route on its own, so the semaphore has to be
/// shared between the copies rather than created per route.
fn request_limit(max: usize) -> GlobalConcurrencyLimitLayer {
    GlobalConcurrencyLimitLayer::new(max)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::Notify;
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn request_limit_spans_all_routes() {
        let release = Arc::new(Notify::new());
        let held = Arc::clone(&release);
        let app: Router = Router::new()
            .route(
                "/slow",
                get(move || {
                    let held = Arc::clone(&held);
                    async move { held.notified().await }
                }),
            )
            .route("/fast", get(|| async {}))
            .layer(request_limit(1));

        let slow = tokio::spawn(
            app.clone()
                .oneshot(Request::get("/slow").body(Body::empty()).unwrap()),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            app.clone().oneshot(Request::get("/fast").body(Body::empty()).unwrap()),
        )
        .await;
        assert!(blocked.is_err(), "second route ran past the shared limit");

        release.notify_one();
        assert_eq!(slow.await.unwrap().unwrap().status(), StatusCode::OK);
        let resp = app
            .oneshot(Request::get("/fast").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
