//! Content API routes: `/api/content`, `/api/export`, `/api/import`.
//!
//! Every handler works through the configured [`ContentRepository`] and the
//! caller's session, so the same code serves both deployment modes.
//!
//! [`ContentRepository`]: slate_core::repository::ContentRepository

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Path, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Serialize;

use slate_core::content::{Content, parse_body};
use slate_core::envelope::ExportEnvelope;

use crate::error::AppError;
use crate::middleware::CurrentSession;
use crate::state::AppState;

/// Multipart field carrying an uploaded export file.
const IMPORT_FIELD: &str = "importFile";

/// Build the content API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/content", get(list_content).post(create_content))
        .route(
            "/api/content/{id}",
            get(get_content).put(update_content).delete(delete_content),
        )
        .route("/api/export", post(export_content))
        .route("/api/import", post(import_content))
}

#[derive(Serialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

async fn list_content(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
) -> Result<Json<Vec<Content>>, AppError> {
    let mut session = current.lock().await;
    let mut items = state.repository.list(&mut session).await?;
    items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
    Ok(Json(items))
}

async fn get_content(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(id): Path<String>,
) -> Result<Json<Content>, AppError> {
    let mut session = current.lock().await;
    state
        .repository
        .get(&mut session, &id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("content not found: {id}")))
}

async fn create_content(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreatedResponse>), AppError> {
    let body = parse_body(&body)?;
    let mut session = current.lock().await;
    let item = state.repository.create(&mut session, body).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id: item.id })))
}

async fn update_content(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let body = parse_body(&body)?;
    let mut session = current.lock().await;
    state.repository.update(&mut session, &id, body).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_content(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let mut session = current.lock().await;
    state.repository.delete(&mut session, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn export_content(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
) -> Result<Response, AppError> {
    let envelope = {
        let mut session = current.lock().await;
        state.repository.export(&mut session).await?
    };
    let bytes = envelope.to_vec()?;
    let filename = format!("slate_export_{}.json", Utc::now().format("%Y%m%d_%H%M%S"));
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .map_err(|e| AppError::Internal(format!("bad content-disposition: {e}")))?;

    let mut resp = bytes.into_response();
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::CONTENT_DISPOSITION, disposition);
    Ok(resp)
}

async fn import_content(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    req: Request,
) -> Result<Json<MessageResponse>, AppError> {
    let bytes = read_import_payload(req, &state).await?;
    let envelope = ExportEnvelope::parse(&bytes)?;
    let imported = {
        let mut session = current.lock().await;
        state.repository.import(&mut session, envelope).await?
    };
    tracing::info!(items = imported, "import accepted");
    Ok(Json(MessageResponse {
        message: "Import successful",
    }))
}

/// The uploaded document: the `importFile` part of a multipart form, or the
/// raw request body otherwise.
async fn read_import_payload(req: Request, state: &Arc<AppState>) -> Result<Bytes, AppError> {
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    if !is_multipart {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| AppError::BadRequest(format!("failed to read request body: {e}")))?;
        if body.is_empty() {
            return Err(AppError::BadRequest("import body is empty".to_owned()));
        }
        return Ok(body);
    }

    let mut multipart = Multipart::from_request(req, state)
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to parse multipart form: {e}")))?;
    let mut found: Option<Bytes> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("failed to parse multipart form: {e}")))?
    {
        if field.name() != Some(IMPORT_FIELD) {
            continue;
        }
        if found.is_some() {
            return Err(AppError::BadRequest(format!(
                "multiple files uploaded with name '{IMPORT_FIELD}', expected one"
            )));
        }
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("failed to read uploaded file: {e}")))?;
        found = Some(data);
    }
    found.ok_or_else(|| AppError::BadRequest(format!("no file uploaded with name '{IMPORT_FIELD}'")))
}
