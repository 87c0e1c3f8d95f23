//! Server-rendered HTML pages and the login flow.
//!
//! Pages are small enough to build as strings. Anything taken from content
//! items or the session goes through [`escape`] first. Create, edit and
//! delete run in the browser against the JSON API (`/static/app.js`).

use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Extension, Form, Router};
use serde::Deserialize;

use slate_core::content::Content;
use slate_core::login::take_flash_messages;
use slate_core::session::{SessionValue, USERNAME_KEY};

use crate::error::AppError;
use crate::middleware::CurrentSession;
use crate::state::AppState;

/// Build the page router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(index))
        .route("/login", get(login_form).post(login_submit))
        .route("/logout", get(logout))
        .route("/content", get(content_list))
        .route("/content/new", get(content_new))
        .route("/content/{id}", get(content_view))
        .route("/content/{id}/edit", get(content_edit))
        .route("/admin", get(admin))
        .route("/settings", get(settings))
        .route("/404", get(not_found))
}

/// Escape text for HTML element and attribute content.
pub fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Who is looking at the page.
struct Viewer {
    username: Option<String>,
}

impl Viewer {
    async fn of(current: &CurrentSession) -> Self {
        let session = current.lock().await;
        let username = session
            .is_authenticated()
            .then(|| {
                session
                    .get(USERNAME_KEY)
                    .and_then(SessionValue::as_text)
                    .unwrap_or("admin")
                    .to_owned()
            });
        Self { username }
    }
}

fn layout(title: &str, viewer: &Viewer, body: &str) -> Html<String> {
    let mut html = String::with_capacity(body.len().saturating_add(1024));
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\"><head><meta charset=\"utf-8\"/>");
    html.push_str("<meta name=\"viewport\" content=\"width=device-width,initial-scale=1\"/>");
    let _ = write!(html, "<title>{} &middot; Slate</title>", escape(title));
    html.push_str("<link rel=\"stylesheet\" href=\"/static/style.css\"/>");
    html.push_str("<script src=\"/static/app.js\" defer></script></head><body>");
    html.push_str("<nav class=\"nav\"><a class=\"brand\" href=\"/\">Slate</a><div class=\"links\">");
    match &viewer.username {
        Some(name) => {
            html.push_str("<a href=\"/content\">Content</a><a href=\"/admin\">Admin</a>");
            html.push_str("<a href=\"/settings\">Settings</a>");
            let _ = write!(
                html,
                "<span class=\"who\">{}</span><a href=\"/logout\">Log out</a>",
                escape(name)
            );
        }
        None => html.push_str("<a href=\"/login\">Log in</a>"),
    }
    html.push_str("</div></nav><main>");
    html.push_str(body);
    html.push_str("</main></body></html>");
    Html(html)
}

fn fmt_time(t: chrono::DateTime<chrono::Utc>) -> String {
    t.format("%Y-%m-%d %H:%M UTC").to_string()
}

async fn index(Extension(current): Extension<CurrentSession>) -> Html<String> {
    let viewer = Viewer::of(&current).await;
    let action = if viewer.username.is_some() {
        "<a class=\"btn\" href=\"/content\">Go to content</a>"
    } else {
        "<a class=\"btn\" href=\"/login\">Log in to manage content</a>"
    };
    let body = format!(
        "<section class=\"hero\"><h1>Slate</h1>\
         <p>Modern, lightweight content management.</p>{action}</section>"
    );
    layout("Home", &viewer, &body)
}

async fn login_form(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
) -> Html<String> {
    let flashes = {
        let mut session = current.lock().await;
        let flashes = take_flash_messages(&mut session);
        if !flashes.is_empty() {
            if let Err(e) = state.sessions.save(&session).await {
                tracing::warn!(error = %e, "failed to save session after reading login messages");
            }
        }
        flashes
    };
    let viewer = Viewer::of(&current).await;

    let mut body = String::from("<section class=\"card narrow\"><h1>Log in</h1>");
    if let Some(msg) = &flashes.lockout {
        let _ = write!(body, "<p class=\"alert lockout\">{}</p>", escape(msg));
    }
    if let Some(msg) = &flashes.error {
        let _ = write!(body, "<p class=\"alert error\">{}</p>", escape(msg));
    }
    body.push_str(
        "<form method=\"post\" action=\"/login\">\
         <label>Username <input name=\"username\" autocomplete=\"username\" required/></label>\
         <label>Password <input name=\"password\" type=\"password\" autocomplete=\"current-password\" required/></label>\
         <button class=\"btn\" type=\"submit\">Log in</button></form></section>",
    );
    layout("Login", &viewer, &body)
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn login_submit(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Form(form): Form<LoginForm>,
) -> Result<Redirect, AppError> {
    let mut session = current.lock().await;
    let outcome = state
        .login
        .attempt(&mut session, &form.username, &form.password)
        .await?;
    Ok(Redirect::to(&outcome.redirect))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
) -> Result<Redirect, AppError> {
    let session = current.lock().await;
    if let Some(name) = session.get(USERNAME_KEY).and_then(SessionValue::as_text) {
        tracing::info!(user = %name, "logging out");
    }
    state.sessions.destroy(session.id()).await?;
    current.mark_destroyed();
    Ok(Redirect::to("/login"))
}

async fn content_list(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
) -> Result<Html<String>, AppError> {
    let mut items = {
        let mut session = current.lock().await;
        state.repository.list(&mut session).await?
    };
    items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
    let viewer = Viewer::of(&current).await;

    let mut body = String::from(
        "<section><div class=\"toolbar\"><h1>Content</h1>\
         <a class=\"btn\" href=\"/content/new\">New item</a></div>",
    );
    if items.is_empty() {
        body.push_str("<p class=\"empty\">No content yet.</p>");
    } else {
        body.push_str(
            "<table><thead><tr><th>Title</th><th>Status</th><th>Updated</th><th></th></tr></thead><tbody>",
        );
        for item in &items {
            let id = escape(&item.id);
            let _ = write!(
                body,
                "<tr><td><a href=\"/content/{id}\">{}</a></td><td><span class=\"status\">{}</span></td>\
                 <td>{}</td><td class=\"actions\"><a href=\"/content/{id}/edit\">Edit</a>\
                 <button class=\"link danger\" data-delete=\"{id}\">Delete</button></td></tr>",
                escape(&item.title),
                escape(&item.status),
                fmt_time(item.updated_at),
            );
        }
        body.push_str("</tbody></table>");
    }
    body.push_str("</section>");
    Ok(layout("Content", &viewer, &body))
}

async fn content_new(Extension(current): Extension<CurrentSession>) -> Html<String> {
    let viewer = Viewer::of(&current).await;
    layout("New content", &viewer, &editor(None))
}

async fn content_view(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let Some(item) = find(&state, &current, &id).await? else {
        return Ok(not_found_page(&current).await);
    };
    let viewer = Viewer::of(&current).await;

    let mut body = String::from("<article class=\"card\">");
    let _ = write!(
        body,
        "<h1>{}</h1><p class=\"meta\">/{} &middot; <span class=\"status\">{}</span> &middot; updated {}</p>\
         <div class=\"body\">{}</div>\
         <p class=\"actions\"><a class=\"btn\" href=\"/content/{}/edit\">Edit</a></p></article>",
        escape(&item.title),
        escape(&item.slug),
        escape(&item.status),
        fmt_time(item.updated_at),
        escape(&item.body).replace('\n', "<br/>"),
        escape(&item.id),
    );
    Ok(layout(&item.title, &viewer, &body).into_response())
}

async fn content_edit(
    State(state): State<Arc<AppState>>,
    Extension(current): Extension<CurrentSession>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let Some(item) = find(&state, &current, &id).await? else {
        return Ok(not_found_page(&current).await);
    };
    let viewer = Viewer::of(&current).await;
    let title = format!("Edit: {}", item.title);
    Ok(layout(&title, &viewer, &editor(Some(&item))).into_response())
}

async fn find(
    state: &AppState,
    current: &CurrentSession,
    id: &str,
) -> Result<Option<Content>, AppError> {
    let mut session = current.lock().await;
    Ok(state.repository.get(&mut session, id).await?)
}

/// The create/edit form. `app.js` submits it as JSON.
fn editor(item: Option<&Content>) -> String {
    let (heading, id, title, slug, status, text) = match item {
        Some(c) => ("Edit content", c.id.as_str(), c.title.as_str(), c.slug.as_str(), c.status.as_str(), c.body.as_str()),
        None => ("New content", "", "", "", "draft", ""),
    };
    let mut options = String::new();
    for choice in ["draft", "published", "archived"] {
        let selected = if choice == status { " selected" } else { "" };
        let _ = write!(options, "<option value=\"{choice}\"{selected}>{choice}</option>");
    }
    format!(
        "<section class=\"card\"><h1>{heading}</h1>\
         <form class=\"editor\" data-id=\"{}\">\
         <label>Title <input name=\"title\" value=\"{}\" required/></label>\
         <label>Slug <input name=\"slug\" value=\"{}\"/></label>\
         <label>Status <select name=\"status\">{options}</select></label>\
         <label>Content <textarea name=\"content\" rows=\"12\">{}</textarea></label>\
         <p class=\"alert error\" hidden></p>\
         <button class=\"btn\" type=\"submit\">Save</button></form></section>",
        escape(id),
        escape(title),
        escape(slug),
        escape(text),
    )
}

async fn admin(Extension(current): Extension<CurrentSession>) -> Html<String> {
    let viewer = Viewer::of(&current).await;
    let body = "<section class=\"card\"><h1>Admin</h1>\
        <h2>Export</h2><form method=\"post\" action=\"/api/export\">\
        <button class=\"btn\" type=\"submit\">Download export</button></form>\
        <h2>Import</h2><form class=\"import\" method=\"post\" action=\"/api/import\" enctype=\"multipart/form-data\">\
        <input type=\"file\" name=\"importFile\" accept=\"application/json\" required/>\
        <button class=\"btn\" type=\"submit\">Import</button></form></section>";
    layout("Admin", &viewer, body)
}

async fn settings(Extension(current): Extension<CurrentSession>) -> Html<String> {
    let viewer = Viewer::of(&current).await;
    layout(
        "Settings",
        &viewer,
        "<section class=\"card\"><h1>Settings</h1><p>Nothing to configure yet.</p></section>",
    )
}

async fn not_found(Extension(current): Extension<CurrentSession>) -> Response {
    not_found_page(&current).await
}

async fn not_found_page(current: &CurrentSession) -> Response {
    let viewer = Viewer::of(current).await;
    let body = "<section class=\"card narrow\"><h1>404</h1>\
        <p>The requested page could not be found.</p><a href=\"/\">Home</a></section>";
    (StatusCode::NOT_FOUND, layout("Not found", &viewer, body)).into_response()
}

/// Fallback for unknown paths.
pub async fn fallback(current: Option<Extension<CurrentSession>>) -> Response {
    match current {
        Some(Extension(current)) => not_found_page(&current).await,
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
