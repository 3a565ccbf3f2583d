pub mod auth;
pub mod certificates;
pub mod otp;
pub mod participation;

use std::io;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::http::{cors, internal_error_response, not_found, success};
use crate::AppState;

/// Template uploads carry base64 payloads; everything else stays on axum's default.
const UPLOAD_BODY_LIMIT: usize = 24 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/register-admin", post(auth::handle_register_admin))
        .route("/user-set-tier", post(auth::handle_set_tier))
        .route("/user-edit", post(auth::handle_change_password))
        .route("/cleanup-otp-code", post(otp::handle_cleanup_otp))
        .route("/event-participate", post(participation::handle_event_participate))
        .route("/event-participate-absence", post(participation::handle_event_absence))
        .route("/cert-upload-template", post(certificates::handle_upload_template))
        .route("/cert-upload-html", post(certificates::handle_upload_html))
        .route("/cert-upload-image", post(certificates::handle_upload_image))
        .route("/cert-upload-archive", post(certificates::handle_upload_archive))
        .route("/create-new-cert-from-event", post(certificates::handle_create_template_record))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT));

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/login", post(auth::handle_login))
        .route("/api/register", post(auth::handle_register))
        .route("/api/reset-password", post(auth::handle_reset_password))
        .route("/api/gen-otp-for-register", get(otp::handle_gen_otp))
        .route("/api/certificate/:code", get(certificates::handle_certificate))
        .route("/static/*path", get(handle_static))
        .nest("/api/protected", protected)
        .fallback(handle_fallback)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

async fn handle_health() -> Response {
    success(
        "ok",
        serde_json::json!({
            "ok": true,
            "service": "webrpl",
        }),
    )
}

async fn handle_fallback() -> Response {
    not_found()
}

fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        _ => "application/octet-stream",
    }
}

/// Serve uploaded assets from the blob store.
async fn handle_static(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    match state.store.read(&path).await {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, content_type_for(&path))], bytes).into_response(),
        Ok(None) => not_found(),
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => not_found(),
        Err(e) => internal_error_response("Failed to read static asset", &e),
    }
}
