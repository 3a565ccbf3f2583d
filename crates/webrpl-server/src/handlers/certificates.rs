use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::assets::decode_payload;
use crate::error::{Result, ValidationError};
use crate::http::{success, JsonBody, Session};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct UploadTemplateData {
    #[serde(alias = "event_id")]
    id: i32,
    #[serde(default)]
    data_html: String,
    #[serde(default)]
    data_img: String,
}

pub async fn handle_upload_template(
    State(state): State<AppState>,
    Session(claims): Session,
    JsonBody(payload): JsonBody<UploadTemplateData>,
) -> Result<Response> {
    state.assets.authorize_template_access(&claims, payload.id).await?;
    if payload.data_html.is_empty() {
        return Err(ValidationError::MissingField("data_html").into());
    }
    if payload.data_img.is_empty() {
        return Err(ValidationError::MissingField("data_img").into());
    }

    let paths = state
        .assets
        .upload_template(payload.id, &payload.data_html, &payload.data_img)
        .await?;
    Ok(success("Certificate Template uploaded.", paths))
}

#[derive(Debug, Deserialize)]
pub struct UploadHtmlData {
    #[serde(alias = "event_id")]
    id: i32,
    #[serde(default)]
    data_html: String,
}

pub async fn handle_upload_html(
    State(state): State<AppState>,
    Session(claims): Session,
    JsonBody(payload): JsonBody<UploadHtmlData>,
) -> Result<Response> {
    state.assets.authorize_template_access(&claims, payload.id).await?;
    if payload.data_html.is_empty() {
        return Err(ValidationError::MissingField("data_html").into());
    }

    let saved_html = state.assets.upload_html(payload.id, &payload.data_html).await?;
    Ok(success(
        "Certificate HTML uploaded.",
        serde_json::json!({ "saved_html": saved_html }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UploadImageData {
    #[serde(alias = "event_id")]
    id: i32,
    #[serde(default)]
    data_img: String,
}

pub async fn handle_upload_image(
    State(state): State<AppState>,
    Session(claims): Session,
    JsonBody(payload): JsonBody<UploadImageData>,
) -> Result<Response> {
    state.assets.authorize_template_access(&claims, payload.id).await?;
    if payload.data_img.is_empty() {
        return Err(ValidationError::MissingField("data_img").into());
    }

    let saved_image = state.assets.upload_image(payload.id, &payload.data_img).await?;
    Ok(success(
        "Certificate image uploaded.",
        serde_json::json!({ "saved_image": saved_image }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UploadArchiveData {
    #[serde(alias = "event_id")]
    id: i32,
    #[serde(default)]
    data_zip: String,
}

pub async fn handle_upload_archive(
    State(state): State<AppState>,
    Session(claims): Session,
    JsonBody(payload): JsonBody<UploadArchiveData>,
) -> Result<Response> {
    state.assets.authorize_template_access(&claims, payload.id).await?;
    if payload.data_zip.is_empty() {
        return Err(ValidationError::MissingField("data_zip").into());
    }

    let bytes = decode_payload(&payload.data_zip)?;
    let paths = state.assets.upload_archive(payload.id, bytes).await?;
    Ok(success("Certificate Template archive installed.", paths))
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplateRecordData {
    #[serde(alias = "id")]
    event_id: i32,
}

pub async fn handle_create_template_record(
    State(state): State<AppState>,
    Session(claims): Session,
    JsonBody(payload): JsonBody<CreateTemplateRecordData>,
) -> Result<Response> {
    state.assets.authorize_template_access(&claims, payload.event_id).await?;
    let (row, created) = state.assets.create_template_record(payload.event_id).await?;

    let message = if created {
        "Certificate template created."
    } else {
        "Certificate template already exists."
    };
    Ok(success(
        message,
        serde_json::json!({
            "id": row.event_id,
            "cert_template_id": row.id,
            "template_path": row.template_path,
        }),
    ))
}

/// Public certificate page for a participation code.
pub async fn handle_certificate(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Response> {
    let html = state.renderer.certificate(&code).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response())
}
