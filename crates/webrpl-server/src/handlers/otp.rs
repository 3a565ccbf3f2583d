use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;

use crate::error::{AuthError, Result, ValidationError};
use crate::http::{success, Session};
use crate::util::{is_email_valid, normalize_email, now_ts};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GenOtpQuery {
    #[serde(default)]
    email: String,
}

/// The code is only ever handed to the notifier, never returned to the caller.
pub async fn handle_gen_otp(
    State(state): State<AppState>,
    Query(query): Query<GenOtpQuery>,
) -> Result<Response> {
    let email = normalize_email(&query.email);
    if email.is_empty() {
        return Err(ValidationError::MissingField("email").into());
    }
    if !is_email_valid(&email) {
        return Err(ValidationError::InvalidEmail.into());
    }

    state.otp.request_and_deliver(&email, state.config.otp_length).await?;

    Ok(success(
        "Generated the OTP, please check your email.",
        serde_json::Value::Null,
    ))
}

pub async fn handle_cleanup_otp(
    State(state): State<AppState>,
    Session(claims): Session,
) -> Result<Response> {
    if !claims.tier.is_admin() {
        return Err(AuthError::Forbidden.into());
    }

    let removed = state.otp.cleanup_expired(now_ts()).await?;
    tracing::info!(removed, "expired one-time codes removed");

    Ok(success(
        "Expired OTP codes removed.",
        serde_json::json!({ "removed": removed }),
    ))
}
