use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;

use crate::error::Result;
use crate::http::{success, JsonBody, Session};
use crate::jwt::Tier;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginData {
    #[serde(default)]
    email: String,
    #[serde(default)]
    pass: String,
}

pub async fn handle_login(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<LoginData>,
) -> Result<Response> {
    let (user, token) = state.credentials.login(&payload.email, &payload.pass).await?;

    Ok(success(
        "successfully logged in.",
        serde_json::json!({
            "user": user,
            "token": token,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RegisterData {
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    pass: String,
    instance: Option<String>,
}

pub async fn handle_register(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<RegisterData>,
) -> Result<Response> {
    let user = state
        .credentials
        .register(&payload.email, &payload.name, &payload.pass, payload.instance)
        .await?;

    tracing::info!(user_id = %user.id, "user registered");
    Ok(success("successfully created new user", user))
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordData {
    #[serde(default)]
    email: String,
    #[serde(default, alias = "code")]
    otp: String,
    #[serde(default)]
    pass: String,
}

pub async fn handle_reset_password(
    State(state): State<AppState>,
    JsonBody(payload): JsonBody<ResetPasswordData>,
) -> Result<Response> {
    state
        .credentials
        .reset_password(&payload.email, &payload.otp, &payload.pass)
        .await?;

    Ok(success("password updated.", serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct RegisterWithTierData {
    #[serde(default)]
    email: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    pass: String,
    instance: Option<String>,
    /// Integer tier code; administrators when omitted.
    tier: Option<Tier>,
}

pub async fn handle_register_admin(
    State(state): State<AppState>,
    Session(claims): Session,
    JsonBody(payload): JsonBody<RegisterWithTierData>,
) -> Result<Response> {
    let user = state
        .credentials
        .register_with_tier(
            &claims,
            &payload.email,
            &payload.name,
            &payload.pass,
            payload.instance,
            payload.tier.unwrap_or(Tier::Administrator),
        )
        .await?;

    Ok(success("successfully created new user", user))
}

#[derive(Debug, Deserialize)]
pub struct SetTierData {
    #[serde(default)]
    email: String,
    tier: Tier,
}

pub async fn handle_set_tier(
    State(state): State<AppState>,
    Session(claims): Session,
    JsonBody(payload): JsonBody<SetTierData>,
) -> Result<Response> {
    let user = state
        .credentials
        .set_tier(&claims, &payload.email, payload.tier)
        .await?;

    Ok(success("user tier updated.", user))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordData {
    #[serde(default)]
    old_pass: String,
    #[serde(default)]
    pass: String,
}

/// Change the password of the session's own identity.
pub async fn handle_change_password(
    State(state): State<AppState>,
    Session(claims): Session,
    JsonBody(payload): JsonBody<ChangePasswordData>,
) -> Result<Response> {
    state
        .credentials
        .change_password(&claims.email, &payload.old_pass, &payload.pass)
        .await?;

    Ok(success("password updated.", serde_json::Value::Null))
}
