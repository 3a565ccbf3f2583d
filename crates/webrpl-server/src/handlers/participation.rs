use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;

use crate::error::Result;
use crate::http::{success, JsonBody, Session};
use crate::participation::EventRole;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ParticipateData {
    #[serde(alias = "event_id")]
    id: i32,
    #[serde(default)]
    role: String,
}

pub async fn handle_event_participate(
    State(state): State<AppState>,
    Session(claims): Session,
    JsonBody(payload): JsonBody<ParticipateData>,
) -> Result<Response> {
    let role = EventRole::parse(&payload.role)?;
    let part = state
        .participation
        .register_participation(&claims, payload.id, role)
        .await?;

    Ok(success("New Event EventParticipant created.", part))
}

#[derive(Debug, Deserialize)]
pub struct AbsenceData {
    #[serde(default)]
    code: String,
}

pub async fn handle_event_absence(
    State(state): State<AppState>,
    Session(claims): Session,
    JsonBody(payload): JsonBody<AbsenceData>,
) -> Result<Response> {
    let part = state.participation.mark_attendance(&claims, &payload.code).await?;
    Ok(success("Attendance recorded.", part))
}
