use axum::extract::{Path, State};
use axum::Json;
use common_http_errors::ApiError;
use serde::Deserialize;
use uuid::Uuid;

use crate::app::AppState;
use crate::waitlist::{self, WaitlistEntry};

#[derive(Debug, Deserialize)]
pub struct JoinWaitlistRequest {
    pub edition_id: Uuid,
    pub ticket_type_id: Uuid,
    pub buyer_email: String,
    pub buyer_name: String,
}

/// Joining is only allowed once the type is sold out; the assigned position
/// is strictly first-come-first-served.
pub async fn join_waitlist(
    State(state): State<AppState>,
    Json(payload): Json<JoinWaitlistRequest>,
) -> Result<Json<WaitlistEntry>, ApiError> {
    let entry = waitlist::join(
        &state.db,
        payload.edition_id,
        payload.ticket_type_id,
        payload.buyer_email.trim().to_lowercase().as_str(),
        payload.buyer_name.trim(),
    )
    .await?;
    Ok(Json(entry))
}

pub async fn get_waitlist_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<WaitlistEntry>, ApiError> {
    let entry = waitlist::get_entry(&state.db, entry_id)
        .await
        .map_err(|err| ApiError::internal(err, None))?
        .ok_or(ApiError::not_found("waitlist_entry_not_found"))?;
    Ok(Json(entry))
}

pub async fn leave_waitlist(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<WaitlistEntry>, ApiError> {
    let entry = waitlist::cancel_entry(&state.db, entry_id).await?;
    Ok(Json(entry))
}
