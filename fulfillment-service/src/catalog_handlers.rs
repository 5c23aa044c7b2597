use axum::extract::{Query, State};
use axum::Json;
use common_http_errors::ApiError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppState;
use crate::inventory::{self, available_public, TicketType};

#[derive(Debug, Deserialize)]
pub struct CatalogQuery {
    pub edition_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct TicketTypeView {
    #[serde(flatten)]
    pub ticket_type: TicketType,
    /// Units the public can still buy; `null` means unlimited.
    pub available: Option<i32>,
}

/// Public sales catalog for one edition.
pub async fn list_ticket_types(
    State(state): State<AppState>,
    Query(query): Query<CatalogQuery>,
) -> Result<Json<Vec<TicketTypeView>>, ApiError> {
    let types = inventory::list_ticket_types(&state.db, query.edition_id)
        .await
        .map_err(|err| ApiError::internal(err, None))?;
    let views = types
        .into_iter()
        .map(|t| {
            let available = available_public(t.max_quantity, t.sold_count, t.waitlist_held);
            TicketTypeView { ticket_type: t, available }
        })
        .collect();
    Ok(Json(views))
}
