use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use common_http_errors::ApiError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppState;
use crate::inventory::{self, InventoryError};
use crate::orders::{self, NewOrder, NewOrderItem, Order, OrderError, OrderItem};
use crate::promo::PromoError;
use crate::provider::CheckoutRequest;
use crate::tickets::{self, Ticket};
use crate::waitlist::WaitlistError;

impl From<OrderError> for ApiError {
    fn from(err: OrderError) -> Self {
        match err {
            OrderError::NotFound(_) => ApiError::not_found("order_not_found"),
            OrderError::InvalidTransition { .. } => {
                ApiError::conflict("invalid_transition", Some(err.to_string()))
            }
            OrderError::Validation(message) => ApiError::BadRequest {
                code: "invalid_order",
                trace_id: None,
                message: Some(message),
            },
            OrderError::Promo(PromoError::Rejected(rejection)) => ApiError::BadRequest {
                code: rejection.code(),
                trace_id: None,
                message: Some(rejection.to_string()),
            },
            OrderError::Promo(PromoError::Db(err)) => ApiError::internal(err, None),
            OrderError::Inventory(err) => err.into(),
            OrderError::Waitlist(err) => err.into(),
            OrderError::Ticket(err) => ApiError::internal(err, None),
            OrderError::Db(err) => ApiError::internal(err, None),
        }
    }
}

impl From<InventoryError> for ApiError {
    fn from(err: InventoryError) -> Self {
        match err {
            InventoryError::InsufficientCapacity { .. } => {
                ApiError::conflict("insufficient_capacity", Some(err.to_string()))
            }
            InventoryError::UnknownTicketType(_) => ApiError::BadRequest {
                code: "unknown_ticket_type",
                trace_id: None,
                message: Some(err.to_string()),
            },
            InventoryError::Contention(_) => {
                ApiError::conflict("capacity_contention", Some(err.to_string()))
            }
            InventoryError::Db(err) => ApiError::internal(err, None),
        }
    }
}

impl From<WaitlistError> for ApiError {
    fn from(err: WaitlistError) -> Self {
        match err {
            WaitlistError::NotSoldOut(_) => ApiError::BadRequest {
                code: "not_sold_out",
                trace_id: None,
                message: Some(err.to_string()),
            },
            WaitlistError::AlreadyWaiting => {
                ApiError::conflict("already_waiting", Some(err.to_string()))
            }
            WaitlistError::NotFound(_) => ApiError::not_found("waitlist_entry_not_found"),
            WaitlistError::NotConvertible(_) => {
                ApiError::conflict("waitlist_not_convertible", Some(err.to_string()))
            }
            WaitlistError::PositionContention(_) => {
                ApiError::conflict("waitlist_contention", Some(err.to_string()))
            }
            WaitlistError::Inventory(err) => err.into(),
            WaitlistError::Db(err) => ApiError::internal(err, None),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OrderItemPayload {
    pub ticket_type_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub edition_id: Uuid,
    pub buyer_email: String,
    pub buyer_name: String,
    pub items: Vec<OrderItemPayload>,
    pub promo_code: Option<String>,
    pub waitlist_entry_id: Option<Uuid>,
    pub provider: Option<String>,
    pub success_url: Option<String>,
    pub cancel_url: Option<String>,
}

/// Exposed ticket shape: enough for the buyer and the offline scanner.
#[derive(Debug, Serialize)]
pub struct TicketView {
    pub id: Uuid,
    pub code: String,
    pub status: String,
    pub qr_payload: String,
}

impl From<Ticket> for TicketView {
    fn from(t: Ticket) -> Self {
        Self { id: t.id, code: t.code, status: t.status, qr_payload: t.qr_payload }
    }
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub tickets: Vec<TicketView>,
    pub completed: bool,
    pub checkout_url: Option<String>,
    pub provider_session_id: Option<String>,
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<CreateOrderResponse>, ApiError> {
    let new_order = NewOrder {
        edition_id: payload.edition_id,
        buyer_email: payload.buyer_email.trim().to_lowercase(),
        buyer_name: payload.buyer_name.trim().to_string(),
        items: payload
            .items
            .iter()
            .map(|item| NewOrderItem {
                ticket_type_id: item.ticket_type_id,
                quantity: item.quantity,
            })
            .collect(),
        promo_code: payload.promo_code.clone(),
        waitlist_entry_id: payload.waitlist_entry_id,
    };

    let created =
        orders::create_order(&state.db, &state.metrics, &state.notify, new_order, Utc::now())
            .await?;

    if created.completed {
        return Ok(Json(CreateOrderResponse {
            order: created.order,
            items: created.items,
            tickets: created.tickets.into_iter().map(TicketView::from).collect(),
            completed: true,
            checkout_url: None,
            provider_session_id: None,
        }));
    }

    let provider_name = payload
        .provider
        .unwrap_or_else(|| state.default_provider.clone());
    let Some(provider) = state.providers.get(&provider_name) else {
        // The reservation must not stay parked on a dead order.
        let _ = orders::cancel_order(
            &state.db,
            &state.metrics,
            &state.notify,
            created.order.id,
            state.purchase_window,
        )
        .await;
        return Err(ApiError::BadRequest {
            code: "unknown_provider",
            trace_id: None,
            message: Some(format!("payment provider {provider_name} is not configured")),
        });
    };

    let mut names: HashMap<Uuid, String> = HashMap::new();
    for item in &created.items {
        if let Some(ticket_type) = inventory::get_ticket_type(&state.db, item.ticket_type_id)
            .await
            .map_err(|err| ApiError::internal(err, None))?
        {
            names.insert(ticket_type.id, ticket_type.name);
        }
    }

    let checkout_request = CheckoutRequest::from_order(
        &created.order,
        &created.items,
        &names,
        payload
            .success_url
            .unwrap_or_else(|| state.checkout_success_url.clone()),
        payload
            .cancel_url
            .unwrap_or_else(|| state.checkout_cancel_url.clone()),
    );

    let session = match provider.create_checkout(&checkout_request).await {
        Ok(session) => session,
        Err(err) => {
            tracing::error!(
                order_id = %created.order.id,
                provider = provider.name(),
                error = %err,
                "Checkout creation failed; cancelling order"
            );
            let _ = orders::cancel_order(
                &state.db,
                &state.metrics,
                &state.notify,
                created.order.id,
                state.purchase_window,
            )
            .await;
            return Err(ApiError::internal(err, None));
        }
    };

    orders::set_provider_session(&state.db, created.order.id, provider.name(), &session.session_id)
        .await?;
    let order = orders::get_order(&state.db, created.order.id).await?;

    Ok(Json(CreateOrderResponse {
        order,
        items: created.items,
        tickets: Vec::new(),
        completed: false,
        checkout_url: Some(session.redirect_url),
        provider_session_id: Some(session.session_id),
    }))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ApiError> {
    let order = orders::get_order(&state.db, order_id).await?;
    Ok(Json(order))
}

pub async fn get_order_tickets(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<TicketView>>, ApiError> {
    // 404 for unknown orders, empty list for unpaid ones.
    orders::get_order(&state.db, order_id).await?;
    let tickets = tickets::list_for_order(&state.db, order_id)
        .await
        .map_err(|err| ApiError::internal(err, None))?;
    Ok(Json(tickets.into_iter().map(TicketView::from).collect()))
}

/// User/admin-initiated cancellation; unlike the webhook path, an invalid
/// transition here is a real 409.
pub async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ApiError> {
    let order = orders::cancel_order(
        &state.db,
        &state.metrics,
        &state.notify,
        order_id,
        state.purchase_window,
    )
    .await?;
    Ok(Json(order))
}

pub async fn refund_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, ApiError> {
    let order = orders::refund_order(
        &state.db,
        &state.metrics,
        &state.notify,
        order_id,
        state.purchase_window,
    )
    .await?;
    Ok(Json(order))
}
