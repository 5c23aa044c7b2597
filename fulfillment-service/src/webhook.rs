use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use common_http_errors::ApiError;
use sqlx::PgPool;

use crate::app::AppState;
use crate::orders::{self, Order, OrderError};
use crate::provider::{EventKind, ProviderError, ProviderEvent};

/// The idempotency gate: a recorded event id means the delivery was already
/// fully processed and is acknowledged without side effects.
pub async fn already_processed(db: &PgPool, event_id: &str) -> Result<bool, sqlx::Error> {
    let hit = sqlx::query_scalar::<_, i32>(
        "SELECT 1 FROM processed_webhook_events WHERE event_id = $1",
    )
    .bind(event_id)
    .fetch_optional(db)
    .await?;
    Ok(hit.is_some())
}

/// Recorded only after successful processing: at-least-once delivery in,
/// at-most-once effect out. A crash mid-processing leaves no record, and
/// the retried delivery redoes idempotent work.
pub async fn mark_processed(db: &PgPool, event_id: &str, provider: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO processed_webhook_events (event_id, provider) VALUES ($1, $2) \
         ON CONFLICT (event_id) DO NOTHING",
    )
    .bind(event_id)
    .bind(provider)
    .execute(db)
    .await?;
    Ok(())
}

async fn find_target_order(
    state: &AppState,
    provider_name: &str,
    event: &ProviderEvent,
) -> Result<Option<Order>, OrderError> {
    if let Some(session_id) = &event.session_id {
        if let Some(order) = orders::find_by_session(&state.db, provider_name, session_id).await? {
            return Ok(Some(order));
        }
    }
    // Providers that echo our metadata let us correlate without a session.
    if let Some(order_id) = event
        .metadata
        .get("order_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<uuid::Uuid>().ok())
    {
        return match orders::get_order(&state.db, order_id).await {
            Ok(order) => Ok(Some(order)),
            Err(OrderError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        };
    }
    Ok(None)
}

async fn dispatch(
    state: &AppState,
    provider_name: &str,
    event: &ProviderEvent,
) -> Result<(), OrderError> {
    match &event.kind {
        EventKind::CheckoutCompleted => {
            let Some(order) = find_target_order(state, provider_name, event).await? else {
                tracing::warn!(
                    provider = provider_name,
                    event_id = %event.event_id,
                    "Completed checkout for an unknown session; acknowledging"
                );
                return Ok(());
            };
            match orders::complete_order(
                &state.db,
                &state.metrics,
                &state.notify,
                order.id,
                event.payment_reference.as_deref(),
            )
            .await
            {
                Ok(outcome) => {
                    if outcome.already_paid {
                        tracing::info!(order_id = %order.id, "Order already paid; no-op");
                    }
                    Ok(())
                }
                // Out-of-order with an expiry: a benign no-op, not an error.
                Err(OrderError::InvalidTransition { from, to }) => {
                    tracing::info!(order_id = %order.id, from, to, "Ignoring dead transition");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
        EventKind::CheckoutExpired => {
            let Some(order) = find_target_order(state, provider_name, event).await? else {
                tracing::warn!(
                    provider = provider_name,
                    event_id = %event.event_id,
                    "Expired checkout for an unknown session; acknowledging"
                );
                return Ok(());
            };
            match orders::cancel_order(
                &state.db,
                &state.metrics,
                &state.notify,
                order.id,
                state.purchase_window,
            )
            .await
            {
                Ok(_) => Ok(()),
                Err(OrderError::InvalidTransition { from, to }) => {
                    tracing::info!(order_id = %order.id, from, to, "Ignoring dead transition");
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }
        EventKind::PaymentRefunded => {
            // Queued for the manual refund-order flow; the paid -> refunded
            // transition stays an operator action.
            tracing::info!(
                provider = provider_name,
                event_id = %event.event_id,
                payment_reference = ?event.payment_reference,
                "Refund reported by provider"
            );
            Ok(())
        }
        EventKind::Other(event_type) => {
            tracing::info!(provider = provider_name, event_type = %event_type, "Unhandled event type");
            Ok(())
        }
    }
}

/// `POST /webhooks/{provider}`. 2xx acknowledges (including duplicates) so
/// the provider stops retrying; 4xx rejects bad signatures/payloads without
/// touching idempotency state; 5xx invites a retry for genuine failures.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(provider) = state.providers.get(&provider_name) else {
        return Err(ApiError::not_found("unknown_provider"));
    };

    let event = match provider.verify_and_parse(&headers, &body, Utc::now()) {
        Ok(event) => event,
        Err(ProviderError::Signature) => {
            state
                .metrics
                .webhook_rejected
                .with_label_values(&[provider.name(), "signature"])
                .inc();
            tracing::warn!(provider = provider.name(), "Webhook signature verification failed");
            return Err(ApiError::unauthorized("sig_mismatch"));
        }
        Err(ProviderError::Payload(detail)) => {
            state
                .metrics
                .webhook_rejected
                .with_label_values(&[provider.name(), "payload"])
                .inc();
            tracing::warn!(provider = provider.name(), detail = %detail, "Malformed webhook payload");
            return Err(ApiError::BadRequest {
                code: "malformed_payload",
                trace_id: None,
                message: Some(detail),
            });
        }
        Err(ProviderError::Checkout(detail)) => {
            return Err(ApiError::internal(detail, None));
        }
    };

    tracing::info!(
        provider = provider.name(),
        event_id = %event.event_id,
        kind = ?event.kind,
        "Received webhook event"
    );

    if already_processed(&state.db, &event.event_id)
        .await
        .map_err(|err| ApiError::internal(err, None))?
    {
        state.metrics.webhook_duplicates.inc();
        return Ok(Json(serde_json::json!({ "received": true, "duplicate": true })));
    }

    dispatch(&state, provider.name(), &event)
        .await
        .map_err(|err| {
            tracing::error!(
                provider = provider.name(),
                event_id = %event.event_id,
                error = %err,
                "Webhook processing failed"
            );
            ApiError::internal(err, None)
        })?;

    mark_processed(&state.db, &event.event_id, provider.name())
        .await
        .map_err(|err| ApiError::internal(err, None))?;

    Ok(Json(serde_json::json!({ "received": true })))
}
