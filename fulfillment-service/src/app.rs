use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderValue, Method, StatusCode,
};
use axum::routing::{get, post};
use axum::{middleware, Router};
use common_observability::FulfillmentMetrics;
use prometheus::{Encoder, TextEncoder};
use sqlx::PgPool;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::catalog_handlers::list_ticket_types;
use crate::notify::NotifyHandle;
use crate::order_handlers::{
    cancel_order, create_order, get_order, get_order_tickets, refund_order,
};
use crate::provider::ProviderRegistry;
use crate::waitlist_handlers::{get_waitlist_entry, join_waitlist, leave_waitlist};
use crate::webhook::handle_webhook;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub providers: Arc<ProviderRegistry>,
    pub notify: NotifyHandle,
    pub metrics: Arc<FulfillmentMetrics>,
    /// How long a promoted waitlist entry keeps its soft-held unit.
    pub purchase_window: chrono::Duration,
    pub default_provider: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
}

pub async fn health() -> &'static str {
    "ok"
}

async fn metrics_endpoint(State(state): State<AppState>) -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encode error: {e}"),
        );
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}

async fn error_metrics_mw(
    State(metrics): State<Arc<FulfillmentMetrics>>,
    req: axum::http::Request<Body>,
    next: middleware::Next,
) -> axum::response::Response {
    let resp = next.run(req).await;
    let status = resp.status();
    if status.as_u16() >= 400 {
        let code = resp
            .headers()
            .get("x-error-code")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        metrics
            .http_errors_total
            .with_label_values(&["fulfillment-service", code, status.as_str()])
            .inc();
    }
    resp
}

pub fn build_router(state: AppState) -> Router {
    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:3001",
        "http://localhost:5173",
    ];
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE]);

    let metrics = state.metrics.clone();
    Router::new()
        .route("/healthz", get(health))
        .route("/ticket_types", get(list_ticket_types))
        .route("/orders", post(create_order))
        .route("/orders/:order_id", get(get_order))
        .route("/orders/:order_id/tickets", get(get_order_tickets))
        .route("/orders/:order_id/cancel", post(cancel_order))
        .route("/orders/:order_id/refund", post(refund_order))
        .route("/waitlist", post(join_waitlist))
        .route("/waitlist/:entry_id", get(get_waitlist_entry))
        .route("/waitlist/:entry_id/cancel", post(leave_waitlist))
        .route("/webhooks/:provider", post(handle_webhook))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
        .layer(middleware::from_fn_with_state(metrics, error_metrics_mw))
        .layer(cors)
}
