use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::orders::{Order, OrderItem};

pub mod stripe;
pub mod stub;

pub use stripe::StripeProvider;
pub use stub::StubProvider;

/// Provider payloads normalized into the one shape the order state machine
/// understands. Everything provider-specific stays behind `PaymentProvider`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    CheckoutExpired,
    PaymentRefunded,
    /// Forward compatibility: acknowledged and ignored.
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub session_id: Option<String>,
    pub payment_reference: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CheckoutLineItem {
    pub name: String,
    pub unit_price_minor: i64,
    pub quantity: i32,
}

#[derive(Debug)]
pub struct CheckoutRequest<'a> {
    pub order: &'a Order,
    pub line_items: Vec<CheckoutLineItem>,
    pub success_url: String,
    pub cancel_url: String,
}

impl<'a> CheckoutRequest<'a> {
    pub fn from_order(
        order: &'a Order,
        items: &[OrderItem],
        names: &HashMap<uuid::Uuid, String>,
        success_url: String,
        cancel_url: String,
    ) -> Self {
        let line_items = items
            .iter()
            .map(|item| CheckoutLineItem {
                name: names
                    .get(&item.ticket_type_id)
                    .cloned()
                    .unwrap_or_else(|| "Ticket".to_string()),
                unit_price_minor: item.unit_price_minor,
                quantity: item.quantity,
            })
            .collect();
        Self { order, line_items, success_url, cancel_url }
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub session_id: String,
    pub redirect_url: String,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing or invalid webhook signature")]
    Signature,
    #[error("malformed webhook payload: {0}")]
    Payload(String),
    #[error("checkout creation failed: {0}")]
    Checkout(String),
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Verify the delivery signature and normalize the payload. Must reject
    /// before parsing; a rejected delivery leaves no trace in the
    /// idempotency state.
    fn verify_and_parse(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<ProviderEvent, ProviderError>;

    /// Create a hosted checkout for a pending order; the returned session id
    /// is stored on the order to correlate later webhook deliveries.
    async fn create_checkout(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutSession, ProviderError>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.providers.insert(provider.name(), provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PaymentProvider>> {
        self.providers.get(name).cloned()
    }
}
