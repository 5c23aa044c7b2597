use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::{
    CheckoutRequest, CheckoutSession, EventKind, PaymentProvider, ProviderError, ProviderEvent,
};

/// Deterministic local provider for development and tests: signs the raw
/// body with a shared secret, no hosted page behind the redirect URL.
pub struct StubProvider {
    secret: String,
    checkout_base: String,
}

impl StubProvider {
    pub fn new(secret: String, checkout_base: String) -> Self {
        Self { secret, checkout_base }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("STUB_WEBHOOK_SECRET").unwrap_or_default(),
            std::env::var("STUB_CHECKOUT_BASE")
                .unwrap_or_else(|_| "https://checkout.invalid".to_string()),
        )
    }

    pub fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

#[derive(Deserialize)]
struct StubEvent {
    event_id: String,
    #[serde(rename = "type")]
    event_type: String,
    session_id: Option<String>,
    payment_reference: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[async_trait]
impl PaymentProvider for StubProvider {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn verify_and_parse(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        _now: DateTime<Utc>,
    ) -> Result<ProviderEvent, ProviderError> {
        let provided = headers
            .get("x-stub-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(ProviderError::Signature)?;
        let expected = Self::sign(&self.secret, body);
        if ConstantTimeEq::ct_eq(expected.as_bytes(), provided.as_bytes()).unwrap_u8() != 1 {
            return Err(ProviderError::Signature);
        }

        let event: StubEvent =
            serde_json::from_slice(body).map_err(|err| ProviderError::Payload(err.to_string()))?;
        let kind = match event.event_type.as_str() {
            "checkout.completed" => EventKind::CheckoutCompleted,
            "checkout.expired" => EventKind::CheckoutExpired,
            "payment.refunded" => EventKind::PaymentRefunded,
            other => EventKind::Other(other.to_string()),
        };
        Ok(ProviderEvent {
            event_id: event.event_id,
            kind,
            session_id: event.session_id,
            payment_reference: event.payment_reference,
            metadata: event.metadata,
        })
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutSession, ProviderError> {
        let session_id = format!("stub_{}", request.order.id.simple());
        let redirect_url = format!("{}/pay/{}", self.checkout_base, session_id);
        Ok(CheckoutSession { session_id, redirect_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_body_round_trips() {
        let provider = StubProvider::new("s3cr3t".into(), "https://checkout.invalid".into());
        let body =
            br#"{"event_id":"se_1","type":"checkout.completed","session_id":"stub_abc"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-stub-signature",
            StubProvider::sign("s3cr3t", body).parse().unwrap(),
        );
        let event = provider.verify_and_parse(&headers, body, Utc::now()).unwrap();
        assert_eq!(event.kind, EventKind::CheckoutCompleted);
        assert_eq!(event.session_id.as_deref(), Some("stub_abc"));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let provider = StubProvider::new("s3cr3t".into(), "https://checkout.invalid".into());
        let body = br#"{"event_id":"se_1","type":"checkout.completed"}"#;
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-stub-signature",
            StubProvider::sign("s3cr3t", b"other body").parse().unwrap(),
        );
        let err = provider
            .verify_and_parse(&headers, body, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ProviderError::Signature));
    }
}
