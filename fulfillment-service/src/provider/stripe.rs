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

const DEFAULT_MAX_SKEW_SECS: i64 = 300;
const API_BASE: &str = "https://api.stripe.com/v1";

pub struct StripeProvider {
    client: reqwest::Client,
    secret_key: String,
    webhook_secret: String,
    max_skew_secs: i64,
}

impl StripeProvider {
    pub fn new(secret_key: String, webhook_secret: String, max_skew_secs: Option<i64>) -> Self {
        Self {
            client: reqwest::Client::new(),
            secret_key,
            webhook_secret,
            max_skew_secs: max_skew_secs.unwrap_or(DEFAULT_MAX_SKEW_SECS),
        }
    }

    pub fn from_env() -> Self {
        let max_skew = std::env::var("WEBHOOK_MAX_SKEW_SECS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok());
        Self::new(
            std::env::var("STRIPE_SECRET_KEY").unwrap_or_default(),
            std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default(),
            max_skew,
        )
    }

    /// Stripe signs `"{t}.{body}"` with the endpoint secret; the header
    /// carries `t=<unix>,v1=<hex hmac>[,v1=...]`.
    fn check_signature(
        &self,
        header: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), ProviderError> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(ProviderError::Signature)?;
        if (now.timestamp() - timestamp).abs() > self.max_skew_secs {
            return Err(ProviderError::Signature);
        }

        let mut mac = Hmac::<Sha256>::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| ProviderError::Signature)?;
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());

        let matched = candidates.iter().any(|candidate| {
            ConstantTimeEq::ct_eq(expected.as_bytes(), candidate.as_bytes()).unwrap_u8() == 1
        });
        if matched {
            Ok(())
        } else {
            Err(ProviderError::Signature)
        }
    }
}

#[derive(Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Deserialize)]
struct StripeEventData {
    object: serde_json::Value,
}

#[derive(Deserialize)]
struct StripeCheckoutSession {
    id: String,
    url: Option<String>,
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn verify_and_parse(
        &self,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<ProviderEvent, ProviderError> {
        let signature = headers
            .get("stripe-signature")
            .and_then(|v| v.to_str().ok())
            .ok_or(ProviderError::Signature)?;
        self.check_signature(signature, body, now)?;

        let event: StripeEvent = serde_json::from_slice(body)
            .map_err(|err| ProviderError::Payload(err.to_string()))?;

        let kind = match event.event_type.as_str() {
            "checkout.session.completed" => EventKind::CheckoutCompleted,
            "checkout.session.expired" => EventKind::CheckoutExpired,
            "charge.refunded" | "refund.created" => EventKind::PaymentRefunded,
            other => EventKind::Other(other.to_string()),
        };
        let object = &event.data.object;
        let session_id = object
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let payment_reference = object
            .get("payment_intent")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let metadata = object.get("metadata").cloned().unwrap_or(serde_json::Value::Null);

        Ok(ProviderEvent {
            event_id: event.id,
            kind,
            session_id,
            payment_reference,
            metadata,
        })
    }

    async fn create_checkout(
        &self,
        request: &CheckoutRequest<'_>,
    ) -> Result<CheckoutSession, ProviderError> {
        if self.secret_key.is_empty() {
            return Err(ProviderError::Checkout("stripe is not configured".into()));
        }

        let order = request.order;
        let mut params: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            ("success_url".into(), request.success_url.clone()),
            ("cancel_url".into(), request.cancel_url.clone()),
            ("customer_email".into(), order.buyer_email.clone()),
            ("metadata[order_id]".into(), order.id.to_string()),
        ];
        for (idx, line) in request.line_items.iter().enumerate() {
            let currency = order.currency.to_lowercase();
            params.push((
                format!("line_items[{idx}][price_data][currency]"),
                currency,
            ));
            params.push((
                format!("line_items[{idx}][price_data][unit_amount]"),
                line.unit_price_minor.to_string(),
            ));
            params.push((
                format!("line_items[{idx}][price_data][product_data][name]"),
                line.name.clone(),
            ));
            params.push((format!("line_items[{idx}][quantity]"), line.quantity.to_string()));
        }

        let response = self
            .client
            .post(format!("{API_BASE}/checkout/sessions"))
            .bearer_auth(&self.secret_key)
            .form(&params)
            .send()
            .await
            .map_err(|err| ProviderError::Checkout(err.to_string()))?;

        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_else(|_| "unknown error".into());
            return Err(ProviderError::Checkout(detail));
        }
        let session: StripeCheckoutSession = response
            .json()
            .await
            .map_err(|err| ProviderError::Checkout(err.to_string()))?;
        let redirect_url = session
            .url
            .ok_or_else(|| ProviderError::Checkout("session has no redirect url".into()))?;
        Ok(CheckoutSession { session_id: session.id, redirect_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> StripeProvider {
        StripeProvider::new("sk_test_xxx".into(), "whsec_test123secret456".into(), None)
    }

    fn sign(secret: &str, timestamp: i64, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    fn headers_with(signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("stripe-signature", signature.parse().unwrap());
        headers
    }

    #[test]
    fn valid_signature_parses_completed_event() {
        let body = br#"{"id":"evt_1","type":"checkout.session.completed","data":{"object":{"id":"cs_123","payment_intent":"pi_9","metadata":{"order_id":"x"}}}}"#;
        let now = Utc::now();
        let sig = sign("whsec_test123secret456", now.timestamp(), body);
        let headers = headers_with(&format!("t={},v1={}", now.timestamp(), sig));
        let event = provider().verify_and_parse(&headers, body, now).unwrap();
        assert_eq!(event.event_id, "evt_1");
        assert_eq!(event.kind, EventKind::CheckoutCompleted);
        assert_eq!(event.session_id.as_deref(), Some("cs_123"));
        assert_eq!(event.payment_reference.as_deref(), Some("pi_9"));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = br#"{"id":"evt_1","type":"checkout.session.completed","data":{"object":{}}}"#;
        let now = Utc::now();
        let sig = sign("wrong_secret", now.timestamp(), body);
        let headers = headers_with(&format!("t={},v1={}", now.timestamp(), sig));
        let err = provider().verify_and_parse(&headers, body, now).unwrap_err();
        assert!(matches!(err, ProviderError::Signature));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let body = br#"{"id":"evt_1","type":"checkout.session.expired","data":{"object":{}}}"#;
        let now = Utc::now();
        let stale = now.timestamp() - 600;
        let sig = sign("whsec_test123secret456", stale, body);
        let headers = headers_with(&format!("t={stale},v1={sig}"));
        let err = provider().verify_and_parse(&headers, body, now).unwrap_err();
        assert!(matches!(err, ProviderError::Signature));
    }

    #[test]
    fn unknown_event_type_maps_to_other() {
        let body = br#"{"id":"evt_2","type":"invoice.finalized","data":{"object":{"id":"in_1"}}}"#;
        let now = Utc::now();
        let sig = sign("whsec_test123secret456", now.timestamp(), body);
        let headers = headers_with(&format!("t={},v1={}", now.timestamp(), sig));
        let event = provider().verify_and_parse(&headers, body, now).unwrap();
        assert_eq!(event.kind, EventKind::Other("invoice.finalized".into()));
    }

    #[test]
    fn missing_header_is_rejected_before_parsing() {
        let body = b"not even json";
        let err = provider()
            .verify_and_parse(&HeaderMap::new(), body, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ProviderError::Signature));
    }
}
