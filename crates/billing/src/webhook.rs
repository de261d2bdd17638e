//! Inbound gateway webhooks
//!
//! Verification and enqueueing only. The body is trusted for nothing but the
//! payment id; the queued notification is reconciled later by the worker,
//! which re-fetches the payment from the gateway.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

type HmacSha256 = Hmac<Sha256>;

/// Queue type for payment status notifications
pub const PAYMENT_UPDATED: &str = "payment.updated";

/// Maximum age of a signed timestamp, in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// What the intake did with a delivery. Every variant is acknowledged to the
/// gateway; none of them is an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum WebhookAck {
    Queued { queue_id: Uuid },
    /// Signed correctly but not a payment event
    Ignored { event_type: String },
    /// Bad signature or unreadable body; nothing was queued
    Rejected { reason: String },
    /// Could not be queued; the retry sweep still covers the invoice
    Dropped { reason: String },
}

#[derive(Clone)]
pub struct WebhookIntake {
    store: Arc<dyn BillingStore>,
    secret: String,
}

impl WebhookIntake {
    pub fn new(store: Arc<dyn BillingStore>, secret: impl Into<String>) -> Self {
        Self {
            store,
            secret: secret.into(),
        }
    }

    pub async fn accept(
        &self,
        payload: &str,
        signature_header: Option<&str>,
        now: OffsetDateTime,
    ) -> WebhookAck {
        let Some(signature) = signature_header else {
            tracing::warn!("Webhook without signature header");
            return WebhookAck::Rejected {
                reason: "missing signature".to_string(),
            };
        };
        if let Err(e) = verify_signature(&self.secret, payload, signature, now) {
            tracing::warn!(error = %e, "Webhook signature rejected");
            return WebhookAck::Rejected {
                reason: e.to_string(),
            };
        }

        let event: Value = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Webhook body is not JSON");
                return WebhookAck::Rejected {
                    reason: "invalid body".to_string(),
                };
            }
        };

        let event_type = event
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let payment_id = event
            .pointer("/data/object/id")
            .and_then(Value::as_str)
            .filter(|_| event_type.starts_with("payment_intent."));

        let Some(payment_id) = payment_id else {
            tracing::debug!(event_type = %event_type, "Ignoring webhook event");
            return WebhookAck::Ignored { event_type };
        };

        let notification = json!({
            "payment_id": payment_id,
            "event_id": event.get("id").and_then(Value::as_str),
        });

        match self.store.enqueue_webhook(PAYMENT_UPDATED, &notification).await {
            Ok(queue_id) => {
                tracing::info!(
                    queue_id = %queue_id,
                    payment_id = %payment_id,
                    event_type = %event_type,
                    "Queued payment notification"
                );
                WebhookAck::Queued { queue_id }
            }
            Err(e) => {
                tracing::error!(
                    payment_id = %payment_id,
                    error = %e,
                    "Failed to queue payment notification"
                );
                WebhookAck::Dropped {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Verify a `t=<unix>,v1=<hex>` signature header over `"{t}.{payload}"`
pub fn verify_signature(
    secret: &str,
    payload: &str,
    header: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    if signatures.is_empty() {
        return Err(BillingError::WebhookSignatureInvalid);
    }
    if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(timestamp = timestamp, "Webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    for candidate in signatures {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
        mac.update(signed_payload.as_bytes());
        // Constant-time comparison
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(BillingError::WebhookSignatureInvalid)
}
