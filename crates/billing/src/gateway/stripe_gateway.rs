//! Stripe binding of the payment gateway port
//!
//! Charges are PaymentIntents created and confirmed in one call against the
//! member's attached card, sent with the invoice's idempotency key so a retry of
//! the same billing event can never charge twice.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use stripe::{
    AttachPaymentMethod, CreateCustomer, CreatePaymentIntent, Currency, Customer, CustomerId,
    ErrorType, PaymentIntent, PaymentIntentId, PaymentIntentStatus, PaymentMethodId,
    RequestStrategy, StripeError,
};

use super::{ChargeRequest, GatewayError, GatewayPayment, GatewayStatus, PaymentGateway, VaultedCard};
use crate::client::StripeClient;
use crate::models::{BillingUser, PaymentMethod};

const MAX_RETRIES: usize = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Metadata key carrying our invoice id on every PaymentIntent
const INVOICE_REFERENCE_KEY: &str = "invoice_id";

/// Stripe payment gateway
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    async fn retrieve_intent(&self, id: &PaymentIntentId) -> Result<PaymentIntent, GatewayError> {
        PaymentIntent::retrieve(self.stripe.inner(), id, &[])
            .await
            .map_err(map_stripe_error)
    }

    async fn get_or_create_customer(
        &self,
        user: &BillingUser,
        existing: Option<&PaymentMethod>,
    ) -> Result<CustomerId, GatewayError> {
        if let Some(method) = existing {
            return method
                .gateway_customer_id
                .parse::<CustomerId>()
                .map_err(|e| GatewayError::InvalidRequest(format!("Invalid customer ID: {}", e)));
        }

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user.id.to_string());
        metadata.insert("platform".to_string(), "gymflow".to_string());

        let params = CreateCustomer {
            email: Some(user.email.as_str()),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params)
            .await
            .map_err(map_stripe_error)?;

        tracing::info!(
            user_id = %user.id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(customer.id)
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn submit_charge(&self, request: &ChargeRequest) -> Result<GatewayPayment, GatewayError> {
        let currency = parse_currency(&request.currency)?;
        let customer = request
            .customer_id
            .parse::<CustomerId>()
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid customer ID: {}", e)))?;
        let card = request
            .card_ref
            .parse::<PaymentMethodId>()
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid payment method: {}", e)))?;

        let mut metadata = HashMap::new();
        metadata.insert(
            INVOICE_REFERENCE_KEY.to_string(),
            request.invoice_id.to_string(),
        );

        let mut params = CreatePaymentIntent::new(request.amount_cents, currency);
        params.customer = Some(customer);
        params.payment_method = Some(card);
        params.payment_method_types = Some(vec!["card".to_string()]);
        params.confirm = Some(true);
        params.description = Some(request.description.as_str());
        params.metadata = Some(metadata);

        let client = self
            .stripe
            .inner()
            .clone()
            .with_strategy(idempotency_strategy(request));

        let intent = PaymentIntent::create(&client, params)
            .await
            .map_err(map_stripe_error)?;

        tracing::debug!(
            invoice_id = %request.invoice_id,
            payment_intent = %intent.id,
            status = ?intent.status,
            "Submitted Stripe charge"
        );

        to_gateway_payment(&intent)
    }

    async fn fetch_payment(&self, external_id: &str) -> Result<GatewayPayment, GatewayError> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let id = external_id
            .parse::<PaymentIntentId>()
            .map_err(|e| GatewayError::NotFound(format!("{}: {}", external_id, e)))?;

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY.as_millis() as u64)
            .max_delay(RETRY_MAX_DELAY)
            .take(MAX_RETRIES)
            .map(jitter);

        // Reads are safe to repeat; only transport failures are retried
        let result = Retry::spawn(retry_strategy, || async {
            let result = self.retrieve_intent(&id).await;
            match &result {
                Err(GatewayError::Transport(e)) => {
                    tracing::debug!(payment_id = %external_id, error = %e, "Transient error - will retry");
                    Err(result)
                }
                _ => Ok(result),
            }
        })
        .await
        .unwrap_or_else(|e| e)?;

        to_gateway_payment(&result)
    }

    async fn vault_card(
        &self,
        user: &BillingUser,
        existing: Option<&PaymentMethod>,
        card_token: &str,
    ) -> Result<VaultedCard, GatewayError> {
        let customer = self.get_or_create_customer(user, existing).await?;
        let card = card_token
            .parse::<PaymentMethodId>()
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid payment method: {}", e)))?;

        stripe::PaymentMethod::attach(
            self.stripe.inner(),
            &card,
            AttachPaymentMethod {
                customer: customer.clone(),
            },
        )
        .await
        .map_err(map_stripe_error)?;

        // One card per member: the previous one is detached once the new one is in place
        if let Some(previous) = existing.filter(|m| m.vaulted_card_ref != card_token) {
            match previous.vaulted_card_ref.parse::<PaymentMethodId>() {
                Ok(old) => {
                    if let Err(e) = stripe::PaymentMethod::detach(self.stripe.inner(), &old).await {
                        tracing::warn!(
                            user_id = %user.id,
                            payment_method = %old,
                            error = %e,
                            "Failed to detach previous card"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(user_id = %user.id, error = %e, "Stored card reference is invalid");
                }
            }
        }

        tracing::info!(
            user_id = %user.id,
            customer_id = %customer,
            "Vaulted card at Stripe"
        );

        Ok(VaultedCard {
            customer_id: customer.to_string(),
            card_ref: card.to_string(),
        })
    }
}

/// The invoice's key, verbatim. Stripe answers a reused key carrying different
/// parameters (a newly vaulted card) with an invalid request, which the retry
/// sweep treats as a soft decline until the key has aged out.
fn idempotency_strategy(request: &ChargeRequest) -> RequestStrategy {
    RequestStrategy::Idempotent(request.idempotency_key.clone())
}

fn parse_currency(code: &str) -> Result<Currency, GatewayError> {
    serde_json::from_value(Value::String(code.to_lowercase()))
        .map_err(|_| GatewayError::InvalidRequest(format!("Unsupported currency: {}", code)))
}

fn to_gateway_payment(intent: &PaymentIntent) -> Result<GatewayPayment, GatewayError> {
    let raw = serde_json::to_value(intent)
        .map_err(|e| GatewayError::InvalidRequest(format!("Unreadable payment intent: {}", e)))?;

    let status = match intent.status {
        PaymentIntentStatus::Succeeded => GatewayStatus::Approved,
        PaymentIntentStatus::Processing
        | PaymentIntentStatus::RequiresAction
        | PaymentIntentStatus::RequiresCapture
        | PaymentIntentStatus::RequiresConfirmation => GatewayStatus::Pending,
        PaymentIntentStatus::RequiresPaymentMethod | PaymentIntentStatus::Canceled => {
            GatewayStatus::Rejected
        }
    };

    Ok(GatewayPayment {
        external_id: intent.id.to_string(),
        status,
        status_detail: decline_reason(&raw),
        external_reference: raw
            .pointer(&format!("/metadata/{}", INVOICE_REFERENCE_KEY))
            .and_then(Value::as_str)
            .map(str::to_string),
        amount_cents: intent.amount,
    })
}

/// `decline_code` is the issuer / risk reason; `code` is the fallback
fn decline_reason(raw: &Value) -> Option<String> {
    let error = raw.get("last_payment_error")?;
    error
        .get("decline_code")
        .and_then(Value::as_str)
        .or_else(|| error.get("code").and_then(Value::as_str))
        .map(str::to_string)
}

fn map_stripe_error(err: StripeError) -> GatewayError {
    match err {
        StripeError::Stripe(req) => {
            if req.http_status >= 500 || req.http_status == 429 {
                GatewayError::Transport(format!(
                    "Stripe returned {}: {}",
                    req.http_status,
                    req.message.unwrap_or_default()
                ))
            } else if req.http_status == 404 {
                GatewayError::NotFound(req.message.unwrap_or_default())
            } else if matches!(req.error_type, ErrorType::Card) || req.decline_code.is_some() {
                let code = req
                    .code
                    .as_ref()
                    .and_then(|c| serde_json::to_value(c).ok())
                    .and_then(|v| v.as_str().map(str::to_string));
                GatewayError::Declined {
                    reason: req
                        .decline_code
                        .or(code)
                        .unwrap_or_else(|| "card_declined".to_string()),
                }
            } else {
                GatewayError::InvalidRequest(req.message.unwrap_or_default())
            }
        }
        // Timeouts and client-side connection failures
        other => GatewayError::Transport(other.to_string()),
    }
}
