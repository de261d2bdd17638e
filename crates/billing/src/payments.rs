//! Payment processing against the gateway port

use std::sync::Arc;

use time::OffsetDateTime;

use gymflow_shared::UserId;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeOutcome, ChargeRequest, GatewayError, GatewayPayment, PaymentGateway};
use crate::models::{BillingUser, Invoice, PaymentMethod};
use crate::store::BillingStore;

/// Submits invoice charges and vaults member cards
#[derive(Clone)]
pub struct PaymentProcessor {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn BillingStore>,
}

impl PaymentProcessor {
    pub fn new(gateway: Arc<dyn PaymentGateway>, store: Arc<dyn BillingStore>) -> Self {
        Self { gateway, store }
    }

    /// Charge the invoice's amount to the member's vaulted card.
    ///
    /// Never fails: every gateway problem is classified into a [`ChargeOutcome`].
    /// The request carries the invoice's own idempotency key and identity, so
    /// submitting the same invoice again cannot produce a second charge.
    pub async fn process_payment(
        &self,
        invoice: &Invoice,
        card: &PaymentMethod,
        payer: &BillingUser,
    ) -> ChargeOutcome {
        let request = ChargeRequest {
            invoice_id: invoice.id,
            idempotency_key: invoice.idempotency_key.clone(),
            amount_cents: invoice.amount_cents,
            currency: invoice.currency.clone(),
            customer_id: card.gateway_customer_id.clone(),
            card_ref: card.vaulted_card_ref.clone(),
            description: format!("Membership invoice {} for {}", invoice.id, payer.email),
        };

        let outcome = ChargeOutcome::classify(self.gateway.submit_charge(&request).await);

        match &outcome {
            ChargeOutcome::Approved { external_id } => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    user_id = %payer.id,
                    payment_id = %external_id,
                    amount_cents = invoice.amount_cents,
                    "Charge approved"
                );
            }
            ChargeOutcome::Pending { external_id } => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    user_id = %payer.id,
                    payment_id = %external_id,
                    "Charge pending at gateway"
                );
            }
            ChargeOutcome::SoftDeclined { reason } | ChargeOutcome::TransportError { reason } => {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    user_id = %payer.id,
                    reason = %reason,
                    "Charge failed, retryable"
                );
            }
            ChargeOutcome::FatalDeclined { reason } => {
                tracing::error!(
                    invoice_id = %invoice.id,
                    user_id = %payer.id,
                    reason = %reason,
                    "Charge declined permanently"
                );
            }
        }

        outcome
    }

    /// Current gateway view of an earlier submission
    pub async fn fetch_payment(&self, external_id: &str) -> Result<GatewayPayment, GatewayError> {
        self.gateway.fetch_payment(external_id).await
    }

    /// Exchange a tokenized card for a vaulted, reusable one bound to the
    /// member's gateway customer. The new card replaces any previous one.
    pub async fn ensure_reusable_card(
        &self,
        user_id: UserId,
        card_token: &str,
        now: OffsetDateTime,
    ) -> BillingResult<PaymentMethod> {
        if card_token.trim().is_empty() {
            return Err(BillingError::Validation("card token is required".to_string()));
        }

        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;
        let existing = self.store.get_payment_method(user_id).await?;

        let vaulted = self
            .gateway
            .vault_card(&user, existing.as_ref(), card_token)
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        let method = PaymentMethod {
            user_id,
            gateway_customer_id: vaulted.customer_id,
            vaulted_card_ref: vaulted.card_ref,
            updated_at: now,
        };
        self.store.upsert_payment_method(&method).await?;

        tracing::info!(
            user_id = %user_id,
            replaced = existing.is_some(),
            "Payment method registered"
        );

        Ok(method)
    }
}
