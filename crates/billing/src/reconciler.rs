//! Webhook reconciliation
//!
//! A notification only tells us *which* payment changed. The authoritative
//! status is always fetched from the gateway, and the local transition goes
//! through the same conditional settlement the billing cycle uses, so a
//! redelivered webhook or a race with a synchronous attempt is a no-op.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use gymflow_shared::InvoiceId;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeOutcome, GatewayPayment, GatewayStatus, PaymentGateway};
use crate::models::{Invoice, InvoiceStatus};
use crate::state_machine::PaymentTransition;
use crate::store::{self, ApprovedSettlement, BillingStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// This notification moved the invoice to PAID
    Settled {
        invoice_id: InvoiceId,
        transition: Option<PaymentTransition>,
    },
    /// Already PAID by an earlier delivery or by the billing cycle
    AlreadySettled,
    StillPending,
    /// The decline was applied to the invoice's subscription
    Declined { reason: String, fatal: bool },
    /// Decline for an attempt that is no longer the invoice's latest, or for a closed invoice
    Ignored,
    /// No local invoice references this payment
    Unmatched,
    /// Approved payment for an invoice that is VOIDED or EXPIRED
    NeedsReview { invoice_id: InvoiceId },
}

#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl WebhookReconciler {
    pub fn new(store: Arc<dyn BillingStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { store, gateway }
    }

    /// Converge local state with the gateway's view of one payment.
    ///
    /// Errors (gateway unreachable, database down) propagate so the caller can
    /// leave the notification queued for another attempt.
    pub async fn sync_payment_status(
        &self,
        external_payment_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        let payment = self
            .gateway
            .fetch_payment(external_payment_id)
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;

        let Some(invoice) = self.resolve_invoice(&payment).await? else {
            tracing::warn!(
                payment_id = %payment.external_id,
                reference = ?payment.external_reference,
                "Payment does not match any invoice"
            );
            return Ok(ReconcileOutcome::Unmatched);
        };

        match payment.status {
            GatewayStatus::Approved => self.settle(&invoice, &payment, now).await,
            GatewayStatus::Pending => {
                tracing::debug!(
                    invoice_id = %invoice.id,
                    payment_id = %payment.external_id,
                    "Payment still pending at gateway"
                );
                Ok(ReconcileOutcome::StillPending)
            }
            GatewayStatus::Rejected => self.decline(&invoice, &payment, now).await,
        }
    }

    /// By the external reference set at charge time, falling back to the
    /// recorded gateway payment id
    async fn resolve_invoice(&self, payment: &GatewayPayment) -> BillingResult<Option<Invoice>> {
        if let Some(invoice_id) = payment
            .external_reference
            .as_deref()
            .and_then(|r| InvoiceId::from_str(r).ok())
        {
            if let Some(invoice) = self.store.get_invoice(invoice_id).await? {
                return Ok(Some(invoice));
            }
        }
        self.store
            .find_invoice_by_gateway_payment(&payment.external_id)
            .await
    }

    async fn settle(
        &self,
        invoice: &Invoice,
        payment: &GatewayPayment,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        match invoice.status {
            InvoiceStatus::Paid => return Ok(ReconcileOutcome::AlreadySettled),
            InvoiceStatus::Voided | InvoiceStatus::Expired => {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    user_id = %invoice.user_id,
                    payment_id = %payment.external_id,
                    invoice_status = %invoice.status,
                    "Approved payment for a closed invoice, manual review required"
                );
                return Ok(ReconcileOutcome::NeedsReview {
                    invoice_id: invoice.id,
                });
            }
            InvoiceStatus::Pending => {}
        }

        match store::settle_approved(self.store.as_ref(), invoice.id, &payment.external_id, now)
            .await?
        {
            ApprovedSettlement::Settled(settlement) => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    user_id = %invoice.user_id,
                    payment_id = %payment.external_id,
                    transition = ?settlement.transition,
                    "Settled invoice from webhook"
                );
                Ok(ReconcileOutcome::Settled {
                    invoice_id: invoice.id,
                    transition: settlement.transition,
                })
            }
            ApprovedSettlement::AlreadyPaid => Ok(ReconcileOutcome::AlreadySettled),
            ApprovedSettlement::Closed { .. } => Ok(ReconcileOutcome::NeedsReview {
                invoice_id: invoice.id,
            }),
        }
    }

    async fn decline(
        &self,
        invoice: &Invoice,
        payment: &GatewayPayment,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        // Only the latest attempt on a still-open invoice may drive a failure
        let is_latest = invoice.gateway_payment_id.as_deref() == Some(payment.external_id.as_str());
        if invoice.status != InvoiceStatus::Pending || !is_latest {
            return Ok(ReconcileOutcome::Ignored);
        }

        let (reason, fatal) = match ChargeOutcome::from_payment(payment) {
            ChargeOutcome::FatalDeclined { reason } => (reason, true),
            ChargeOutcome::SoftDeclined { reason } | ChargeOutcome::TransportError { reason } => {
                (reason, false)
            }
            _ => return Ok(ReconcileOutcome::Ignored),
        };

        if self
            .store
            .record_payment_failure(invoice.id, &reason, fatal, now)
            .await?
            .is_none()
        {
            return Ok(ReconcileOutcome::Ignored);
        }

        tracing::warn!(
            invoice_id = %invoice.id,
            user_id = %invoice.user_id,
            payment_id = %payment.external_id,
            reason = %reason,
            fatal = fatal,
            "Payment declined after submission"
        );
        Ok(ReconcileOutcome::Declined { reason, fatal })
    }
}
