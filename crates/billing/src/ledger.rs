//! Invoice ledger
//!
//! One invoice per billing event. Retries go through the same invoice row and
//! therefore the same idempotency key; a new invoice is only raised for a new
//! billing event (renewal, debt recovery) or a counter payment.
//!
//! An invoice that already carries a gateway payment is looked up before
//! anything is resubmitted: a payment still processing or already approved is
//! followed, never charged again.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use gymflow_shared::{InvoiceId, PlanId, UserId};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{ChargeOutcome, GatewayError, GatewayStatus};
use crate::models::{Invoice, InvoiceStatus, Subscription};
use crate::payments::PaymentProcessor;
use crate::store::{self, ApprovedSettlement, BillingStore, Settlement};

/// Result of one charge attempt on an invoice
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptResult {
    /// This attempt moved the invoice to PAID
    Paid(Settlement),
    /// The invoice was no longer PENDING; another trigger settled or closed it
    AlreadySettled,
    /// Approved at the gateway after the invoice was voided or expired
    NeedsReview {
        invoice_id: InvoiceId,
        external_id: String,
    },
    /// Accepted by the gateway, final status arrives by webhook
    Pending,
    SoftDeclined { reason: String },
    FatalDeclined { reason: String },
    /// No vaulted card on file; nothing was submitted
    SkippedNoCard,
}

/// What a declined charge does to the invoice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnDecline {
    /// Keep the invoice open for the retry schedule
    Retry,
    /// Void the invoice and cancel the subscription it would have started
    VoidCheckout,
}

#[derive(Clone)]
pub struct InvoiceLedger {
    store: Arc<dyn BillingStore>,
    payments: PaymentProcessor,
}

impl InvoiceLedger {
    pub fn new(store: Arc<dyn BillingStore>, payments: PaymentProcessor) -> Self {
        Self { store, payments }
    }

    /// Raise the PENDING invoice for the subscription's next billing event,
    /// priced from its current plan
    pub async fn raise_subscription_invoice(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<Invoice> {
        let plan = self
            .store
            .get_plan(subscription.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", subscription.plan_id)))?;

        let invoice = Invoice::for_subscription(subscription, &plan, now);
        self.store.insert_invoice(&invoice).await?;

        tracing::info!(
            invoice_id = %invoice.id,
            subscription_id = %subscription.id,
            user_id = %subscription.user_id,
            amount_cents = invoice.amount_cents,
            "Raised subscription invoice"
        );

        Ok(invoice)
    }

    /// Charge a PENDING invoice once and apply the resulting transition
    pub async fn attempt_charge(
        &self,
        invoice_id: InvoiceId,
        now: OffsetDateTime,
    ) -> BillingResult<AttemptResult> {
        self.charge(invoice_id, OnDecline::Retry, now).await
    }

    /// First charge of a new subscription. A decline voids the invoice and
    /// cancels the subscription instead of starting the retry schedule.
    pub async fn attempt_checkout_charge(
        &self,
        invoice_id: InvoiceId,
        now: OffsetDateTime,
    ) -> BillingResult<AttemptResult> {
        self.charge(invoice_id, OnDecline::VoidCheckout, now).await
    }

    async fn charge(
        &self,
        invoice_id: InvoiceId,
        on_decline: OnDecline,
        now: OffsetDateTime,
    ) -> BillingResult<AttemptResult> {
        let invoice = self
            .store
            .get_invoice(invoice_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice_id)))?;
        if invoice.status != InvoiceStatus::Pending {
            return Ok(AttemptResult::AlreadySettled);
        }

        if let Some(result) = self.follow_submitted(&invoice, now).await? {
            return Ok(result);
        }

        let user = self
            .store
            .get_user(invoice.user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", invoice.user_id)))?;

        let Some(card) = self.store.get_payment_method(invoice.user_id).await? else {
            tracing::info!(
                invoice_id = %invoice.id,
                user_id = %invoice.user_id,
                "No payment method on file, skipping charge"
            );
            return Ok(AttemptResult::SkippedNoCard);
        };

        let outcome = self.payments.process_payment(&invoice, &card, &user).await;
        self.store
            .record_attempt(invoice.id, outcome.external_id(), now)
            .await?;

        let result = match outcome {
            ChargeOutcome::Approved { external_id } => {
                self.settle_approved(&invoice, &external_id, now).await?
            }
            ChargeOutcome::Pending { .. } => AttemptResult::Pending,
            ChargeOutcome::SoftDeclined { reason } | ChargeOutcome::TransportError { reason } => {
                self.apply_decline(&invoice, &reason, false, on_decline, now)
                    .await?;
                AttemptResult::SoftDeclined { reason }
            }
            ChargeOutcome::FatalDeclined { reason } => {
                self.apply_decline(&invoice, &reason, true, on_decline, now)
                    .await?;
                AttemptResult::FatalDeclined { reason }
            }
        };

        Ok(result)
    }

    /// Outcome of the invoice's recorded gateway payment, when that payment is
    /// still processing or already approved. `None` means a new submission is
    /// due.
    async fn follow_submitted(
        &self,
        invoice: &Invoice,
        now: OffsetDateTime,
    ) -> BillingResult<Option<AttemptResult>> {
        let Some(external_id) = invoice.gateway_payment_id.as_deref() else {
            return Ok(None);
        };

        let payment = match self.payments.fetch_payment(external_id).await {
            Ok(payment) => payment,
            Err(GatewayError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(BillingError::Gateway(e.to_string())),
        };

        match payment.status {
            GatewayStatus::Approved => Ok(Some(
                self.settle_approved(invoice, external_id, now).await?,
            )),
            GatewayStatus::Pending => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    payment_id = %external_id,
                    "Earlier charge still processing, not resubmitting"
                );
                Ok(Some(AttemptResult::Pending))
            }
            GatewayStatus::Rejected => Ok(None),
        }
    }

    async fn settle_approved(
        &self,
        invoice: &Invoice,
        external_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<AttemptResult> {
        let result =
            match store::settle_approved(self.store.as_ref(), invoice.id, external_id, now).await? {
                ApprovedSettlement::Settled(settlement) => AttemptResult::Paid(settlement),
                ApprovedSettlement::AlreadyPaid => AttemptResult::AlreadySettled,
                ApprovedSettlement::Closed { .. } => AttemptResult::NeedsReview {
                    invoice_id: invoice.id,
                    external_id: external_id.to_string(),
                },
            };
        Ok(result)
    }

    async fn apply_decline(
        &self,
        invoice: &Invoice,
        reason: &str,
        is_fatal: bool,
        on_decline: OnDecline,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        match on_decline {
            OnDecline::Retry => {
                self.store
                    .record_payment_failure(invoice.id, reason, is_fatal, now)
                    .await?;
            }
            OnDecline::VoidCheckout => {
                if let Some(sub) = self.store.void_checkout(invoice.id, reason, now).await? {
                    tracing::info!(
                        invoice_id = %invoice.id,
                        subscription_id = %sub.id,
                        user_id = %sub.user_id,
                        reason = %reason,
                        "Checkout declined, subscription not started"
                    );
                }
            }
        }
        Ok(())
    }

    /// Final retry offset reached: EXPIRED invoice, REJECTED subscription
    pub async fn expire(
        &self,
        invoice_id: InvoiceId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let sub = self.store.expire_invoice(invoice_id, now).await?;
        if let Some(sub) = &sub {
            tracing::warn!(
                invoice_id = %invoice_id,
                subscription_id = %sub.id,
                user_id = %sub.user_id,
                status = %sub.status,
                "Invoice expired after final retry"
            );
        }
        Ok(sub)
    }

    /// Record a payment taken at the front desk as a PAID one-off invoice
    pub async fn record_counter_payment(
        &self,
        user_id: UserId,
        plan_id: PlanId,
        admin_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Invoice> {
        if self.store.get_user(user_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("user {}", user_id)));
        }
        let plan = self
            .store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", plan_id)))?;
        if !plan.active {
            return Err(BillingError::Validation(format!(
                "plan {} is not available",
                plan.name
            )));
        }

        let invoice = Invoice::counter_payment(user_id, &plan, now);
        self.store.insert_counter_payment(&invoice, now).await?;

        tracing::info!(
            invoice_id = %invoice.id,
            user_id = %user_id,
            admin_id = %admin_id,
            amount_cents = invoice.amount_cents,
            "Recorded counter payment"
        );

        Ok(invoice)
    }

    /// Most recent invoices first
    pub async fn invoice_history(&self, user_id: UserId, limit: i64) -> BillingResult<Vec<Invoice>> {
        self.store.list_invoices_for_user(user_id, limit).await
    }
}
