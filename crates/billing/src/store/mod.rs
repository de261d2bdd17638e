//! Storage port for billing state.
//!
//! Every multi-row transition (invoice + subscription + member status mirror)
//! is a single trait method so that each implementation can apply it as one
//! unit of work. Callers never read-modify-write subscription state themselves.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use gymflow_shared::{ChangeRequestId, InvoiceId, PlanId, SubscriptionId, UserId};

use crate::error::BillingResult;
use crate::models::{
    BillingUser, Invoice, InvoiceStatus, PaymentMethod, Plan, Subscription,
    SubscriptionChangeRequest,
};
use crate::state_machine::PaymentTransition;

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

/// Outcome of a winning PENDING → PAID transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub invoice: Invoice,
    /// Subscription after the payment transition; `None` for one-off invoices
    pub subscription: Option<Subscription>,
    pub transition: Option<PaymentTransition>,
}

/// A change request that has just been applied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedChange {
    pub request: SubscriptionChangeRequest,
    pub subscription: Subscription,
    /// True when the request created the subscription (deferred activation)
    pub created: bool,
}

/// A gateway notification waiting in the durable inbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedWebhook {
    pub id: Uuid,
    pub webhook_type: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Members, plans and vaulted cards

    async fn get_user(&self, user_id: UserId) -> BillingResult<Option<BillingUser>>;

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Option<Plan>>;

    async fn get_payment_method(&self, user_id: UserId) -> BillingResult<Option<PaymentMethod>>;

    /// Insert or replace the member's vaulted card
    async fn upsert_payment_method(&self, method: &PaymentMethod) -> BillingResult<()>;

    // Subscriptions

    async fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<Subscription>>;

    /// Most recent subscription of the member that is not CANCELLED
    async fn find_live_subscription(&self, user_id: UserId) -> BillingResult<Option<Subscription>>;

    /// ACTIVE and PENDING_CANCELLATION subscriptions with `end_date <= today`
    async fn list_subscriptions_due(&self, today: Date) -> BillingResult<Vec<Subscription>>;

    /// Checkout: insert the subscription, its first invoice and the member's
    /// status mirror as one unit. Conflict if the member already has a live
    /// subscription.
    async fn create_subscription_with_invoice(
        &self,
        subscription: &Subscription,
        invoice: &Invoice,
    ) -> BillingResult<()>;

    /// Apply `cancel_subscription` and void the subscription's open invoice in
    /// the same unit, whichever status it was cancelled from.
    async fn cancel_subscription(
        &self,
        subscription_id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription>;

    /// Close a subscription whose final period has ended. `None` when it was
    /// not lapsing (anymore).
    async fn close_lapsed_subscription(
        &self,
        subscription_id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>>;

    // Invoices

    async fn get_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Option<Invoice>>;

    async fn find_invoice_by_gateway_payment(
        &self,
        gateway_payment_id: &str,
    ) -> BillingResult<Option<Invoice>>;

    async fn find_pending_invoice(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<Invoice>>;

    /// Insert a new invoice. Conflict when the subscription already has a
    /// PENDING invoice or the idempotency key is taken.
    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()>;

    /// Every PENDING invoice bound to a subscription, oldest first
    async fn list_pending_subscription_invoices(&self) -> BillingResult<Vec<Invoice>>;

    async fn list_invoices_for_user(&self, user_id: UserId, limit: i64)
        -> BillingResult<Vec<Invoice>>;

    /// Record a counter payment. Conflict when the member has a subscription
    /// granting access, or when the previous one-off payment still covers
    /// `now`.
    async fn insert_counter_payment(
        &self,
        invoice: &Invoice,
        now: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Note a gateway submission against the invoice
    async fn record_attempt(
        &self,
        invoice_id: InvoiceId,
        gateway_payment_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Conditional PENDING → PAID plus the matching subscription transition and
    /// status mirror, as one unit. `None` when the invoice was no longer
    /// PENDING: another trigger won the race and nothing was changed.
    async fn settle_invoice(
        &self,
        invoice_id: InvoiceId,
        gateway_payment_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Settlement>>;

    /// Declined attempt on a still-PENDING invoice: `handle_payment_failure`
    /// on the subscription and mirror. A fatal decline also voids the invoice.
    /// `None` when the invoice was no longer PENDING.
    async fn record_payment_failure(
        &self,
        invoice_id: InvoiceId,
        reason: &str,
        is_fatal: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>>;

    /// Declined first charge of a checkout: conditional PENDING → VOIDED plus
    /// `abandon_checkout` on the new subscription, as one unit. `None` when the
    /// invoice was no longer PENDING.
    async fn void_checkout(
        &self,
        invoice_id: InvoiceId,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>>;

    /// Conditional PENDING → EXPIRED plus `handle_final_failure`. `None` when
    /// the invoice was no longer PENDING.
    async fn expire_invoice(
        &self,
        invoice_id: InvoiceId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>>;

    // Change requests

    async fn get_pending_change_request(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<SubscriptionChangeRequest>>;

    /// Conflict when the member already has a PENDING request
    async fn insert_change_request(&self, request: &SubscriptionChangeRequest)
        -> BillingResult<()>;

    /// PENDING requests with `effective_at <= today`, oldest first
    async fn list_due_change_requests(
        &self,
        today: Date,
    ) -> BillingResult<Vec<SubscriptionChangeRequest>>;

    /// Apply one PENDING request and mark it APPLIED, as one unit. `None` when
    /// it was already applied.
    async fn apply_change_request(
        &self,
        request_id: ChangeRequestId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<AppliedChange>>;

    // Webhook inbox

    async fn enqueue_webhook(
        &self,
        webhook_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<Uuid>;

    /// Claim up to `limit` pending (or retryable failed) notifications and mark
    /// them processing
    async fn claim_webhooks(&self, limit: i64) -> BillingResult<Vec<QueuedWebhook>>;

    async fn complete_webhook(&self, id: Uuid) -> BillingResult<()>;

    async fn fail_webhook(&self, id: Uuid, error: &str) -> BillingResult<()>;

    /// Delete finished notifications older than `retention_days`
    async fn prune_webhooks(&self, retention_days: i32) -> BillingResult<u64>;
}

/// What an approved payment did to its invoice
#[derive(Debug, Clone)]
pub enum ApprovedSettlement {
    /// This call moved the invoice to PAID
    Settled(Settlement),
    /// Another trigger had already settled it
    AlreadyPaid,
    /// The invoice was voided or expired before the money arrived
    Closed { status: Option<InvoiceStatus> },
}

/// Settle an invoice for an approved gateway payment. When the conditional
/// settlement loses, the invoice is read back: only PAID counts as settled.
pub async fn settle_approved(
    store: &dyn BillingStore,
    invoice_id: InvoiceId,
    gateway_payment_id: &str,
    now: OffsetDateTime,
) -> BillingResult<ApprovedSettlement> {
    if let Some(settlement) = store
        .settle_invoice(invoice_id, Some(gateway_payment_id), now)
        .await?
    {
        return Ok(ApprovedSettlement::Settled(settlement));
    }

    let status = store.get_invoice(invoice_id).await?.map(|i| i.status);
    if status == Some(InvoiceStatus::Paid) {
        return Ok(ApprovedSettlement::AlreadyPaid);
    }

    tracing::warn!(
        invoice_id = %invoice_id,
        payment_id = %gateway_payment_id,
        invoice_status = ?status,
        "Approved payment for a closed invoice, manual review required"
    );
    Ok(ApprovedSettlement::Closed { status })
}

/// Coverage window of a one-off payment: one cycle of the paid plan's cadence,
/// anchored on the payment date.
pub fn counter_coverage_end(plan: &Plan, paid_at: OffsetDateTime) -> Date {
    let paid_on = paid_at.date();
    crate::anchor::next_expiration(paid_on.day(), plan.cadence, paid_on)
}
