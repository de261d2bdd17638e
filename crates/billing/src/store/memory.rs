//! In-memory [`BillingStore`].
//!
//! All tables live behind one async mutex, so every trait method is trivially a
//! single unit of work. Used by the test suites and for local experiments.

use std::collections::HashMap;

use async_trait::async_trait;
use time::{Date, Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use gymflow_shared::{ChangeRequestId, InvoiceId, PlanId, SubscriptionId, UserId};

use super::{counter_coverage_end, AppliedChange, BillingStore, QueuedWebhook, Settlement};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingUser, ChangeRequestStatus, InvoiceStatus, Invoice, PaymentMethod, Plan, Subscription,
    SubscriptionChangeRequest, SubscriptionStatus,
};
use crate::state_machine;

const WEBHOOK_RETRY_BACKOFF: Duration = Duration::minutes(5);

#[derive(Debug, Clone)]
struct WebhookRow {
    queued: QueuedWebhook,
    status: &'static str,
    last_error: Option<String>,
    last_attempt_at: Option<OffsetDateTime>,
    processed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, BillingUser>,
    plans: HashMap<PlanId, Plan>,
    payment_methods: HashMap<UserId, PaymentMethod>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    invoices: HashMap<InvoiceId, Invoice>,
    change_requests: HashMap<ChangeRequestId, SubscriptionChangeRequest>,
    webhooks: Vec<WebhookRow>,
}

impl Tables {
    fn mirror(&mut self, user_id: UserId, status: SubscriptionStatus) {
        if let Some(user) = self.users.get_mut(&user_id) {
            user.billing_status = Some(status);
        }
    }

    fn live_subscription(&self, user_id: UserId) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.status.is_live())
            .max_by_key(|s| s.created_at)
    }

    fn pending_invoice_mut(&mut self, invoice_id: InvoiceId) -> Option<&mut Invoice> {
        self.invoices
            .get_mut(&invoice_id)
            .filter(|i| i.status == InvoiceStatus::Pending)
    }

    fn void_pending_invoices(&mut self, subscription_id: SubscriptionId) {
        for invoice in self.invoices.values_mut() {
            if invoice.subscription_id == Some(subscription_id)
                && invoice.status == InvoiceStatus::Pending
            {
                invoice.status = InvoiceStatus::Voided;
            }
        }
    }

    fn check_new_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        if self
            .invoices
            .values()
            .any(|i| i.idempotency_key == invoice.idempotency_key)
        {
            return Err(BillingError::Conflict(format!(
                "idempotency key already used: {}",
                invoice.idempotency_key
            )));
        }
        if let Some(subscription_id) = invoice.subscription_id {
            if invoice.status == InvoiceStatus::Pending
                && self.invoices.values().any(|i| {
                    i.subscription_id == Some(subscription_id) && i.status == InvoiceStatus::Pending
                })
            {
                return Err(BillingError::Conflict(format!(
                    "subscription {} already has a pending invoice",
                    subscription_id
                )));
            }
        }
        Ok(())
    }
}

/// In-memory billing store
#[derive(Debug, Default)]
pub struct InMemoryBillingStore {
    tables: Mutex<Tables>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: BillingUser) {
        self.tables.lock().await.users.insert(user.id, user);
    }

    pub async fn insert_plan(&self, plan: Plan) {
        self.tables.lock().await.plans.insert(plan.id, plan);
    }

    /// Seed a subscription directly, updating the member's mirror
    pub async fn insert_subscription(&self, subscription: Subscription) {
        let mut tables = self.tables.lock().await;
        tables.mirror(subscription.user_id, subscription.status);
        tables.subscriptions.insert(subscription.id, subscription);
    }

    /// Seed an invoice without the uniqueness checks
    pub async fn force_insert_invoice(&self, invoice: Invoice) {
        self.tables.lock().await.invoices.insert(invoice.id, invoice);
    }

    pub async fn all_invoices(&self) -> Vec<Invoice> {
        let mut invoices: Vec<Invoice> =
            self.tables.lock().await.invoices.values().cloned().collect();
        invoices.sort_by_key(|i| i.created_at);
        invoices
    }

    /// Status of a queued notification, for inspection
    pub async fn webhook_status(&self, id: Uuid) -> Option<&'static str> {
        self.tables
            .lock()
            .await
            .webhooks
            .iter()
            .find(|w| w.queued.id == id)
            .map(|w| w.status)
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_user(&self, user_id: UserId) -> BillingResult<Option<BillingUser>> {
        Ok(self.tables.lock().await.users.get(&user_id).cloned())
    }

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Option<Plan>> {
        Ok(self.tables.lock().await.plans.get(&plan_id).cloned())
    }

    async fn get_payment_method(&self, user_id: UserId) -> BillingResult<Option<PaymentMethod>> {
        Ok(self.tables.lock().await.payment_methods.get(&user_id).cloned())
    }

    async fn upsert_payment_method(&self, method: &PaymentMethod) -> BillingResult<()> {
        self.tables
            .lock()
            .await
            .payment_methods
            .insert(method.user_id, method.clone());
        Ok(())
    }

    async fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .tables
            .lock()
            .await
            .subscriptions
            .get(&subscription_id)
            .cloned())
    }

    async fn find_live_subscription(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        Ok(self.tables.lock().await.live_subscription(user_id).cloned())
    }

    async fn list_subscriptions_due(&self, today: Date) -> BillingResult<Vec<Subscription>> {
        let tables = self.tables.lock().await;
        let mut due: Vec<Subscription> = tables
            .subscriptions
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    SubscriptionStatus::Active | SubscriptionStatus::PendingCancellation
                ) && s.end_date <= today
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.end_date, s.created_at));
        Ok(due)
    }

    async fn create_subscription_with_invoice(
        &self,
        subscription: &Subscription,
        invoice: &Invoice,
    ) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&subscription.user_id) {
            return Err(BillingError::NotFound(format!(
                "user {}",
                subscription.user_id
            )));
        }
        if tables.live_subscription(subscription.user_id).is_some() {
            return Err(BillingError::Conflict(
                "member already has a subscription".to_string(),
            ));
        }
        tables.check_new_invoice(invoice)?;

        tables.mirror(subscription.user_id, subscription.status);
        tables
            .subscriptions
            .insert(subscription.id, subscription.clone());
        tables.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn cancel_subscription(
        &self,
        subscription_id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut tables = self.tables.lock().await;
        let mut sub = tables
            .subscriptions
            .get(&subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;

        state_machine::cancel_subscription(&mut sub, now)
            .map_err(|e| BillingError::Validation(e.to_string()))?;
        tables.void_pending_invoices(subscription_id);

        tables.mirror(sub.user_id, sub.status);
        tables.subscriptions.insert(sub.id, sub.clone());
        Ok(sub)
    }

    async fn close_lapsed_subscription(
        &self,
        subscription_id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tables = self.tables.lock().await;
        let Some(mut sub) = tables.subscriptions.get(&subscription_id).cloned() else {
            return Ok(None);
        };
        if !state_machine::close_lapsed(&mut sub, now.date(), now) {
            return Ok(None);
        }
        tables.void_pending_invoices(subscription_id);
        tables.mirror(sub.user_id, sub.status);
        tables.subscriptions.insert(sub.id, sub.clone());
        Ok(Some(sub))
    }

    async fn get_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Option<Invoice>> {
        Ok(self.tables.lock().await.invoices.get(&invoice_id).cloned())
    }

    async fn find_invoice_by_gateway_payment(
        &self,
        gateway_payment_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        Ok(self
            .tables
            .lock()
            .await
            .invoices
            .values()
            .find(|i| i.gateway_payment_id.as_deref() == Some(gateway_payment_id))
            .cloned())
    }

    async fn find_pending_invoice(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<Invoice>> {
        Ok(self
            .tables
            .lock()
            .await
            .invoices
            .values()
            .find(|i| {
                i.subscription_id == Some(subscription_id) && i.status == InvoiceStatus::Pending
            })
            .cloned())
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        tables.check_new_invoice(invoice)?;
        tables.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn list_pending_subscription_invoices(&self) -> BillingResult<Vec<Invoice>> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<Invoice> = tables
            .invoices
            .values()
            .filter(|i| i.status == InvoiceStatus::Pending && i.subscription_id.is_some())
            .cloned()
            .collect();
        pending.sort_by_key(|i| i.created_at);
        Ok(pending)
    }

    async fn list_invoices_for_user(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> BillingResult<Vec<Invoice>> {
        let tables = self.tables.lock().await;
        let mut invoices: Vec<Invoice> = tables
            .invoices
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| std::cmp::Reverse(i.created_at));
        invoices.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(invoices)
    }

    async fn insert_counter_payment(
        &self,
        invoice: &Invoice,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;

        if tables
            .live_subscription(invoice.user_id)
            .is_some_and(|s| s.status.grants_access())
        {
            return Err(BillingError::Conflict(
                "member already has an active subscription".to_string(),
            ));
        }

        let previous = tables
            .invoices
            .values()
            .filter(|i| {
                i.user_id == invoice.user_id && i.is_one_off() && i.status == InvoiceStatus::Paid
            })
            .filter_map(|i| i.paid_at.map(|paid_at| (paid_at, i.plan_id)))
            .max_by_key(|(paid_at, _)| *paid_at);

        if let Some((paid_at, plan_id)) = previous {
            if let Some(plan) = tables.plans.get(&plan_id) {
                let covered_until = counter_coverage_end(plan, paid_at);
                if now.date() < covered_until {
                    return Err(BillingError::Conflict(format!(
                        "previous counter payment covers until {}",
                        covered_until
                    )));
                }
            }
        }

        tables.check_new_invoice(invoice)?;
        tables.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn record_attempt(
        &self,
        invoice_id: InvoiceId,
        gateway_payment_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(invoice) = tables.invoices.get_mut(&invoice_id) {
            invoice.attempt_count += 1;
            invoice.last_attempt_at = Some(now);
            if let Some(id) = gateway_payment_id {
                invoice.gateway_payment_id = Some(id.to_string());
            }
        }
        Ok(())
    }

    async fn settle_invoice(
        &self,
        invoice_id: InvoiceId,
        gateway_payment_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Settlement>> {
        let mut tables = self.tables.lock().await;
        let Some(invoice) = tables.pending_invoice_mut(invoice_id) else {
            return Ok(None);
        };
        invoice.status = InvoiceStatus::Paid;
        invoice.paid_at = Some(now);
        if let Some(id) = gateway_payment_id {
            invoice.gateway_payment_id = Some(id.to_string());
        }
        let invoice = invoice.clone();

        let mut settlement = Settlement {
            invoice: invoice.clone(),
            subscription: None,
            transition: None,
        };

        if let Some(subscription_id) = invoice.subscription_id {
            if let Some(mut sub) = tables.subscriptions.get(&subscription_id).cloned() {
                let transition = state_machine::apply_successful_payment(&mut sub, now);
                tables.mirror(sub.user_id, sub.status);
                tables.subscriptions.insert(sub.id, sub.clone());
                settlement.subscription = Some(sub);
                settlement.transition = Some(transition);
            }
        }

        Ok(Some(settlement))
    }

    async fn record_payment_failure(
        &self,
        invoice_id: InvoiceId,
        reason: &str,
        is_fatal: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tables = self.tables.lock().await;
        let Some(invoice) = tables.pending_invoice_mut(invoice_id) else {
            return Ok(None);
        };
        invoice.last_failure_reason = Some(reason.to_string());
        if is_fatal {
            invoice.status = InvoiceStatus::Voided;
        }
        let subscription_id = invoice.subscription_id;

        let Some(mut sub) = subscription_id.and_then(|id| tables.subscriptions.get(&id).cloned())
        else {
            return Ok(None);
        };
        state_machine::handle_payment_failure(&mut sub, is_fatal, now);
        tables.mirror(sub.user_id, sub.status);
        tables.subscriptions.insert(sub.id, sub.clone());
        Ok(Some(sub))
    }

    async fn void_checkout(
        &self,
        invoice_id: InvoiceId,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tables = self.tables.lock().await;
        let Some(invoice) = tables.pending_invoice_mut(invoice_id) else {
            return Ok(None);
        };
        invoice.status = InvoiceStatus::Voided;
        invoice.last_failure_reason = Some(reason.to_string());
        let subscription_id = invoice.subscription_id;

        let Some(mut sub) = subscription_id.and_then(|id| tables.subscriptions.get(&id).cloned())
        else {
            return Ok(None);
        };
        state_machine::abandon_checkout(&mut sub, now);
        tables.mirror(sub.user_id, sub.status);
        tables.subscriptions.insert(sub.id, sub.clone());
        Ok(Some(sub))
    }

    async fn expire_invoice(
        &self,
        invoice_id: InvoiceId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tables = self.tables.lock().await;
        let Some(invoice) = tables.pending_invoice_mut(invoice_id) else {
            return Ok(None);
        };
        invoice.status = InvoiceStatus::Expired;
        let subscription_id = invoice.subscription_id;

        let Some(mut sub) = subscription_id.and_then(|id| tables.subscriptions.get(&id).cloned())
        else {
            return Ok(None);
        };
        state_machine::handle_final_failure(&mut sub, now);
        tables.mirror(sub.user_id, sub.status);
        tables.subscriptions.insert(sub.id, sub.clone());
        Ok(Some(sub))
    }

    async fn get_pending_change_request(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<SubscriptionChangeRequest>> {
        Ok(self
            .tables
            .lock()
            .await
            .change_requests
            .values()
            .find(|r| r.user_id == user_id && r.status == ChangeRequestStatus::Pending)
            .cloned())
    }

    async fn insert_change_request(
        &self,
        request: &SubscriptionChangeRequest,
    ) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if tables
            .change_requests
            .values()
            .any(|r| r.user_id == request.user_id && r.status == ChangeRequestStatus::Pending)
        {
            return Err(BillingError::Conflict(
                "a plan change is already pending".to_string(),
            ));
        }
        tables.change_requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn list_due_change_requests(
        &self,
        today: Date,
    ) -> BillingResult<Vec<SubscriptionChangeRequest>> {
        let tables = self.tables.lock().await;
        let mut due: Vec<SubscriptionChangeRequest> = tables
            .change_requests
            .values()
            .filter(|r| r.status == ChangeRequestStatus::Pending && r.effective_at <= today)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.created_at);
        Ok(due)
    }

    async fn apply_change_request(
        &self,
        request_id: ChangeRequestId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<AppliedChange>> {
        let mut tables = self.tables.lock().await;
        let Some(mut request) = tables
            .change_requests
            .get(&request_id)
            .filter(|r| r.status == ChangeRequestStatus::Pending)
            .cloned()
        else {
            return Ok(None);
        };

        let plan = tables
            .plans
            .get(&request.new_plan_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", request.new_plan_id)))?;

        // Unbound requests attach to a subscription the member got in the meantime
        let target = match request.subscription_id {
            Some(id) => tables.subscriptions.get(&id).cloned(),
            None => tables.live_subscription(request.user_id).cloned(),
        };

        let (subscription, created) = match target {
            Some(mut sub) => {
                state_machine::apply_plan_change(&mut sub, &plan, request.new_auto_renew, now);
                (sub, false)
            }
            None => {
                let sub = Subscription::starting_on(
                    request.user_id,
                    &plan,
                    request.new_auto_renew.unwrap_or(true),
                    now.date(),
                    now,
                );
                (sub, true)
            }
        };

        request.subscription_id = Some(subscription.id);
        request.status = ChangeRequestStatus::Applied;
        request.applied_at = Some(now);

        tables.mirror(subscription.user_id, subscription.status);
        tables
            .subscriptions
            .insert(subscription.id, subscription.clone());
        tables.change_requests.insert(request.id, request.clone());

        Ok(Some(AppliedChange {
            request,
            subscription,
            created,
        }))
    }

    async fn enqueue_webhook(
        &self,
        webhook_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();
        self.tables.lock().await.webhooks.push(WebhookRow {
            queued: QueuedWebhook {
                id,
                webhook_type: webhook_type.to_string(),
                payload: payload.clone(),
                attempts: 0,
                max_attempts: 5,
            },
            status: "pending",
            last_error: None,
            last_attempt_at: None,
            processed_at: None,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(id)
    }

    async fn claim_webhooks(&self, limit: i64) -> BillingResult<Vec<QueuedWebhook>> {
        let now = OffsetDateTime::now_utc();
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut tables = self.tables.lock().await;
        let mut claimed = Vec::new();

        for row in tables.webhooks.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            let retryable = row.status == "pending"
                || (row.status == "failed" && row.queued.attempts < row.queued.max_attempts);
            let backed_off = row
                .last_attempt_at
                .map_or(true, |at| at < now - WEBHOOK_RETRY_BACKOFF);
            if retryable && backed_off {
                row.status = "processing";
                row.last_attempt_at = Some(now);
                row.queued.attempts += 1;
                claimed.push(row.queued.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_webhook(&self, id: Uuid) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(row) = tables.webhooks.iter_mut().find(|w| w.queued.id == id) {
            row.status = "completed";
            row.processed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn fail_webhook(&self, id: Uuid, error: &str) -> BillingResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(row) = tables.webhooks.iter_mut().find(|w| w.queued.id == id) {
            row.status = "failed";
            row.last_error = Some(error.to_string());
            if row.queued.attempts >= row.queued.max_attempts {
                row.processed_at = Some(OffsetDateTime::now_utc());
            }
        }
        Ok(())
    }

    async fn prune_webhooks(&self, retention_days: i32) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(i64::from(retention_days));
        let mut tables = self.tables.lock().await;
        let before = tables.webhooks.len();
        tables.webhooks.retain(|w| {
            let finished = matches!(w.status, "completed" | "failed");
            !(finished && w.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - tables.webhooks.len()) as u64)
    }
}
