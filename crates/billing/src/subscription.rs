//! Member-facing subscription operations
//!
//! Entry points for the request layer: checkout, cancellation, card
//! registration with immediate debt recovery, plan changes, counter payments
//! and the read projections used by profile pages.

use std::sync::Arc;

use serde::Serialize;
use time::{Date, OffsetDateTime};

use gymflow_shared::{PlanId, UserId};

use crate::change_request::ChangeRequestQueue;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{AttemptResult, InvoiceLedger};
use crate::models::{
    Invoice, PaymentMethod, Subscription, SubscriptionChangeRequest, SubscriptionStatus,
};
use crate::payments::PaymentProcessor;
use crate::store::BillingStore;

/// Number of invoices included in the overview
const OVERVIEW_INVOICE_LIMIT: i64 = 12;

/// Result of a checkout
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResult {
    /// Subscription after the first charge attempt
    pub subscription: Subscription,
    pub invoice: Invoice,
    pub attempt: AttemptResult,
}

/// Result of registering a card
#[derive(Debug, Clone, Serialize)]
pub struct CardRegistration {
    pub payment_method: PaymentMethod,
    /// Immediate recovery attempt, if the member owed anything
    pub recovery: Option<AttemptResult>,
}

/// Everything a profile page shows about billing
#[derive(Debug, Clone, Serialize)]
pub struct BillingOverview {
    pub subscription: Option<Subscription>,
    pub pending_change: Option<SubscriptionChangeRequest>,
    pub invoices: Vec<Invoice>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    payments: PaymentProcessor,
    ledger: InvoiceLedger,
    changes: ChangeRequestQueue,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        payments: PaymentProcessor,
        ledger: InvoiceLedger,
        changes: ChangeRequestQueue,
    ) -> Self {
        Self {
            store,
            payments,
            ledger,
            changes,
        }
    }

    /// Start a subscription anchored on today and charge its first invoice.
    ///
    /// A declined first charge voids the invoice and cancels the subscription,
    /// so the member is free to check out again. A charge the gateway is still
    /// processing leaves both open until the webhook settles it.
    pub async fn checkout(
        &self,
        user_id: UserId,
        plan_id: PlanId,
        auto_renew: bool,
        now: OffsetDateTime,
    ) -> BillingResult<CheckoutResult> {
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
        if let Some(existing) = self.store.find_live_subscription(user_id).await? {
            return Err(BillingError::Conflict(format!(
                "member already has a subscription in status {}",
                existing.status
            )));
        }
        if self.store.get_payment_method(user_id).await?.is_none() {
            return Err(BillingError::PaymentMethodRequired);
        }

        let subscription = Subscription::starting_on(user_id, &plan, auto_renew, now.date(), now);
        let invoice = Invoice::for_subscription(&subscription, &plan, now);
        self.store
            .create_subscription_with_invoice(&subscription, &invoice)
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            plan_id = %plan_id,
            invoice_id = %invoice.id,
            "Subscription created"
        );

        let attempt = self.ledger.attempt_checkout_charge(invoice.id, now).await?;
        let subscription = self
            .store
            .get_subscription(subscription.id)
            .await?
            .unwrap_or(subscription);
        let invoice = self.store.get_invoice(invoice.id).await?.unwrap_or(invoice);

        Ok(CheckoutResult {
            subscription,
            invoice,
            attempt,
        })
    }

    /// ACTIVE ends at period end; GRACE_PERIOD ends now. Either way the open
    /// invoice is voided.
    pub async fn cancel(&self, user_id: UserId, now: OffsetDateTime) -> BillingResult<Subscription> {
        let subscription = self
            .store
            .find_live_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("no active subscription".to_string()))?;

        let subscription = self.store.cancel_subscription(subscription.id, now).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            end_date = %subscription.end_date,
            "Subscription cancelled"
        );

        Ok(subscription)
    }

    /// Vault a new card and immediately try to collect what the member owes.
    ///
    /// An open PENDING invoice is retried as is. A rejected subscription gets a
    /// fresh recovery invoice; paying it restarts the cycle on today. A member
    /// who is cancelling owes nothing.
    pub async fn register_payment_method(
        &self,
        user_id: UserId,
        card_token: &str,
        now: OffsetDateTime,
    ) -> BillingResult<CardRegistration> {
        let payment_method = self
            .payments
            .ensure_reusable_card(user_id, card_token, now)
            .await?;

        let recovery = match self.store.find_live_subscription(user_id).await? {
            Some(subscription) => self.recover(&subscription, now).await?,
            None => None,
        };

        Ok(CardRegistration {
            payment_method,
            recovery,
        })
    }

    async fn recover(
        &self,
        subscription: &Subscription,
        now: OffsetDateTime,
    ) -> BillingResult<Option<AttemptResult>> {
        if subscription.status == SubscriptionStatus::PendingCancellation {
            return Ok(None);
        }

        if let Some(open) = self.store.find_pending_invoice(subscription.id).await? {
            tracing::info!(
                subscription_id = %subscription.id,
                invoice_id = %open.id,
                "Retrying open invoice with new card"
            );
            return Ok(Some(self.ledger.attempt_charge(open.id, now).await?));
        }

        if !subscription.status.is_rejected() {
            return Ok(None);
        }

        let invoice = self
            .ledger
            .raise_subscription_invoice(subscription, now)
            .await?;
        tracing::info!(
            subscription_id = %subscription.id,
            invoice_id = %invoice.id,
            status = %subscription.status,
            "Attempting debt recovery"
        );
        Ok(Some(self.ledger.attempt_charge(invoice.id, now).await?))
    }

    pub async fn request_plan_change(
        &self,
        user_id: UserId,
        new_plan_id: PlanId,
        new_auto_renew: Option<bool>,
        effective_at: Option<Date>,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionChangeRequest> {
        self.changes
            .request_change(user_id, new_plan_id, new_auto_renew, effective_at, now)
            .await
    }

    pub async fn record_counter_payment(
        &self,
        user_id: UserId,
        plan_id: PlanId,
        admin_id: UserId,
        now: OffsetDateTime,
    ) -> BillingResult<Invoice> {
        self.ledger
            .record_counter_payment(user_id, plan_id, admin_id, now)
            .await
    }

    pub async fn current_subscription(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        self.store.find_live_subscription(user_id).await
    }

    pub async fn invoice_history(&self, user_id: UserId, limit: i64) -> BillingResult<Vec<Invoice>> {
        self.ledger.invoice_history(user_id, limit).await
    }

    pub async fn pending_change(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<SubscriptionChangeRequest>> {
        self.changes.pending_for(user_id).await
    }

    pub async fn billing_overview(&self, user_id: UserId) -> BillingResult<BillingOverview> {
        let (subscription, pending_change, invoices) = tokio::try_join!(
            self.current_subscription(user_id),
            self.pending_change(user_id),
            self.invoice_history(user_id, OVERVIEW_INVOICE_LIMIT),
        )?;

        Ok(BillingOverview {
            subscription,
            pending_change,
            invoices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::models::{BillingUser, Cadence, InvoiceStatus, Plan, SubscriptionStatus};
    use crate::state_machine::PaymentTransition;
    use crate::store::InMemoryBillingStore;
    use time::macros::{date, datetime};

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        gateway: Arc<MockGateway>,
        service: SubscriptionService,
        user_id: UserId,
        plan: Plan,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBillingStore::new());
        let gateway = Arc::new(MockGateway::new());
        let user_id = UserId::new();
        store
            .insert_user(BillingUser {
                id: user_id,
                email: "member@example.com".to_string(),
                billing_status: None,
            })
            .await;
        let plan = Plan {
            id: PlanId::new(),
            name: "Monthly".to_string(),
            cadence: Cadence::Monthly,
            price_cents: 4_000,
            currency: "USD".to_string(),
            active: true,
        };
        store.insert_plan(plan.clone()).await;

        let payments = PaymentProcessor::new(gateway.clone(), store.clone());
        let ledger = InvoiceLedger::new(store.clone(), payments.clone());
        let changes = ChangeRequestQueue::new(store.clone());
        let service = SubscriptionService::new(store.clone(), payments, ledger, changes);
        Fixture {
            store,
            gateway,
            service,
            user_id,
            plan,
        }
    }

    #[tokio::test]
    async fn test_checkout_charges_and_extends() {
        let f = fixture().await;
        let now = datetime!(2024-01-31 12:00 UTC);
        f.service
            .register_payment_method(f.user_id, "pm_card_visa", now)
            .await
            .unwrap();

        let result = f.service.checkout(f.user_id, f.plan.id, true, now).await.unwrap();

        assert!(matches!(result.attempt, AttemptResult::Paid(_)));
        assert_eq!(result.invoice.status, InvoiceStatus::Paid);
        assert_eq!(result.subscription.billing_cycle_anchor_day, 31);
        assert_eq!(result.subscription.end_date, date!(2024 - 02 - 29));
        let user = f.store.get_user(f.user_id).await.unwrap().unwrap();
        assert_eq!(user.billing_status, Some(SubscriptionStatus::Active));
    }

    #[tokio::test]
    async fn test_checkout_requires_card_and_no_live_subscription() {
        let f = fixture().await;
        let now = datetime!(2024-06-01 12:00 UTC);

        let err = f.service.checkout(f.user_id, f.plan.id, true, now).await.unwrap_err();
        assert!(matches!(err, BillingError::PaymentMethodRequired));

        f.service
            .register_payment_method(f.user_id, "pm_card_visa", now)
            .await
            .unwrap();
        f.service.checkout(f.user_id, f.plan.id, true, now).await.unwrap();

        let err = f.service.checkout(f.user_id, f.plan.id, true, now).await.unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    /// GRACE_PERIOD subscription anchored on the 1st with its renewal invoice open
    async fn subscription_in_grace(f: &Fixture) -> (Subscription, Invoice) {
        let created = datetime!(2024-05-01 12:00 UTC);
        let mut sub = Subscription::starting_on(f.user_id, &f.plan, true, date!(2024 - 05 - 01), created);
        sub.end_date = date!(2024 - 06 - 01);
        sub.status = SubscriptionStatus::GracePeriod;
        f.store.insert_subscription(sub.clone()).await;
        let invoice = Invoice::for_subscription(&sub, &f.plan, datetime!(2024-06-01 03:00 UTC));
        f.store.insert_invoice(&invoice).await.unwrap();
        (sub, invoice)
    }

    #[tokio::test]
    async fn test_declined_checkout_grants_no_access() {
        let f = fixture().await;
        let now = datetime!(2024-06-01 12:00 UTC);
        f.service
            .register_payment_method(f.user_id, "pm_card_visa", now)
            .await
            .unwrap();
        f.gateway.decline("insufficient_funds");

        let result = f.service.checkout(f.user_id, f.plan.id, true, now).await.unwrap();

        assert!(matches!(result.attempt, AttemptResult::SoftDeclined { .. }));
        assert_eq!(result.subscription.status, SubscriptionStatus::Cancelled);
        assert!(!result.subscription.status.grants_access());
        assert_eq!(result.invoice.status, InvoiceStatus::Voided);
        assert!(f.service.current_subscription(f.user_id).await.unwrap().is_none());
        let user = f.store.get_user(f.user_id).await.unwrap().unwrap();
        assert_eq!(user.billing_status, Some(SubscriptionStatus::Cancelled));

        // Nothing is retried by the sweep; the member simply checks out again
        let retry = f.service.checkout(f.user_id, f.plan.id, true, now).await.unwrap();
        assert!(matches!(retry.attempt, AttemptResult::Paid(_)));
        assert_eq!(retry.subscription.status, SubscriptionStatus::Active);
        assert_ne!(retry.invoice.idempotency_key, result.invoice.idempotency_key);
    }

    #[tokio::test]
    async fn test_fatal_checkout_decline_is_not_a_debt() {
        let f = fixture().await;
        let now = datetime!(2024-06-01 12:00 UTC);
        f.service
            .register_payment_method(f.user_id, "pm_card_visa", now)
            .await
            .unwrap();
        f.gateway.decline("fraudulent");

        let result = f.service.checkout(f.user_id, f.plan.id, true, now).await.unwrap();

        assert!(matches!(result.attempt, AttemptResult::FatalDeclined { .. }));
        assert_eq!(result.subscription.status, SubscriptionStatus::Cancelled);
        assert_eq!(result.invoice.status, InvoiceStatus::Voided);
    }

    #[tokio::test]
    async fn test_new_card_retries_open_invoice() {
        let f = fixture().await;
        let (sub, invoice) = subscription_in_grace(&f).await;

        let later = datetime!(2024-06-02 09:00 UTC);
        let registration = f
            .service
            .register_payment_method(f.user_id, "pm_new", later)
            .await
            .unwrap();

        assert!(matches!(registration.recovery, Some(AttemptResult::Paid(_))));
        // Same invoice, same key: no second billing event
        let invoices = f.store.all_invoices().await;
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].id, invoice.id);
        assert_eq!(f.gateway.charges()[0].idempotency_key, invoice.idempotency_key);
        let sub = f.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.end_date, date!(2024 - 07 - 01));
    }

    #[tokio::test]
    async fn test_new_card_does_not_resubmit_processing_charge() {
        let f = fixture().await;
        let now = datetime!(2024-06-01 12:00 UTC);
        f.service
            .register_payment_method(f.user_id, "pm_old", now)
            .await
            .unwrap();
        f.gateway.pend();
        let checkout = f.service.checkout(f.user_id, f.plan.id, true, now).await.unwrap();
        assert!(matches!(checkout.attempt, AttemptResult::Pending));

        let registration = f
            .service
            .register_payment_method(f.user_id, "pm_new", datetime!(2024-06-01 12:05 UTC))
            .await
            .unwrap();

        assert!(matches!(registration.recovery, Some(AttemptResult::Pending)));
        assert_eq!(f.gateway.charges().len(), 1);
        let invoice = f.store.get_invoice(checkout.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_new_card_reactivates_rejected_subscription() {
        let f = fixture().await;
        let created = datetime!(2024-04-10 12:00 UTC);
        let mut sub = Subscription::starting_on(f.user_id, &f.plan, true, date!(2024 - 04 - 10), created);
        sub.end_date = date!(2024 - 05 - 10);
        sub.status = SubscriptionStatus::Rejected;
        f.store.insert_subscription(sub.clone()).await;

        let now = datetime!(2024-06-20 08:00 UTC);
        let registration = f
            .service
            .register_payment_method(f.user_id, "pm_new", now)
            .await
            .unwrap();

        let Some(AttemptResult::Paid(settlement)) = registration.recovery else {
            panic!("expected recovery payment");
        };
        assert_eq!(
            settlement.transition,
            Some(PaymentTransition::ReactivatedFromDebt)
        );
        let sub = f.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.billing_cycle_anchor_day, 20);
        assert_eq!(sub.start_date, date!(2024 - 06 - 20));
        assert_eq!(sub.end_date, date!(2024 - 07 - 20));
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_card_without_debt_attempts_nothing() {
        let f = fixture().await;
        let registration = f
            .service
            .register_payment_method(f.user_id, "pm_card_visa", datetime!(2024-06-01 12:00 UTC))
            .await
            .unwrap();

        assert!(registration.recovery.is_none());
        assert_eq!(registration.payment_method.gateway_customer_id, format!("cus_{}", f.user_id));
        assert!(f.gateway.charges().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_active_keeps_access_until_end() {
        let f = fixture().await;
        let now = datetime!(2024-06-01 12:00 UTC);
        f.service
            .register_payment_method(f.user_id, "pm_card_visa", now)
            .await
            .unwrap();
        f.service.checkout(f.user_id, f.plan.id, true, now).await.unwrap();

        let sub = f
            .service
            .cancel(f.user_id, datetime!(2024-06-10 12:00 UTC))
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::PendingCancellation);
        assert_eq!(sub.end_date, date!(2024 - 07 - 01));
        assert!(!sub.auto_renew);

        let err = f
            .service
            .cancel(f.user_id, datetime!(2024-06-11 12:00 UTC))
            .await
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_cancel_from_grace_voids_open_invoice() {
        let f = fixture().await;
        let (_, invoice) = subscription_in_grace(&f).await;

        let sub = f
            .service
            .cancel(f.user_id, datetime!(2024-06-02 12:00 UTC))
            .await
            .unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        let invoice = f.store.get_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Voided);
        let user = f.store.get_user(f.user_id).await.unwrap().unwrap();
        assert_eq!(user.billing_status, Some(SubscriptionStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelling_member_is_not_charged_by_new_card() {
        let f = fixture().await;
        let created = datetime!(2024-05-01 12:00 UTC);
        let mut sub = Subscription::starting_on(f.user_id, &f.plan, true, date!(2024 - 05 - 01), created);
        sub.end_date = date!(2024 - 06 - 01);
        f.store.insert_subscription(sub.clone()).await;
        // Renewal invoice left open because no card was on file
        let invoice = Invoice::for_subscription(&sub, &f.plan, datetime!(2024-06-01 03:00 UTC));
        f.store.insert_invoice(&invoice).await.unwrap();

        let cancelled = f
            .service
            .cancel(f.user_id, datetime!(2024-06-01 10:00 UTC))
            .await
            .unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::PendingCancellation);

        let registration = f
            .service
            .register_payment_method(f.user_id, "pm_new", datetime!(2024-06-01 11:00 UTC))
            .await
            .unwrap();

        assert!(registration.recovery.is_none());
        assert!(f.gateway.charges().is_empty());
        let invoice = f.store.get_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Voided);
        let sub = f.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.end_date, date!(2024 - 06 - 01));
        assert_eq!(sub.status, SubscriptionStatus::PendingCancellation);
    }

    #[tokio::test]
    async fn test_overview_collects_projections() {
        let f = fixture().await;
        let now = datetime!(2024-06-01 12:00 UTC);
        f.service
            .register_payment_method(f.user_id, "pm_card_visa", now)
            .await
            .unwrap();
        f.service.checkout(f.user_id, f.plan.id, true, now).await.unwrap();
        f.service
            .request_plan_change(f.user_id, f.plan.id, Some(false), None, now)
            .await
            .unwrap();

        let overview = f.service.billing_overview(f.user_id).await.unwrap();

        assert!(overview.subscription.is_some());
        assert_eq!(
            overview.pending_change.map(|c| c.effective_at),
            Some(date!(2024 - 07 - 01))
        );
        assert_eq!(overview.invoices.len(), 1);
    }
}
