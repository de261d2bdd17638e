//! Daily billing cycle
//!
//! Phases run in a fixed order, once per run:
//!
//! 1. apply due plan changes (may create subscriptions due today)
//! 2. expiration sweep: close lapsed subscriptions, invoice and charge the rest
//! 3. retry sweep: re-attempt at `first_retry_days`, expire at `final_day`
//!
//! A failure for one member is logged and counted; the sweep always processes
//! its whole candidate set.

use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::change_request::ChangeRequestQueue;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{AttemptResult, InvoiceLedger};
use crate::models::{Invoice, Subscription, SubscriptionStatus};
use crate::store::BillingStore;

const DEFAULT_FIRST_RETRY_DAYS: i64 = 3;
const DEFAULT_FINAL_DAY: i64 = 7;

/// Retry offsets in days from the invoice's creation date
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub first_retry_days: i64,
    pub final_day: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first_retry_days: DEFAULT_FIRST_RETRY_DAYS,
            final_day: DEFAULT_FINAL_DAY,
        }
    }
}

impl RetryPolicy {
    /// `BILLING_FIRST_RETRY_DAYS` / `BILLING_FINAL_RETRY_DAYS`, defaulting to 3 and 7
    pub fn from_env() -> BillingResult<Self> {
        fn read(name: &str, default: i64) -> BillingResult<i64> {
            match std::env::var(name) {
                Ok(raw) => raw
                    .parse()
                    .map_err(|_| BillingError::Config(format!("{} must be a number", name))),
                Err(_) => Ok(default),
            }
        }

        let policy = Self {
            first_retry_days: read("BILLING_FIRST_RETRY_DAYS", DEFAULT_FIRST_RETRY_DAYS)?,
            final_day: read("BILLING_FINAL_RETRY_DAYS", DEFAULT_FINAL_DAY)?,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> BillingResult<()> {
        if self.first_retry_days < 1 || self.final_day <= self.first_retry_days {
            return Err(BillingError::Config(format!(
                "invalid retry offsets: first retry day {}, final day {}",
                self.first_retry_days, self.final_day
            )));
        }
        Ok(())
    }

    /// True once the invoice reached the retry day and nothing was attempted since
    fn retry_due(&self, invoice: &Invoice, now: OffsetDateTime) -> bool {
        let retry_day = invoice.created_at.date() + Duration::days(self.first_retry_days);
        now.date() >= retry_day
            && invoice
                .last_attempt_at
                .map_or(true, |at| at.date() < retry_day)
    }
}

/// Per-phase counters of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub changes_applied: usize,
    pub subscriptions_activated: usize,
    pub closed: usize,
    pub invoiced: usize,
    pub skipped_open_invoice: usize,
    pub retried: usize,
    pub approved: usize,
    pub pending: usize,
    pub soft_declined: usize,
    pub fatal_declined: usize,
    pub skipped_no_card: usize,
    pub already_settled: usize,
    pub needs_review: usize,
    pub expired: usize,
    pub errors: usize,
}

impl SweepReport {
    fn tally(&mut self, result: &AttemptResult) {
        match result {
            AttemptResult::Paid(_) => self.approved += 1,
            AttemptResult::AlreadySettled => self.already_settled += 1,
            AttemptResult::NeedsReview { .. } => self.needs_review += 1,
            AttemptResult::Pending => self.pending += 1,
            AttemptResult::SoftDeclined { .. } => self.soft_declined += 1,
            AttemptResult::FatalDeclined { .. } => self.fatal_declined += 1,
            AttemptResult::SkippedNoCard => self.skipped_no_card += 1,
        }
    }
}

/// The scheduled billing orchestrator
#[derive(Clone)]
pub struct BillingCycle {
    store: Arc<dyn BillingStore>,
    ledger: InvoiceLedger,
    changes: ChangeRequestQueue,
    policy: RetryPolicy,
}

impl BillingCycle {
    pub fn new(
        store: Arc<dyn BillingStore>,
        ledger: InvoiceLedger,
        changes: ChangeRequestQueue,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ledger,
            changes,
            policy,
        }
    }

    pub async fn run(&self, now: OffsetDateTime) -> SweepReport {
        let mut report = SweepReport::default();

        tracing::info!(today = %now.date(), "Starting billing cycle");

        self.apply_changes(now, &mut report).await;
        self.expiration_sweep(now, &mut report).await;
        self.retry_sweep(now, &mut report).await;

        tracing::info!(
            changes_applied = report.changes_applied,
            closed = report.closed,
            invoiced = report.invoiced,
            retried = report.retried,
            approved = report.approved,
            pending = report.pending,
            soft_declined = report.soft_declined,
            fatal_declined = report.fatal_declined,
            skipped_no_card = report.skipped_no_card,
            needs_review = report.needs_review,
            expired = report.expired,
            errors = report.errors,
            "Billing cycle complete"
        );

        report
    }

    async fn apply_changes(&self, now: OffsetDateTime, report: &mut SweepReport) {
        match self.changes.apply_due(now).await {
            Ok(sweep) => {
                report.changes_applied += sweep.applied;
                report.subscriptions_activated += sweep.activated;
                report.errors += sweep.failed;
            }
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "Failed to list due plan changes");
            }
        }
    }

    async fn expiration_sweep(&self, now: OffsetDateTime, report: &mut SweepReport) {
        let due = match self.store.list_subscriptions_due(now.date()).await {
            Ok(due) => due,
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "Failed to list expiring subscriptions");
                return;
            }
        };

        for sub in due {
            if let Err(e) = self.renew_or_close(&sub, now, report).await {
                report.errors += 1;
                tracing::error!(
                    subscription_id = %sub.id,
                    user_id = %sub.user_id,
                    error = %e,
                    "Failed to process expiring subscription"
                );
            }
        }
    }

    async fn renew_or_close(
        &self,
        sub: &Subscription,
        now: OffsetDateTime,
        report: &mut SweepReport,
    ) -> BillingResult<()> {
        if sub.status == SubscriptionStatus::PendingCancellation || !sub.auto_renew {
            if let Some(closed) = self.store.close_lapsed_subscription(sub.id, now).await? {
                report.closed += 1;
                tracing::info!(
                    subscription_id = %closed.id,
                    user_id = %closed.user_id,
                    "Subscription ended without renewal"
                );
            }
            return Ok(());
        }

        // At most one open billing event per subscription
        if self.store.find_pending_invoice(sub.id).await?.is_some() {
            report.skipped_open_invoice += 1;
            return Ok(());
        }

        let invoice = self.ledger.raise_subscription_invoice(sub, now).await?;
        report.invoiced += 1;

        let result = self.ledger.attempt_charge(invoice.id, now).await?;
        report.tally(&result);
        Ok(())
    }

    async fn retry_sweep(&self, now: OffsetDateTime, report: &mut SweepReport) {
        let pending = match self.store.list_pending_subscription_invoices().await {
            Ok(pending) => pending,
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "Failed to list pending invoices");
                return;
            }
        };

        for invoice in pending {
            if let Err(e) = self.retry_or_expire(&invoice, now, report).await {
                report.errors += 1;
                tracing::error!(
                    invoice_id = %invoice.id,
                    user_id = %invoice.user_id,
                    error = %e,
                    "Failed to process pending invoice"
                );
            }
        }
    }

    async fn retry_or_expire(
        &self,
        invoice: &Invoice,
        now: OffsetDateTime,
        report: &mut SweepReport,
    ) -> BillingResult<()> {
        let age = invoice.age_in_days(now.date());

        if age >= self.policy.final_day {
            if self.ledger.expire(invoice.id, now).await?.is_some() {
                report.expired += 1;
            }
            return Ok(());
        }

        if self.policy.retry_due(invoice, now) {
            tracing::info!(
                invoice_id = %invoice.id,
                user_id = %invoice.user_id,
                age_days = age,
                "Retrying pending invoice"
            );
            let result = self.ledger.attempt_charge(invoice.id, now).await?;
            report.retried += 1;
            report.tally(&result);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockGateway;
    use crate::models::{BillingUser, Cadence, InvoiceStatus, PaymentMethod, Plan};
    use crate::payments::PaymentProcessor;
    use crate::store::InMemoryBillingStore;
    use gymflow_shared::{PlanId, UserId};
    use time::macros::{date, datetime};

    struct Fixture {
        store: Arc<InMemoryBillingStore>,
        gateway: Arc<MockGateway>,
        cycle: BillingCycle,
        user: BillingUser,
        plan: Plan,
    }

    async fn fixture(with_card: bool) -> Fixture {
        let store = Arc::new(InMemoryBillingStore::new());
        let gateway = Arc::new(MockGateway::new());
        let user = BillingUser {
            id: UserId::new(),
            email: "member@example.com".to_string(),
            billing_status: None,
        };
        let plan = Plan {
            id: PlanId::new(),
            name: "Monthly".to_string(),
            cadence: Cadence::Monthly,
            price_cents: 4_000,
            currency: "USD".to_string(),
            active: true,
        };
        store.insert_user(user.clone()).await;
        store.insert_plan(plan.clone()).await;
        if with_card {
            store
                .upsert_payment_method(&PaymentMethod {
                    user_id: user.id,
                    gateway_customer_id: "cus_1".to_string(),
                    vaulted_card_ref: "pm_1".to_string(),
                    updated_at: datetime!(2024-01-01 00:00 UTC),
                })
                .await
                .unwrap();
        }

        let payments = PaymentProcessor::new(gateway.clone(), store.clone());
        let ledger = InvoiceLedger::new(store.clone(), payments);
        let changes = ChangeRequestQueue::new(store.clone());
        let cycle = BillingCycle::new(store.clone(), ledger, changes, RetryPolicy::default());
        Fixture {
            store,
            gateway,
            cycle,
            user,
            plan,
        }
    }

    async fn subscription_ending(f: &Fixture, end: time::Date) -> Subscription {
        let created = datetime!(2024-01-01 00:00 UTC);
        let mut sub = Subscription::starting_on(f.user.id, &f.plan, true, created.date(), created);
        sub.billing_cycle_anchor_day = i16::from(end.day());
        sub.end_date = end;
        f.store.insert_subscription(sub.clone()).await;
        sub
    }

    async fn status_of(f: &Fixture, sub: &Subscription) -> (SubscriptionStatus, Option<SubscriptionStatus>) {
        let sub = f.store.get_subscription(sub.id).await.unwrap().unwrap();
        let user = f.store.get_user(f.user.id).await.unwrap().unwrap();
        (sub.status, user.billing_status)
    }

    #[tokio::test]
    async fn test_expiring_subscription_is_renewed() {
        let f = fixture(true).await;
        let sub = subscription_ending(&f, date!(2024 - 06 - 15)).await;

        let report = f.cycle.run(datetime!(2024-06-15 03:00 UTC)).await;

        assert_eq!(report.invoiced, 1);
        assert_eq!(report.approved, 1);
        let sub = f.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.end_date, date!(2024 - 07 - 15));

        // Running again the same day finds nothing to do
        let again = f.cycle.run(datetime!(2024-06-15 04:00 UTC)).await;
        assert_eq!(again.invoiced, 0);
        assert_eq!(f.gateway.charges().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_schedule_ends_in_rejection() {
        let f = fixture(true).await;
        let sub = subscription_ending(&f, date!(2024 - 06 - 15)).await;
        f.gateway.decline("insufficient_funds");
        f.gateway.decline("insufficient_funds");

        let day0 = f.cycle.run(datetime!(2024-06-15 03:00 UTC)).await;
        assert_eq!(day0.soft_declined, 1);
        assert_eq!(
            status_of(&f, &sub).await,
            (SubscriptionStatus::GracePeriod, Some(SubscriptionStatus::GracePeriod))
        );

        // Nothing between the first attempt and the retry day
        for now in [datetime!(2024-06-16 03:00 UTC), datetime!(2024-06-17 03:00 UTC)] {
            let report = f.cycle.run(now).await;
            assert_eq!(report.retried, 0);
            assert_eq!(report.invoiced, 0);
        }

        let day3 = f.cycle.run(datetime!(2024-06-18 03:00 UTC)).await;
        assert_eq!(day3.retried, 1);
        assert_eq!(day3.soft_declined, 1);

        // Exactly one re-attempt
        let day4 = f.cycle.run(datetime!(2024-06-19 03:00 UTC)).await;
        assert_eq!(day4.retried, 0);

        let day7 = f.cycle.run(datetime!(2024-06-22 03:00 UTC)).await;
        assert_eq!(day7.expired, 1);
        assert_eq!(
            status_of(&f, &sub).await,
            (SubscriptionStatus::Rejected, Some(SubscriptionStatus::Rejected))
        );
        let invoices = f.store.all_invoices().await;
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].status, InvoiceStatus::Expired);
        assert_eq!(f.gateway.charges().len(), 2);
        assert!(f
            .gateway
            .charges()
            .iter()
            .all(|c| c.idempotency_key == invoices[0].idempotency_key));

        // Rejected subscriptions are not invoiced again by the sweep
        let later = f.cycle.run(datetime!(2024-07-15 03:00 UTC)).await;
        assert_eq!(later.invoiced, 0);
    }

    #[tokio::test]
    async fn test_retry_recovers_grace_period() {
        let f = fixture(true).await;
        let sub = subscription_ending(&f, date!(2024 - 06 - 15)).await;
        f.gateway.fail_transport();

        f.cycle.run(datetime!(2024-06-15 03:00 UTC)).await;
        assert_eq!(status_of(&f, &sub).await.0, SubscriptionStatus::GracePeriod);

        let day3 = f.cycle.run(datetime!(2024-06-18 03:00 UTC)).await;
        assert_eq!(day3.approved, 1);

        let sub = f.store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        // Anchor kept: extended from the old end date, not from the payment date
        assert_eq!(sub.end_date, date!(2024 - 07 - 15));
    }

    #[tokio::test]
    async fn test_fatal_decline_is_never_retried() {
        let f = fixture(true).await;
        let sub = subscription_ending(&f, date!(2024 - 06 - 15)).await;
        f.gateway.decline("merchant_blacklist");

        let day0 = f.cycle.run(datetime!(2024-06-15 03:00 UTC)).await;
        assert_eq!(day0.fatal_declined, 1);

        let day3 = f.cycle.run(datetime!(2024-06-18 03:00 UTC)).await;
        let day7 = f.cycle.run(datetime!(2024-06-22 03:00 UTC)).await;
        assert_eq!(day3.retried, 0);
        assert_eq!(day7.expired, 0);
        assert_eq!(f.gateway.charges().len(), 1);
        assert_eq!(
            status_of(&f, &sub).await,
            (SubscriptionStatus::RejectedFatal, Some(SubscriptionStatus::RejectedFatal))
        );
    }

    #[tokio::test]
    async fn test_missing_card_expires_on_final_day() {
        let f = fixture(false).await;
        let sub = subscription_ending(&f, date!(2024 - 06 - 15)).await;

        let day0 = f.cycle.run(datetime!(2024-06-15 03:00 UTC)).await;
        assert_eq!(day0.skipped_no_card, 1);
        assert_eq!(status_of(&f, &sub).await.0, SubscriptionStatus::Active);

        let day7 = f.cycle.run(datetime!(2024-06-22 03:00 UTC)).await;
        assert_eq!(day7.expired, 1);
        assert_eq!(status_of(&f, &sub).await.0, SubscriptionStatus::Rejected);
        assert!(f.gateway.charges().is_empty());
    }

    #[tokio::test]
    async fn test_pending_cancellation_closes_at_period_end() {
        let f = fixture(true).await;
        let sub = subscription_ending(&f, date!(2024 - 06 - 15)).await;
        f.store
            .cancel_subscription(sub.id, datetime!(2024-06-01 12:00 UTC))
            .await
            .unwrap();

        let before = f.cycle.run(datetime!(2024-06-14 03:00 UTC)).await;
        assert_eq!(before.closed, 0);
        assert_eq!(status_of(&f, &sub).await.0, SubscriptionStatus::PendingCancellation);

        let report = f.cycle.run(datetime!(2024-06-15 03:00 UTC)).await;
        assert_eq!(report.closed, 1);
        assert_eq!(report.invoiced, 0);
        assert_eq!(
            status_of(&f, &sub).await,
            (SubscriptionStatus::Cancelled, Some(SubscriptionStatus::Cancelled))
        );
    }

    #[tokio::test]
    async fn test_deferred_activation_is_charged_same_run() {
        let f = fixture(true).await;
        let changes = ChangeRequestQueue::new(f.store.clone());
        changes
            .request_change(
                f.user.id,
                f.plan.id,
                None,
                Some(date!(2024 - 06 - 20)),
                datetime!(2024-06-10 12:00 UTC),
            )
            .await
            .unwrap();

        let report = f.cycle.run(datetime!(2024-06-20 03:00 UTC)).await;

        assert_eq!(report.subscriptions_activated, 1);
        assert_eq!(report.invoiced, 1);
        assert_eq!(report.approved, 1);
        let sub = f.store.find_live_subscription(f.user.id).await.unwrap().unwrap();
        assert_eq!(sub.end_date, date!(2024 - 07 - 20));
    }

    #[test]
    fn test_retry_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let inverted = RetryPolicy {
            first_retry_days: 7,
            final_day: 3,
        };
        assert!(inverted.validate().is_err());
    }
}
