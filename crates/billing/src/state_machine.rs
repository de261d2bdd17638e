//! Subscription state machine
//!
//! Pure transition functions over a [`Subscription`]. They never touch storage:
//! a [`BillingStore`](crate::store::BillingStore) applies them inside the same
//! unit of work that writes the subscription row and the member's status mirror,
//! so nobody can observe one updated without the other.
//!
//! ```text
//!   ACTIVE ──soft fail──▶ GRACE_PERIOD ──day 7──▶ REJECTED
//!     │  ▲                   │   │                    │
//!     │  └──── payment ──────┘   └── cancel ──▶ CANCELLED
//!     │                                              ▲
//!     └── cancel ──▶ PENDING_CANCELLATION ── end ────┘
//!   any ──fatal decline──▶ REJECTED_FATAL
//!   new ACTIVE ──declined first charge──▶ CANCELLED
//!   REJECTED / REJECTED_FATAL ──payment──▶ ACTIVE (re-anchored)
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Date, OffsetDateTime};

use crate::models::{Plan, Subscription, SubscriptionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("subscription in status {0} cannot be cancelled")]
    NotCancellable(SubscriptionStatus),
}

/// Which transition a successful payment caused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTransition {
    /// Ordinary renewal, anchor preserved
    Extended,
    /// Debt recovery, cycle restarted on the repayment date
    ReactivatedFromDebt,
    /// Subscription was already cancelled; the payment is recorded only
    Unchanged,
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Access continues until `end_date`
    EndOfPeriod,
    /// Cancelled from GRACE_PERIOD; access ends now
    Immediate,
}

/// Ordinary renewal: move `end_date` one cycle forward from the previous end
/// date and keep the anchor.
///
/// A subscription already on its way out (PENDING_CANCELLATION) keeps that
/// status; the member simply paid for one more period.
pub fn extend(sub: &mut Subscription, now: OffsetDateTime) {
    sub.end_date = sub.next_end_date(sub.end_date);
    if sub.status != SubscriptionStatus::PendingCancellation {
        sub.status = SubscriptionStatus::Active;
    }
    sub.updated_at = now;
}

/// Debt recovery: the cycle restarts on the repayment date. The old anchor is
/// deliberately discarded.
pub fn reactivate_from_debt(sub: &mut Subscription, today: Date, now: OffsetDateTime) {
    sub.billing_cycle_anchor_day = i16::from(today.day());
    sub.start_date = today;
    sub.end_date = sub.next_end_date(today);
    sub.status = SubscriptionStatus::Active;
    sub.updated_at = now;
}

/// Dispatch a successful payment to `extend` or `reactivate_from_debt`
pub fn apply_successful_payment(sub: &mut Subscription, now: OffsetDateTime) -> PaymentTransition {
    match sub.status {
        SubscriptionStatus::Rejected | SubscriptionStatus::RejectedFatal => {
            reactivate_from_debt(sub, now.date(), now);
            PaymentTransition::ReactivatedFromDebt
        }
        SubscriptionStatus::Cancelled => PaymentTransition::Unchanged,
        _ => {
            extend(sub, now);
            PaymentTransition::Extended
        }
    }
}

/// A declined attempt.
///
/// Fatal declines are terminal. Soft declines put the subscription into
/// GRACE_PERIOD unless it is already rejected, so a rejected member never
/// bounces back into retry eligibility.
pub fn handle_payment_failure(sub: &mut Subscription, is_fatal: bool, now: OffsetDateTime) {
    if is_fatal {
        sub.status = SubscriptionStatus::RejectedFatal;
    } else if !sub.status.is_rejected() && sub.status != SubscriptionStatus::Cancelled {
        sub.status = SubscriptionStatus::GracePeriod;
    }
    sub.updated_at = now;
}

/// Retry schedule exhausted. REJECTED stays eligible for reactivation with a
/// new card; a fatal block or a cancellation is never softened.
pub fn handle_final_failure(sub: &mut Subscription, now: OffsetDateTime) {
    if !matches!(
        sub.status,
        SubscriptionStatus::RejectedFatal | SubscriptionStatus::Cancelled
    ) {
        sub.status = SubscriptionStatus::Rejected;
    }
    sub.updated_at = now;
}

pub fn cancel_subscription(
    sub: &mut Subscription,
    now: OffsetDateTime,
) -> Result<CancelOutcome, TransitionError> {
    let outcome = match sub.status {
        SubscriptionStatus::Active => {
            sub.status = SubscriptionStatus::PendingCancellation;
            CancelOutcome::EndOfPeriod
        }
        SubscriptionStatus::GracePeriod => {
            sub.status = SubscriptionStatus::Cancelled;
            CancelOutcome::Immediate
        }
        other => return Err(TransitionError::NotCancellable(other)),
    };
    sub.auto_renew = false;
    sub.updated_at = now;
    Ok(outcome)
}

/// The first charge of a checkout was declined: the subscription never
/// started, so it is closed without ever granting access.
pub fn abandon_checkout(sub: &mut Subscription, now: OffsetDateTime) {
    sub.status = SubscriptionStatus::Cancelled;
    sub.auto_renew = false;
    sub.updated_at = now;
}

/// End of a period that will not renew: PENDING_CANCELLATION, or ACTIVE with
/// auto-renew switched off. Returns false when the subscription is not lapsing.
pub fn close_lapsed(sub: &mut Subscription, today: Date, now: OffsetDateTime) -> bool {
    let lapsing = sub.status == SubscriptionStatus::PendingCancellation
        || (sub.status == SubscriptionStatus::Active && !sub.auto_renew);
    if !lapsing || sub.end_date > today {
        return false;
    }
    sub.status = SubscriptionStatus::Cancelled;
    sub.auto_renew = false;
    sub.updated_at = now;
    true
}

/// Scheduled plan change: new plan and cadence take effect from the next
/// renewal; the current period and the anchor are untouched.
pub fn apply_plan_change(
    sub: &mut Subscription,
    plan: &Plan,
    new_auto_renew: Option<bool>,
    now: OffsetDateTime,
) {
    sub.plan_id = plan.id;
    sub.cadence = plan.cadence;
    if let Some(auto_renew) = new_auto_renew {
        sub.auto_renew = auto_renew;
    }
    sub.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Cadence;
    use gymflow_shared::{PlanId, UserId};
    use time::macros::{date, datetime};

    fn plan(cadence: Cadence) -> Plan {
        Plan {
            id: PlanId::new(),
            name: format!("{cadence}"),
            cadence,
            price_cents: 3_000,
            currency: "USD".to_string(),
            active: true,
        }
    }

    fn subscription(anchor: i16, end: Date, status: SubscriptionStatus) -> Subscription {
        let now = datetime!(2024-01-01 00:00 UTC);
        let mut sub = Subscription::starting_on(UserId::new(), &plan(Cadence::Monthly), true, end, now);
        sub.billing_cycle_anchor_day = anchor;
        sub.status = status;
        sub
    }

    #[test]
    fn test_extend_from_grace_period() {
        let mut sub = subscription(15, date!(2024 - 06 - 15), SubscriptionStatus::GracePeriod);
        let now = datetime!(2024-06-18 10:00 UTC);

        assert_eq!(apply_successful_payment(&mut sub, now), PaymentTransition::Extended);
        assert_eq!(sub.end_date, date!(2024 - 07 - 15));
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.billing_cycle_anchor_day, 15);
    }

    #[test]
    fn test_extend_never_changes_anchor() {
        let mut sub = subscription(31, date!(2024 - 03 - 31), SubscriptionStatus::Active);
        let now = datetime!(2024-03-31 03:00 UTC);

        extend(&mut sub, now);
        assert_eq!(sub.end_date, date!(2024 - 04 - 30));
        extend(&mut sub, now);
        assert_eq!(sub.end_date, date!(2024 - 05 - 31));
        assert_eq!(sub.billing_cycle_anchor_day, 31);
    }

    #[test]
    fn test_extend_keeps_pending_cancellation() {
        let mut sub = subscription(
            10,
            date!(2024 - 06 - 10),
            SubscriptionStatus::PendingCancellation,
        );
        extend(&mut sub, datetime!(2024-06-10 03:00 UTC));
        assert_eq!(sub.status, SubscriptionStatus::PendingCancellation);
        assert_eq!(sub.end_date, date!(2024 - 07 - 10));
    }

    #[test]
    fn test_reactivation_reanchors_on_repayment_day() {
        for status in [SubscriptionStatus::Rejected, SubscriptionStatus::RejectedFatal] {
            let mut sub = subscription(5, date!(2024 - 02 - 05), status);
            let now = datetime!(2024-04-22 16:45 UTC);

            assert_eq!(
                apply_successful_payment(&mut sub, now),
                PaymentTransition::ReactivatedFromDebt
            );
            assert_eq!(sub.billing_cycle_anchor_day, 22);
            assert_eq!(sub.start_date, date!(2024 - 04 - 22));
            assert_eq!(sub.end_date, date!(2024 - 05 - 22));
            assert_eq!(sub.status, SubscriptionStatus::Active);
        }
    }

    #[test]
    fn test_payment_on_cancelled_subscription_changes_nothing() {
        let mut sub = subscription(5, date!(2024 - 02 - 05), SubscriptionStatus::Cancelled);
        let before = sub.clone();
        assert_eq!(
            apply_successful_payment(&mut sub, datetime!(2024-02-06 00:00 UTC)),
            PaymentTransition::Unchanged
        );
        assert_eq!(sub, before);
    }

    #[test]
    fn test_fatal_failure_always_rejected_fatal() {
        let now = datetime!(2024-06-15 03:00 UTC);
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::GracePeriod,
            SubscriptionStatus::Rejected,
            SubscriptionStatus::PendingCancellation,
        ] {
            let mut sub = subscription(15, date!(2024 - 06 - 15), status);
            handle_payment_failure(&mut sub, true, now);
            assert_eq!(sub.status, SubscriptionStatus::RejectedFatal, "from {status}");
        }
    }

    #[test]
    fn test_soft_failure_moves_to_grace() {
        let mut sub = subscription(15, date!(2024 - 06 - 15), SubscriptionStatus::Active);
        handle_payment_failure(&mut sub, false, datetime!(2024-06-15 03:00 UTC));
        assert_eq!(sub.status, SubscriptionStatus::GracePeriod);
        assert_eq!(sub.end_date, date!(2024 - 06 - 15));
    }

    #[test]
    fn test_soft_failure_leaves_rejected_alone() {
        let mut sub = subscription(15, date!(2024 - 06 - 15), SubscriptionStatus::Rejected);
        handle_payment_failure(&mut sub, false, datetime!(2024-06-20 03:00 UTC));
        assert_eq!(sub.status, SubscriptionStatus::Rejected);

        let mut sub = subscription(15, date!(2024 - 06 - 15), SubscriptionStatus::RejectedFatal);
        handle_payment_failure(&mut sub, false, datetime!(2024-06-20 03:00 UTC));
        assert_eq!(sub.status, SubscriptionStatus::RejectedFatal);
    }

    #[test]
    fn test_final_failure_rejects_but_keeps_fatal() {
        let now = datetime!(2024-06-22 03:00 UTC);
        let mut sub = subscription(15, date!(2024 - 06 - 15), SubscriptionStatus::GracePeriod);
        handle_final_failure(&mut sub, now);
        assert_eq!(sub.status, SubscriptionStatus::Rejected);

        let mut sub = subscription(15, date!(2024 - 06 - 15), SubscriptionStatus::RejectedFatal);
        handle_final_failure(&mut sub, now);
        assert_eq!(sub.status, SubscriptionStatus::RejectedFatal);
    }

    #[test]
    fn test_cancel_active_waits_for_period_end() {
        let mut sub = subscription(15, date!(2024 - 07 - 15), SubscriptionStatus::Active);
        let outcome = cancel_subscription(&mut sub, datetime!(2024-06-20 12:00 UTC)).unwrap();

        assert_eq!(outcome, CancelOutcome::EndOfPeriod);
        assert_eq!(sub.status, SubscriptionStatus::PendingCancellation);
        assert!(!sub.auto_renew);
        assert_eq!(sub.end_date, date!(2024 - 07 - 15));
    }

    #[test]
    fn test_cancel_grace_is_immediate() {
        let mut sub = subscription(15, date!(2024 - 06 - 15), SubscriptionStatus::GracePeriod);
        let outcome = cancel_subscription(&mut sub, datetime!(2024-06-17 12:00 UTC)).unwrap();

        assert_eq!(outcome, CancelOutcome::Immediate);
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        assert!(!sub.auto_renew);
    }

    #[test]
    fn test_cancel_rejected_is_refused() {
        let mut sub = subscription(15, date!(2024 - 06 - 15), SubscriptionStatus::Rejected);
        let err = cancel_subscription(&mut sub, datetime!(2024-06-17 12:00 UTC)).unwrap_err();
        assert_eq!(err, TransitionError::NotCancellable(SubscriptionStatus::Rejected));
        assert_eq!(sub.status, SubscriptionStatus::Rejected);
    }

    #[test]
    fn test_abandoned_checkout_is_cancelled() {
        let today = date!(2024 - 06 - 01);
        let mut sub = subscription(1, today, SubscriptionStatus::Active);
        abandon_checkout(&mut sub, datetime!(2024-06-01 12:00 UTC));

        assert_eq!(sub.status, SubscriptionStatus::Cancelled);
        assert!(!sub.status.grants_access());
        assert!(!sub.auto_renew);
        assert_eq!(sub.end_date, today);
    }

    #[test]
    fn test_close_lapsed() {
        let now = datetime!(2024-07-15 03:00 UTC);
        let mut sub = subscription(
            15,
            date!(2024 - 07 - 15),
            SubscriptionStatus::PendingCancellation,
        );
        assert!(close_lapsed(&mut sub, now.date(), now));
        assert_eq!(sub.status, SubscriptionStatus::Cancelled);

        let mut renewing = subscription(15, date!(2024 - 07 - 15), SubscriptionStatus::Active);
        assert!(!close_lapsed(&mut renewing, now.date(), now));
        assert_eq!(renewing.status, SubscriptionStatus::Active);

        let mut not_yet = subscription(
            15,
            date!(2024 - 07 - 16),
            SubscriptionStatus::PendingCancellation,
        );
        assert!(!close_lapsed(&mut not_yet, now.date(), now));
    }

    #[test]
    fn test_plan_change_keeps_period_and_anchor() {
        let mut sub = subscription(20, date!(2024 - 07 - 20), SubscriptionStatus::Active);
        let annual = plan(Cadence::Annual);

        apply_plan_change(&mut sub, &annual, Some(false), datetime!(2024-07-20 03:00 UTC));
        assert_eq!(sub.plan_id, annual.id);
        assert_eq!(sub.cadence, Cadence::Annual);
        assert!(!sub.auto_renew);
        assert_eq!(sub.end_date, date!(2024 - 07 - 20));
        assert_eq!(sub.next_end_date(sub.end_date), date!(2025 - 07 - 20));
    }
}
