//! Billing records: plans, subscriptions, invoices, change requests and vaulted cards

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use gymflow_shared::{ChangeRequestId, InvoiceId, PlanId, SubscriptionId, UserId};

use crate::anchor;

// =============================================================================
// Enums
// =============================================================================

/// Billing cadence of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Cadence {
    Monthly,
    Quarterly,
    Annual,
}

impl Cadence {
    /// Months added per billing cycle
    pub fn months(&self) -> u8 {
        match self {
            Cadence::Monthly => 1,
            Cadence::Quarterly => 3,
            Cadence::Annual => 12,
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Cadence::Monthly => "MONTHLY",
            Cadence::Quarterly => "QUARTERLY",
            Cadence::Annual => "ANNUAL",
        };
        write!(f, "{}", s)
    }
}

/// Subscription lifecycle status. The member's billing status mirrors it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Active,
    GracePeriod,
    Rejected,
    RejectedFatal,
    PendingCancellation,
    Cancelled,
}

impl SubscriptionStatus {
    /// Anything but CANCELLED still belongs to the member's current subscription
    pub fn is_live(&self) -> bool {
        !matches!(self, SubscriptionStatus::Cancelled)
    }

    /// Statuses under which the member currently has paid access
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active
                | SubscriptionStatus::GracePeriod
                | SubscriptionStatus::PendingCancellation
        )
    }

    /// Lapsed for non-payment; the next successful payment restarts the cycle
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Rejected | SubscriptionStatus::RejectedFatal
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::GracePeriod => "GRACE_PERIOD",
            SubscriptionStatus::Rejected => "REJECTED",
            SubscriptionStatus::RejectedFatal => "REJECTED_FATAL",
            SubscriptionStatus::PendingCancellation => "PENDING_CANCELLATION",
            SubscriptionStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Voided,
    Expired,
}

impl std::fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InvoiceStatus::Pending => "PENDING",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Voided => "VOIDED",
            InvoiceStatus::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeRequestStatus {
    Pending,
    Applied,
}

// =============================================================================
// Records
// =============================================================================

/// A sellable membership plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub cadence: Cadence,
    pub price_cents: i64,
    pub currency: String,
    pub active: bool,
}

/// Member as seen by billing: identity for the gateway plus the status mirror
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct BillingUser {
    pub id: UserId,
    pub email: String,
    pub billing_status: Option<SubscriptionStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub user_id: UserId,
    pub plan_id: PlanId,
    pub cadence: Cadence,
    pub billing_cycle_anchor_day: i16,
    pub auto_renew: bool,
    pub status: SubscriptionStatus,
    pub start_date: Date,
    pub end_date: Date,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// New ACTIVE subscription anchored on `today`.
    ///
    /// `end_date` starts at `today`, so the subscription is due for its first
    /// invoice immediately; the first successful payment extends it one cycle.
    pub fn starting_on(
        user_id: UserId,
        plan: &Plan,
        auto_renew: bool,
        today: Date,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            user_id,
            plan_id: plan.id,
            cadence: plan.cadence,
            billing_cycle_anchor_day: i16::from(today.day()),
            auto_renew,
            status: SubscriptionStatus::Active,
            start_date: today,
            end_date: today,
            created_at: now,
            updated_at: now,
        }
    }

    /// Anchor day as used by the anchor engine
    pub fn anchor_day(&self) -> u8 {
        u8::try_from(self.billing_cycle_anchor_day.clamp(1, 31)).unwrap_or(31)
    }

    /// End date one cycle after `from`, keeping this subscription's anchor
    pub fn next_end_date(&self, from: Date) -> Date {
        anchor::next_expiration(self.anchor_day(), self.cadence, from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Invoice {
    pub id: InvoiceId,
    pub user_id: UserId,
    /// `None` for one-off (counter) payments
    pub subscription_id: Option<SubscriptionId>,
    pub plan_id: PlanId,
    pub amount_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub idempotency_key: String,
    pub gateway_payment_id: Option<String>,
    pub attempt_count: i32,
    pub last_attempt_at: Option<OffsetDateTime>,
    pub last_failure_reason: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Invoice {
    /// PENDING invoice for one billing event of `subscription`.
    ///
    /// The idempotency key is the invoice's own identity and is never
    /// regenerated; every retry of this billing event reuses it.
    pub fn for_subscription(subscription: &Subscription, plan: &Plan, now: OffsetDateTime) -> Self {
        let id = InvoiceId::new();
        Self {
            id,
            user_id: subscription.user_id,
            subscription_id: Some(subscription.id),
            plan_id: plan.id,
            amount_cents: plan.price_cents,
            currency: plan.currency.clone(),
            status: InvoiceStatus::Pending,
            idempotency_key: id.to_string(),
            gateway_payment_id: None,
            attempt_count: 0,
            last_attempt_at: None,
            last_failure_reason: None,
            paid_at: None,
            created_at: now,
        }
    }

    /// PAID one-off invoice for a payment taken at the front desk
    pub fn counter_payment(user_id: UserId, plan: &Plan, now: OffsetDateTime) -> Self {
        Self {
            id: InvoiceId::new(),
            user_id,
            subscription_id: None,
            plan_id: plan.id,
            amount_cents: plan.price_cents,
            currency: plan.currency.clone(),
            status: InvoiceStatus::Paid,
            idempotency_key: format!("counter-{}", Uuid::new_v4()),
            gateway_payment_id: None,
            attempt_count: 0,
            last_attempt_at: None,
            last_failure_reason: None,
            paid_at: Some(now),
            created_at: now,
        }
    }

    pub fn is_one_off(&self) -> bool {
        self.subscription_id.is_none()
    }

    /// Whole days since the invoice was raised, by calendar date
    pub fn age_in_days(&self, today: Date) -> i64 {
        (today - self.created_at.date()).whole_days()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct SubscriptionChangeRequest {
    pub id: ChangeRequestId,
    pub user_id: UserId,
    /// `None` means deferred activation: a new subscription is created when due
    pub subscription_id: Option<SubscriptionId>,
    pub new_plan_id: PlanId,
    pub new_auto_renew: Option<bool>,
    pub status: ChangeRequestStatus,
    pub effective_at: Date,
    pub created_at: OffsetDateTime,
    pub applied_at: Option<OffsetDateTime>,
}

/// Card vaulted at the gateway for unattended charges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PaymentMethod {
    pub user_id: UserId,
    pub gateway_customer_id: String,
    pub vaulted_card_ref: String,
    pub updated_at: OffsetDateTime,
}
