//! Scheduled plan changes and deferred activations

use std::sync::Arc;

use serde::Serialize;
use time::{Date, OffsetDateTime};

use gymflow_shared::{ChangeRequestId, PlanId, UserId};

use crate::error::{BillingError, BillingResult};
use crate::models::{ChangeRequestStatus, SubscriptionChangeRequest};
use crate::store::BillingStore;

/// Outcome of applying every due request
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSweep {
    pub applied: usize,
    /// Requests that created a subscription (deferred activation)
    pub activated: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ChangeRequestQueue {
    store: Arc<dyn BillingStore>,
}

impl ChangeRequestQueue {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Queue a plan change for the member.
    ///
    /// With a live subscription the request is bound to it and defaults to
    /// taking effect at the end of the current period. Without one the request
    /// is unbound and creates a new subscription when it comes due (today by
    /// default). Conflict when another request is still pending.
    pub async fn request_change(
        &self,
        user_id: UserId,
        new_plan_id: PlanId,
        new_auto_renew: Option<bool>,
        effective_at: Option<Date>,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionChangeRequest> {
        let today = now.date();

        if self.store.get_user(user_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("user {}", user_id)));
        }
        let plan = self
            .store
            .get_plan(new_plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {}", new_plan_id)))?;
        if !plan.active {
            return Err(BillingError::Validation(format!(
                "plan {} is not available",
                plan.name
            )));
        }
        if let Some(date) = effective_at {
            if date < today {
                return Err(BillingError::Validation(format!(
                    "effective date {} is in the past",
                    date
                )));
            }
        }

        if self.store.get_pending_change_request(user_id).await?.is_some() {
            return Err(BillingError::Conflict(
                "a plan change is already pending".to_string(),
            ));
        }

        let subscription = self.store.find_live_subscription(user_id).await?;
        let effective_at = effective_at.unwrap_or_else(|| {
            subscription
                .as_ref()
                .map_or(today, |s| s.end_date.max(today))
        });

        let request = SubscriptionChangeRequest {
            id: ChangeRequestId::new(),
            user_id,
            subscription_id: subscription.as_ref().map(|s| s.id),
            new_plan_id,
            new_auto_renew,
            status: ChangeRequestStatus::Pending,
            effective_at,
            created_at: now,
            applied_at: None,
        };
        self.store.insert_change_request(&request).await?;

        tracing::info!(
            request_id = %request.id,
            user_id = %user_id,
            plan_id = %new_plan_id,
            effective_at = %effective_at,
            deferred_activation = request.subscription_id.is_none(),
            "Queued plan change"
        );

        Ok(request)
    }

    pub async fn pending_for(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<SubscriptionChangeRequest>> {
        self.store.get_pending_change_request(user_id).await
    }

    /// Apply every PENDING request with `effective_at <= today`. A failing
    /// request is logged and left pending for the next run.
    pub async fn apply_due(&self, now: OffsetDateTime) -> BillingResult<ChangeSweep> {
        let mut sweep = ChangeSweep::default();

        for request in self.store.list_due_change_requests(now.date()).await? {
            match self.store.apply_change_request(request.id, now).await {
                Ok(Some(applied)) => {
                    sweep.applied += 1;
                    if applied.created {
                        sweep.activated += 1;
                    }
                    tracing::info!(
                        request_id = %request.id,
                        user_id = %request.user_id,
                        subscription_id = %applied.subscription.id,
                        created = applied.created,
                        "Applied plan change"
                    );
                }
                Ok(None) => {
                    tracing::debug!(request_id = %request.id, "Plan change already applied");
                }
                Err(e) => {
                    sweep.failed += 1;
                    tracing::error!(
                        request_id = %request.id,
                        user_id = %request.user_id,
                        error = %e,
                        "Failed to apply plan change"
                    );
                }
            }
        }

        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingUser, Cadence, Plan, Subscription, SubscriptionStatus};
    use crate::store::InMemoryBillingStore;
    use time::macros::{date, datetime};

    async fn setup() -> (Arc<InMemoryBillingStore>, ChangeRequestQueue, UserId, Plan, Plan) {
        let store = Arc::new(InMemoryBillingStore::new());
        let user_id = UserId::new();
        store
            .insert_user(BillingUser {
                id: user_id,
                email: "member@example.com".to_string(),
                billing_status: None,
            })
            .await;
        let monthly = Plan {
            id: PlanId::new(),
            name: "Monthly".to_string(),
            cadence: Cadence::Monthly,
            price_cents: 4_000,
            currency: "USD".to_string(),
            active: true,
        };
        let annual = Plan {
            id: PlanId::new(),
            name: "Annual".to_string(),
            cadence: Cadence::Annual,
            price_cents: 40_000,
            currency: "USD".to_string(),
            active: true,
        };
        store.insert_plan(monthly.clone()).await;
        store.insert_plan(annual.clone()).await;
        let queue = ChangeRequestQueue::new(store.clone());
        (store, queue, user_id, monthly, annual)
    }

    #[tokio::test]
    async fn test_bound_change_waits_for_period_end() {
        let (store, queue, user_id, monthly, annual) = setup().await;
        let now = datetime!(2024-06-01 10:00 UTC);
        let mut sub = Subscription::starting_on(user_id, &monthly, true, date!(2024 - 05 - 20), now);
        sub.end_date = date!(2024 - 06 - 20);
        store.insert_subscription(sub.clone()).await;

        let request = queue
            .request_change(user_id, annual.id, Some(false), None, now)
            .await
            .unwrap();
        assert_eq!(request.subscription_id, Some(sub.id));
        assert_eq!(request.effective_at, date!(2024 - 06 - 20));

        let early = queue.apply_due(datetime!(2024-06-19 03:00 UTC)).await.unwrap();
        assert_eq!(early.applied, 0);

        let due = queue.apply_due(datetime!(2024-06-20 03:00 UTC)).await.unwrap();
        assert_eq!(due.applied, 1);
        let sub = store.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(sub.plan_id, annual.id);
        assert_eq!(sub.cadence, Cadence::Annual);
        assert!(!sub.auto_renew);
        assert_eq!(sub.billing_cycle_anchor_day, 20);
        assert!(queue.pending_for(user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_pending_request_conflicts() {
        let (_, queue, user_id, monthly, annual) = setup().await;
        let now = datetime!(2024-06-01 10:00 UTC);

        queue
            .request_change(user_id, monthly.id, None, Some(date!(2024 - 07 - 01)), now)
            .await
            .unwrap();
        let err = queue
            .request_change(user_id, annual.id, None, None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_unbound_request_activates_subscription() {
        let (store, queue, user_id, monthly, _) = setup().await;
        let now = datetime!(2024-06-01 10:00 UTC);

        let request = queue
            .request_change(user_id, monthly.id, None, Some(date!(2024 - 06 - 05)), now)
            .await
            .unwrap();
        assert!(request.subscription_id.is_none());

        let sweep = queue.apply_due(datetime!(2024-06-05 03:00 UTC)).await.unwrap();
        assert_eq!(sweep.activated, 1);

        let sub = store.find_live_subscription(user_id).await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.billing_cycle_anchor_day, 5);
        assert_eq!(sub.end_date, date!(2024 - 06 - 05));
        let user = store.get_user(user_id).await.unwrap().unwrap();
        assert_eq!(user.billing_status, Some(SubscriptionStatus::Active));
    }

    #[tokio::test]
    async fn test_past_effective_date_is_rejected() {
        let (_, queue, user_id, monthly, _) = setup().await;
        let err = queue
            .request_change(
                user_id,
                monthly.id,
                None,
                Some(date!(2024 - 05 - 01)),
                datetime!(2024-06-01 10:00 UTC),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
