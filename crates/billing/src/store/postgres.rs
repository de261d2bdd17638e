//! PostgreSQL [`BillingStore`].
//!
//! Transitions run in one transaction: the subscription row is locked with
//! `FOR UPDATE`, the invoice is moved with a conditional
//! `UPDATE ... WHERE status = 'PENDING'`, and the member's `billing_status` is
//! rewritten before commit.
//!
//! Lock order is subscription, then invoice, then member. Every transition
//! that touches more than one of them takes the locks in that order.

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use gymflow_shared::{ChangeRequestId, InvoiceId, PlanId, SubscriptionId, UserId};

use super::{counter_coverage_end, AppliedChange, BillingStore, QueuedWebhook, Settlement};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingUser, Invoice, PaymentMethod, Plan, Subscription, SubscriptionChangeRequest,
};
use crate::state_machine;

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, cadence, billing_cycle_anchor_day, \
     auto_renew, status, start_date, end_date, created_at, updated_at";

const INVOICE_COLUMNS: &str = "id, user_id, subscription_id, plan_id, amount_cents, currency, \
     status, idempotency_key, gateway_payment_id, attempt_count, last_attempt_at, \
     last_failure_reason, paid_at, created_at";

const CHANGE_REQUEST_COLUMNS: &str = "id, user_id, subscription_id, new_plan_id, new_auto_renew, \
     status, effective_at, created_at, applied_at";

/// Billing store backed by PostgreSQL
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Transaction helpers
// =============================================================================

/// Serialize per-member writes (checkout, counter payments, deferred activation)
async fn lock_user(conn: &mut PgConnection, user_id: UserId) -> BillingResult<()> {
    let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?;
    found
        .map(|_| ())
        .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))
}

async fn lock_subscription(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
) -> BillingResult<Option<Subscription>> {
    let sub = sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 FOR UPDATE"
    ))
    .bind(subscription_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(sub)
}

/// Lock the subscription an invoice is billed against, before the invoice row
async fn lock_invoice_subscription(
    conn: &mut PgConnection,
    invoice_id: InvoiceId,
) -> BillingResult<Option<Subscription>> {
    let owner: Option<(Option<SubscriptionId>,)> =
        sqlx::query_as("SELECT subscription_id FROM invoices WHERE id = $1")
            .bind(invoice_id)
            .fetch_optional(&mut *conn)
            .await?;
    match owner {
        Some((Some(subscription_id),)) => lock_subscription(conn, subscription_id).await,
        _ => Ok(None),
    }
}

async fn live_subscription(
    conn: &mut PgConnection,
    user_id: UserId,
) -> BillingResult<Option<Subscription>> {
    let sub = sqlx::query_as::<_, Subscription>(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
         WHERE user_id = $1 AND status <> 'CANCELLED' \
         ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(sub)
}

/// Write the subscription row and mirror its status onto the member
async fn save_subscription(conn: &mut PgConnection, sub: &Subscription) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE subscriptions
        SET plan_id = $2, cadence = $3, billing_cycle_anchor_day = $4, auto_renew = $5,
            status = $6, start_date = $7, end_date = $8, updated_at = $9
        WHERE id = $1
        "#,
    )
    .bind(sub.id)
    .bind(sub.plan_id)
    .bind(sub.cadence)
    .bind(sub.billing_cycle_anchor_day)
    .bind(sub.auto_renew)
    .bind(sub.status)
    .bind(sub.start_date)
    .bind(sub.end_date)
    .bind(sub.updated_at)
    .execute(&mut *conn)
    .await?;

    mirror_status(conn, sub).await
}

async fn mirror_status(conn: &mut PgConnection, sub: &Subscription) -> BillingResult<()> {
    sqlx::query("UPDATE users SET billing_status = $2, updated_at = $3 WHERE id = $1")
        .bind(sub.user_id)
        .bind(sub.status)
        .bind(sub.updated_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_subscription_row(conn: &mut PgConnection, sub: &Subscription) -> BillingResult<()> {
    sqlx::query(&format!(
        "INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
    ))
    .bind(sub.id)
    .bind(sub.user_id)
    .bind(sub.plan_id)
    .bind(sub.cadence)
    .bind(sub.billing_cycle_anchor_day)
    .bind(sub.auto_renew)
    .bind(sub.status)
    .bind(sub.start_date)
    .bind(sub.end_date)
    .bind(sub.created_at)
    .bind(sub.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_invoice_row(conn: &mut PgConnection, invoice: &Invoice) -> BillingResult<()> {
    sqlx::query(&format!(
        "INSERT INTO invoices ({INVOICE_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
    ))
    .bind(invoice.id)
    .bind(invoice.user_id)
    .bind(invoice.subscription_id)
    .bind(invoice.plan_id)
    .bind(invoice.amount_cents)
    .bind(&invoice.currency)
    .bind(invoice.status)
    .bind(&invoice.idempotency_key)
    .bind(&invoice.gateway_payment_id)
    .bind(invoice.attempt_count)
    .bind(invoice.last_attempt_at)
    .bind(&invoice.last_failure_reason)
    .bind(invoice.paid_at)
    .bind(invoice.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn void_pending_invoices(
    conn: &mut PgConnection,
    subscription_id: SubscriptionId,
) -> BillingResult<()> {
    sqlx::query(
        "UPDATE invoices SET status = 'VOIDED' WHERE subscription_id = $1 AND status = 'PENDING'",
    )
    .bind(subscription_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_user(&self, user_id: UserId) -> BillingResult<Option<BillingUser>> {
        let user = sqlx::query_as::<_, BillingUser>(
            "SELECT id, email, billing_status FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn get_plan(&self, plan_id: PlanId) -> BillingResult<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            "SELECT id, name, cadence, price_cents, currency, active FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn get_payment_method(&self, user_id: UserId) -> BillingResult<Option<PaymentMethod>> {
        let method = sqlx::query_as::<_, PaymentMethod>(
            "SELECT user_id, gateway_customer_id, vaulted_card_ref, updated_at \
             FROM payment_methods WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(method)
    }

    async fn upsert_payment_method(&self, method: &PaymentMethod) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_methods (user_id, gateway_customer_id, vaulted_card_ref, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET gateway_customer_id = EXCLUDED.gateway_customer_id,
                vaulted_card_ref = EXCLUDED.vaulted_card_ref,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(method.user_id)
        .bind(&method.gateway_customer_id)
        .bind(&method.vaulted_card_ref)
        .bind(method.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<Subscription>> {
        let sub = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn find_live_subscription(&self, user_id: UserId) -> BillingResult<Option<Subscription>> {
        let mut conn = self.pool.acquire().await?;
        live_subscription(&mut conn, user_id).await
    }

    async fn list_subscriptions_due(&self, today: Date) -> BillingResult<Vec<Subscription>> {
        let subs = sqlx::query_as::<_, Subscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE status IN ('ACTIVE', 'PENDING_CANCELLATION') AND end_date <= $1 \
             ORDER BY end_date, created_at"
        ))
        .bind(today)
        .fetch_all(&self.pool)
        .await?;
        Ok(subs)
    }

    async fn create_subscription_with_invoice(
        &self,
        subscription: &Subscription,
        invoice: &Invoice,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        lock_user(&mut tx, subscription.user_id).await?;
        if live_subscription(&mut tx, subscription.user_id)
            .await?
            .is_some()
        {
            return Err(BillingError::Conflict(
                "member already has a subscription".to_string(),
            ));
        }

        insert_subscription_row(&mut tx, subscription).await?;
        insert_invoice_row(&mut tx, invoice).await?;
        mirror_status(&mut tx, subscription).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cancel_subscription(
        &self,
        subscription_id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let mut sub = lock_subscription(&mut tx, subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))?;

        state_machine::cancel_subscription(&mut sub, now)
            .map_err(|e| BillingError::Validation(e.to_string()))?;
        void_pending_invoices(&mut tx, subscription_id).await?;
        save_subscription(&mut tx, &sub).await?;

        tx.commit().await?;
        Ok(sub)
    }

    async fn close_lapsed_subscription(
        &self,
        subscription_id: SubscriptionId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;

        let Some(mut sub) = lock_subscription(&mut tx, subscription_id).await? else {
            return Ok(None);
        };
        if !state_machine::close_lapsed(&mut sub, now.date(), now) {
            return Ok(None);
        }
        void_pending_invoices(&mut tx, subscription_id).await?;
        save_subscription(&mut tx, &sub).await?;

        tx.commit().await?;
        Ok(Some(sub))
    }

    async fn get_invoice(&self, invoice_id: InvoiceId) -> BillingResult<Option<Invoice>> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    async fn find_invoice_by_gateway_payment(
        &self,
        gateway_payment_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE gateway_payment_id = $1 \
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(gateway_payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    async fn find_pending_invoice(
        &self,
        subscription_id: SubscriptionId,
    ) -> BillingResult<Option<Invoice>> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE subscription_id = $1 AND status = 'PENDING'"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invoice)
    }

    async fn insert_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        // Partial unique index turns a second PENDING invoice into 23505 -> Conflict
        let mut conn = self.pool.acquire().await?;
        insert_invoice_row(&mut conn, invoice).await
    }

    async fn list_pending_subscription_invoices(&self) -> BillingResult<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE status = 'PENDING' AND subscription_id IS NOT NULL \
             ORDER BY created_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    async fn list_invoices_for_user(
        &self,
        user_id: UserId,
        limit: i64,
    ) -> BillingResult<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(invoices)
    }

    async fn insert_counter_payment(
        &self,
        invoice: &Invoice,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        lock_user(&mut tx, invoice.user_id).await?;

        if live_subscription(&mut tx, invoice.user_id)
            .await?
            .is_some_and(|s| s.status.grants_access())
        {
            return Err(BillingError::Conflict(
                "member already has an active subscription".to_string(),
            ));
        }

        let last_paid: Option<(OffsetDateTime, PlanId)> = sqlx::query_as(
            r#"
            SELECT paid_at, plan_id FROM invoices
            WHERE user_id = $1 AND subscription_id IS NULL AND status = 'PAID'
              AND paid_at IS NOT NULL
            ORDER BY paid_at DESC LIMIT 1
            "#,
        )
        .bind(invoice.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((paid_at, plan_id)) = last_paid {
            let plan = sqlx::query_as::<_, Plan>(
                "SELECT id, name, cadence, price_cents, currency, active FROM plans WHERE id = $1",
            )
            .bind(plan_id)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(plan) = plan {
                let covered_until = counter_coverage_end(&plan, paid_at);
                if now.date() < covered_until {
                    return Err(BillingError::Conflict(format!(
                        "previous counter payment covers until {}",
                        covered_until
                    )));
                }
            }
        }

        insert_invoice_row(&mut tx, invoice).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_attempt(
        &self,
        invoice_id: InvoiceId,
        gateway_payment_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE invoices
            SET attempt_count = attempt_count + 1,
                last_attempt_at = $2,
                gateway_payment_id = COALESCE($3, gateway_payment_id)
            WHERE id = $1
            "#,
        )
        .bind(invoice_id)
        .bind(now)
        .bind(gateway_payment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn settle_invoice(
        &self,
        invoice_id: InvoiceId,
        gateway_payment_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Settlement>> {
        let mut tx = self.pool.begin().await?;

        let sub = lock_invoice_subscription(&mut tx, invoice_id).await?;

        // A concurrent settler blocks on the row lock and then matches zero rows
        let Some(invoice) = sqlx::query_as::<_, Invoice>(&format!(
            "UPDATE invoices \
             SET status = 'PAID', paid_at = $2, gateway_payment_id = COALESCE($3, gateway_payment_id) \
             WHERE id = $1 AND status = 'PENDING' \
             RETURNING {INVOICE_COLUMNS}"
        ))
        .bind(invoice_id)
        .bind(now)
        .bind(gateway_payment_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        let mut settlement = Settlement {
            invoice: invoice.clone(),
            subscription: None,
            transition: None,
        };

        if let Some(mut sub) = sub {
            let transition = state_machine::apply_successful_payment(&mut sub, now);
            save_subscription(&mut tx, &sub).await?;
            settlement.subscription = Some(sub);
            settlement.transition = Some(transition);
        }

        tx.commit().await?;
        Ok(Some(settlement))
    }

    async fn record_payment_failure(
        &self,
        invoice_id: InvoiceId,
        reason: &str,
        is_fatal: bool,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;

        let sub = lock_invoice_subscription(&mut tx, invoice_id).await?;

        let updated: Option<(InvoiceId,)> = sqlx::query_as(
            r#"
            UPDATE invoices
            SET last_failure_reason = $2,
                status = CASE WHEN $3 THEN 'VOIDED' ELSE status END
            WHERE id = $1 AND status = 'PENDING'
            RETURNING id
            "#,
        )
        .bind(invoice_id)
        .bind(reason)
        .bind(is_fatal)
        .fetch_optional(&mut *tx)
        .await?;

        let (Some(_), Some(mut sub)) = (updated, sub) else {
            tx.commit().await?;
            return Ok(None);
        };
        state_machine::handle_payment_failure(&mut sub, is_fatal, now);
        save_subscription(&mut tx, &sub).await?;

        tx.commit().await?;
        Ok(Some(sub))
    }

    async fn expire_invoice(
        &self,
        invoice_id: InvoiceId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;

        let sub = lock_invoice_subscription(&mut tx, invoice_id).await?;

        let updated: Option<(InvoiceId,)> = sqlx::query_as(
            "UPDATE invoices SET status = 'EXPIRED' WHERE id = $1 AND status = 'PENDING' \
             RETURNING id",
        )
        .bind(invoice_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (Some(_), Some(mut sub)) = (updated, sub) else {
            tx.commit().await?;
            return Ok(None);
        };
        state_machine::handle_final_failure(&mut sub, now);
        save_subscription(&mut tx, &sub).await?;

        tx.commit().await?;
        Ok(Some(sub))
    }

    async fn void_checkout(
        &self,
        invoice_id: InvoiceId,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let mut tx = self.pool.begin().await?;

        let sub = lock_invoice_subscription(&mut tx, invoice_id).await?;

        let updated: Option<(InvoiceId,)> = sqlx::query_as(
            "UPDATE invoices SET status = 'VOIDED', last_failure_reason = $2 \
             WHERE id = $1 AND status = 'PENDING' RETURNING id",
        )
        .bind(invoice_id)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?;

        let (Some(_), Some(mut sub)) = (updated, sub) else {
            tx.commit().await?;
            return Ok(None);
        };
        state_machine::abandon_checkout(&mut sub, now);
        save_subscription(&mut tx, &sub).await?;

        tx.commit().await?;
        Ok(Some(sub))
    }

    async fn get_pending_change_request(
        &self,
        user_id: UserId,
    ) -> BillingResult<Option<SubscriptionChangeRequest>> {
        let request = sqlx::query_as::<_, SubscriptionChangeRequest>(&format!(
            "SELECT {CHANGE_REQUEST_COLUMNS} FROM subscription_change_requests \
             WHERE user_id = $1 AND status = 'PENDING'"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(request)
    }

    async fn insert_change_request(
        &self,
        request: &SubscriptionChangeRequest,
    ) -> BillingResult<()> {
        // uq_change_requests_one_pending_per_user enforces one PENDING per member
        sqlx::query(&format!(
            "INSERT INTO subscription_change_requests ({CHANGE_REQUEST_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.subscription_id)
        .bind(request.new_plan_id)
        .bind(request.new_auto_renew)
        .bind(request.status)
        .bind(request.effective_at)
        .bind(request.created_at)
        .bind(request.applied_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_due_change_requests(
        &self,
        today: Date,
    ) -> BillingResult<Vec<SubscriptionChangeRequest>> {
        let requests = sqlx::query_as::<_, SubscriptionChangeRequest>(&format!(
            "SELECT {CHANGE_REQUEST_COLUMNS} FROM subscription_change_requests \
             WHERE status = 'PENDING' AND effective_at <= $1 ORDER BY created_at"
        ))
        .bind(today)
        .fetch_all(&self.pool)
        .await?;
        Ok(requests)
    }

    async fn apply_change_request(
        &self,
        request_id: ChangeRequestId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<AppliedChange>> {
        let mut tx = self.pool.begin().await?;

        let Some(mut request) = sqlx::query_as::<_, SubscriptionChangeRequest>(&format!(
            "SELECT {CHANGE_REQUEST_COLUMNS} FROM subscription_change_requests \
             WHERE id = $1 AND status = 'PENDING' FOR UPDATE"
        ))
        .bind(request_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(None);
        };

        let plan = sqlx::query_as::<_, Plan>(
            "SELECT id, name, cadence, price_cents, currency, active FROM plans WHERE id = $1",
        )
        .bind(request.new_plan_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("plan {}", request.new_plan_id)))?;

        let target = match request.subscription_id {
            Some(id) => lock_subscription(&mut tx, id).await?,
            None => {
                lock_user(&mut tx, request.user_id).await?;
                live_subscription(&mut tx, request.user_id).await?
            }
        };

        let (subscription, created) = match target {
            Some(mut sub) => {
                state_machine::apply_plan_change(&mut sub, &plan, request.new_auto_renew, now);
                save_subscription(&mut tx, &sub).await?;
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
                insert_subscription_row(&mut tx, &sub).await?;
                mirror_status(&mut tx, &sub).await?;
                (sub, true)
            }
        };

        request.subscription_id = Some(subscription.id);
        request.status = crate::models::ChangeRequestStatus::Applied;
        request.applied_at = Some(now);

        sqlx::query(
            "UPDATE subscription_change_requests \
             SET subscription_id = $2, status = 'APPLIED', applied_at = $3 WHERE id = $1",
        )
        .bind(request.id)
        .bind(request.subscription_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
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
        let (id,): (Uuid,) = sqlx::query_as(
            "INSERT INTO webhook_processing_queue (webhook_type, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(webhook_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim_webhooks(&self, limit: i64) -> BillingResult<Vec<QueuedWebhook>> {
        let rows: Vec<(Uuid, String, serde_json::Value, i32, i32)> = sqlx::query_as(
            r#"
            UPDATE webhook_processing_queue
            SET status = 'processing', last_attempt_at = NOW(), attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM webhook_processing_queue
                WHERE (status = 'pending' OR (status = 'failed' AND attempts < max_attempts))
                  AND (last_attempt_at IS NULL OR last_attempt_at < NOW() - INTERVAL '5 minutes')
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, webhook_type, payload, attempts, max_attempts
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, webhook_type, payload, attempts, max_attempts)| QueuedWebhook {
                    id,
                    webhook_type,
                    payload,
                    attempts,
                    max_attempts,
                },
            )
            .collect())
    }

    async fn complete_webhook(&self, id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_processing_queue SET status = 'completed', processed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_webhook(&self, id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_processing_queue
            SET status = 'failed',
                last_error = $2,
                processed_at = CASE WHEN attempts >= max_attempts THEN NOW() ELSE NULL END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_webhooks(&self, retention_days: i32) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_processing_queue
            WHERE processed_at < NOW() - make_interval(days => $1)
              AND status IN ('completed', 'failed')
            "#,
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
