//! Webhook Queue Processor
//!
//! Drains gateway notifications from the persistent queue with retry logic.
//! Each notification names a payment; the reconciler re-fetches it from the
//! gateway and applies the transition.

use serde_json::Value;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use gymflow_billing::webhook::PAYMENT_UPDATED;
use gymflow_billing::{
    BillingError, BillingResult, BillingStore, QueuedWebhook, ReconcileOutcome, WebhookReconciler,
};

/// Counts from one drain pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
}

/// Process pending notifications from the queue
pub async fn process_webhook_queue(
    store: &dyn BillingStore,
    reconciler: &WebhookReconciler,
    batch_size: i64,
    now: OffsetDateTime,
) -> DrainReport {
    let mut report = DrainReport::default();

    // Pending, or failed with retries remaining and past the back-off
    let webhooks = match store.claim_webhooks(batch_size).await {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "Failed to fetch webhooks from queue");
            return report;
        }
    };

    if webhooks.is_empty() {
        return report;
    }

    info!(count = webhooks.len(), "Processing webhooks from queue");

    for webhook in webhooks {
        let result = match webhook.webhook_type.as_str() {
            PAYMENT_UPDATED => process_payment_webhook(reconciler, &webhook.payload, now)
                .await
                .map(Some),
            _ => {
                warn!(webhook_type = %webhook.webhook_type, "Unknown webhook type");
                Ok(None) // Don't retry unknown types
            }
        };

        match result {
            Ok(outcome) => {
                if let Err(e) = store.complete_webhook(webhook.id).await {
                    error!(queue_id = %webhook.id, error = %e, "Failed to mark webhook as completed");
                }
                report.processed += 1;
                info!(
                    queue_id = %webhook.id,
                    webhook_type = %webhook.webhook_type,
                    outcome = ?outcome,
                    "Webhook processed successfully"
                );
            }
            Err(e) => {
                report.failed += 1;
                record_failure(store, &webhook, &e.to_string()).await;
            }
        }
    }

    report
}

async fn record_failure(store: &dyn BillingStore, webhook: &QueuedWebhook, error_msg: &str) {
    if let Err(e) = store.fail_webhook(webhook.id, error_msg).await {
        error!(queue_id = %webhook.id, error = %e, "Failed to mark webhook as failed");
    }

    // Attempts were counted when the row was claimed
    if webhook.attempts >= webhook.max_attempts {
        error!(
            queue_id = %webhook.id,
            webhook_type = %webhook.webhook_type,
            attempts = webhook.attempts,
            error = %error_msg,
            "Webhook permanently failed after max retries"
        );
    } else {
        warn!(
            queue_id = %webhook.id,
            webhook_type = %webhook.webhook_type,
            attempts = webhook.attempts,
            max_attempts = webhook.max_attempts,
            error = %error_msg,
            "Webhook processing failed, will retry"
        );
    }
}

/// Reconcile the payment named by a queued notification
async fn process_payment_webhook(
    reconciler: &WebhookReconciler,
    payload: &Value,
    now: OffsetDateTime,
) -> BillingResult<ReconcileOutcome> {
    let payment_id = payload
        .get("payment_id")
        .and_then(Value::as_str)
        .ok_or_else(|| BillingError::Validation("notification without payment_id".to_string()))?;

    reconciler.sync_payment_status(payment_id, now).await
}

/// Cleanup old completed/failed webhooks (for maintenance job)
pub async fn cleanup_old_webhooks(store: &dyn BillingStore, retention_days: i32) {
    match store.prune_webhooks(retention_days).await {
        Ok(deleted) => {
            if deleted > 0 {
                info!(
                    deleted = deleted,
                    retention_days = retention_days,
                    "Cleaned up old webhook queue entries"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to cleanup old webhooks");
        }
    }
}
