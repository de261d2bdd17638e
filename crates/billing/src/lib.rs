//! GymFlow Billing Engine
//!
//! Recurring membership billing: anchor-day date math, the subscription state
//! machine, invoice ledger with idempotent charging, the daily billing cycle,
//! scheduled plan changes and webhook reconciliation.
//!
//! Persistence goes through [`BillingStore`] and the payment provider through
//! [`PaymentGateway`]; [`BillingEngine`] wires the services over one of each.

pub mod anchor;
pub mod change_request;
pub mod client;
pub mod cycle;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod payments;
pub mod reconciler;
pub mod state_machine;
pub mod store;
pub mod subscription;
pub mod webhook;

use std::sync::Arc;

pub use change_request::{ChangeRequestQueue, ChangeSweep};
pub use client::{StripeClient, StripeConfig};
pub use cycle::{BillingCycle, RetryPolicy, SweepReport};
pub use error::{BillingError, BillingResult};
pub use gateway::{
    ChargeOutcome, ChargeRequest, GatewayError, GatewayPayment, GatewayStatus, PaymentGateway,
    StripeGateway, VaultedCard,
};
pub use ledger::{AttemptResult, InvoiceLedger};
pub use models::*;
pub use payments::PaymentProcessor;
pub use reconciler::{ReconcileOutcome, WebhookReconciler};
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore, QueuedWebhook, Settlement};
pub use subscription::{BillingOverview, CardRegistration, CheckoutResult, SubscriptionService};
pub use webhook::{WebhookAck, WebhookIntake};

/// All billing services over one store and one gateway
#[derive(Clone)]
pub struct BillingEngine {
    pub subscriptions: SubscriptionService,
    pub cycle: BillingCycle,
    pub reconciler: WebhookReconciler,
    pub webhooks: WebhookIntake,
    store: Arc<dyn BillingStore>,
}

impl BillingEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        policy: RetryPolicy,
        webhook_secret: impl Into<String>,
    ) -> Self {
        let payments = PaymentProcessor::new(gateway.clone(), store.clone());
        let ledger = InvoiceLedger::new(store.clone(), payments.clone());
        let changes = ChangeRequestQueue::new(store.clone());

        Self {
            subscriptions: SubscriptionService::new(
                store.clone(),
                payments,
                ledger.clone(),
                changes.clone(),
            ),
            cycle: BillingCycle::new(store.clone(), ledger, changes, policy),
            reconciler: WebhookReconciler::new(store.clone(), gateway),
            webhooks: WebhookIntake::new(store.clone(), webhook_secret),
            store,
        }
    }

    /// Stripe-backed engine over Postgres, configured from the environment
    pub fn stripe_from_env(pool: sqlx::PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();
        let policy = RetryPolicy::from_env()?;

        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(StripeGateway::new(stripe)),
            policy,
            webhook_secret,
        ))
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }
}
