//! Scripted gateway for tests

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ChargeRequest, GatewayError, GatewayPayment, GatewayStatus, PaymentGateway, VaultedCard};
use crate::models::{BillingUser, PaymentMethod};

/// Replays scripted charge results in order and records every submission.
///
/// A replayed idempotency key returns the payment created for it the first
/// time. Declines create no payment and are not remembered, so a later retry
/// under the same key takes the next scripted result, as it would once the
/// gateway's key window has passed. With an empty script every charge is
/// approved.
#[derive(Default)]
pub struct MockGateway {
    script: Mutex<VecDeque<Result<GatewayStatus, GatewayError>>>,
    charges: Mutex<Vec<ChargeRequest>>,
    by_key: Mutex<HashMap<String, GatewayPayment>>,
    payments: Mutex<HashMap<String, GatewayPayment>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: Result<GatewayStatus, GatewayError>) -> &Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn approve(&self) -> &Self {
        self.push(Ok(GatewayStatus::Approved))
    }

    pub fn pend(&self) -> &Self {
        self.push(Ok(GatewayStatus::Pending))
    }

    pub fn decline(&self, reason: &str) -> &Self {
        self.push(Err(GatewayError::Declined {
            reason: reason.to_string(),
        }))
    }

    pub fn fail_transport(&self) -> &Self {
        self.push(Err(GatewayError::Transport("connection reset".to_string())))
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().unwrap().clone()
    }

    /// Payments the gateway actually created (one per idempotency key)
    pub fn created_payments(&self) -> usize {
        self.by_key.lock().unwrap().len()
    }

    /// Change what `fetch_payment` reports, as a later webhook would
    pub fn set_status(&self, external_id: &str, status: GatewayStatus, detail: Option<&str>) {
        if let Some(payment) = self.payments.lock().unwrap().get_mut(external_id) {
            payment.status = status;
            payment.status_detail = detail.map(str::to_string);
        }
    }

    /// Register a payment the engine never submitted
    pub fn insert_payment(&self, payment: GatewayPayment) {
        self.payments
            .lock()
            .unwrap()
            .insert(payment.external_id.clone(), payment);
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn submit_charge(&self, request: &ChargeRequest) -> Result<GatewayPayment, GatewayError> {
        self.charges.lock().unwrap().push(request.clone());

        if let Some(existing) = self.by_key.lock().unwrap().get(&request.idempotency_key) {
            let current = self.payments.lock().unwrap().get(&existing.external_id).cloned();
            return Ok(current.unwrap_or_else(|| existing.clone()));
        }

        let scripted = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(GatewayStatus::Approved));
        let status = scripted?;

        let payment = GatewayPayment {
            external_id: format!("pay_{}", self.by_key.lock().unwrap().len() + 1),
            status,
            status_detail: None,
            external_reference: Some(request.invoice_id.to_string()),
            amount_cents: request.amount_cents,
        };
        self.by_key
            .lock()
            .unwrap()
            .insert(request.idempotency_key.clone(), payment.clone());
        self.insert_payment(payment.clone());
        Ok(payment)
    }

    async fn fetch_payment(&self, external_id: &str) -> Result<GatewayPayment, GatewayError> {
        self.payments
            .lock()
            .unwrap()
            .get(external_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(external_id.to_string()))
    }

    async fn vault_card(
        &self,
        user: &BillingUser,
        existing: Option<&PaymentMethod>,
        card_token: &str,
    ) -> Result<VaultedCard, GatewayError> {
        if card_token.is_empty() {
            return Err(GatewayError::InvalidRequest("empty card token".to_string()));
        }
        Ok(VaultedCard {
            customer_id: existing
                .map(|m| m.gateway_customer_id.clone())
                .unwrap_or_else(|| format!("cus_{}", user.id)),
            card_ref: card_token.to_string(),
        })
    }
}
