//! Payment gateway port
//!
//! The engine only ever talks to a [`PaymentGateway`]. Raw gateway answers are
//! folded into a [`ChargeOutcome`] by [`ChargeOutcome::classify`]; nothing
//! downstream inspects gateway-specific status strings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use gymflow_shared::InvoiceId;

use crate::models::{BillingUser, PaymentMethod};

#[cfg(test)]
pub mod mock;
mod stripe_gateway;

pub use stripe_gateway::StripeGateway;

/// Decline reasons treated as permanent. Anything not listed here is retried.
pub const FATAL_DECLINE_REASONS: &[&str] = &[
    "merchant_blacklist",
    "fraudulent",
    "highest_risk_level",
    "incorrect_address",
];

pub fn is_fatal_reason(reason: &str) -> bool {
    FATAL_DECLINE_REASONS.contains(&reason)
}

/// One unattended charge against a vaulted card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub invoice_id: InvoiceId,
    /// The invoice's immutable key; the gateway applies the charge at most once per key
    pub idempotency_key: String,
    pub amount_cents: i64,
    pub currency: String,
    pub customer_id: String,
    pub card_ref: String,
    pub description: String,
}

/// Coarse payment status as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Approved,
    Pending,
    Rejected,
}

/// A payment as the gateway currently sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayPayment {
    pub external_id: String,
    pub status: GatewayStatus,
    /// Decline reason for rejected payments
    pub status_detail: Option<String>,
    /// Our invoice id, echoed back from the charge metadata
    pub external_reference: Option<String>,
    pub amount_cents: i64,
}

/// Card stored at the gateway for a member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultedCard {
    pub customer_id: String,
    pub card_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The issuer or the gateway's risk engine refused the charge
    #[error("payment declined: {reason}")]
    Declined { reason: String },

    /// Network failure, timeout or 5xx
    #[error("gateway unreachable: {0}")]
    Transport(String),

    #[error("payment not found: {0}")]
    NotFound(String),

    #[error("invalid gateway request: {0}")]
    InvalidRequest(String),
}

/// Classified result of a charge attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChargeOutcome {
    Approved { external_id: String },
    /// Accepted but not settled yet; a webhook will report the final state
    Pending { external_id: String },
    SoftDeclined { reason: String },
    FatalDeclined { reason: String },
    TransportError { reason: String },
}

impl ChargeOutcome {
    pub fn classify(result: Result<GatewayPayment, GatewayError>) -> Self {
        match result {
            Ok(payment) => Self::from_payment(&payment),
            Err(err) => Self::from_error(err),
        }
    }

    pub fn from_payment(payment: &GatewayPayment) -> Self {
        match payment.status {
            GatewayStatus::Approved => ChargeOutcome::Approved {
                external_id: payment.external_id.clone(),
            },
            GatewayStatus::Pending => ChargeOutcome::Pending {
                external_id: payment.external_id.clone(),
            },
            GatewayStatus::Rejected => {
                Self::declined(payment.status_detail.as_deref().unwrap_or("rejected"))
            }
        }
    }

    pub fn from_error(err: GatewayError) -> Self {
        match err {
            GatewayError::Declined { reason } => Self::declined(&reason),
            GatewayError::Transport(reason) => ChargeOutcome::TransportError { reason },
            // Not a card problem; keep the member retry-eligible
            GatewayError::NotFound(reason) | GatewayError::InvalidRequest(reason) => {
                ChargeOutcome::SoftDeclined { reason }
            }
        }
    }

    fn declined(reason: &str) -> Self {
        if is_fatal_reason(reason) {
            ChargeOutcome::FatalDeclined {
                reason: reason.to_string(),
            }
        } else {
            ChargeOutcome::SoftDeclined {
                reason: reason.to_string(),
            }
        }
    }

    /// Gateway payment id, when the gateway created one
    pub fn external_id(&self) -> Option<&str> {
        match self {
            ChargeOutcome::Approved { external_id } | ChargeOutcome::Pending { external_id } => {
                Some(external_id)
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create and confirm a charge against the member's vaulted card
    async fn submit_charge(&self, request: &ChargeRequest) -> Result<GatewayPayment, GatewayError>;

    /// Current state of a payment, for reconciliation
    async fn fetch_payment(&self, external_id: &str) -> Result<GatewayPayment, GatewayError>;

    /// Store a tokenized card for unattended charges, replacing `existing`
    async fn vault_card(
        &self,
        user: &BillingUser,
        existing: Option<&PaymentMethod>,
        card_token: &str,
    ) -> Result<VaultedCard, GatewayError>;
}
