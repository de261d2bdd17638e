//! Billing error types

use thiserror::Error;

use gymflow_shared::GymError;

/// Billing-specific errors
///
/// `Validation`, `Conflict` and `NotFound` are caller mistakes and propagate
/// synchronously. Gateway trouble is normally folded into a `ChargeOutcome`
/// long before it could surface as `Gateway`; the variant only escapes from
/// operations that have no subscription state to fall back on (vaulting a
/// card, fetching a payment for reconciliation).
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payment method required for this operation")]
    PaymentMethodRequired,

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// True for errors caused by the caller's request rather than by the system
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BillingError::Validation(_)
                | BillingError::Conflict(_)
                | BillingError::NotFound(_)
                | BillingError::PaymentMethodRequired
                | BillingError::WebhookSignatureInvalid
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            // PostgreSQL unique violation: one pending invoice / change request, unique keys
            if db_err.code().as_deref() == Some("23505") {
                return BillingError::Conflict(db_err.message().to_string());
            }
        }
        BillingError::Database(err.to_string())
    }
}

impl From<BillingError> for GymError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::Validation(msg) => GymError::Validation(msg),
            BillingError::Conflict(msg) => GymError::Conflict(msg),
            BillingError::NotFound(msg) => GymError::NotFound(msg),
            BillingError::Database(msg) => GymError::Database(msg),
            other => GymError::Billing(other.to_string()),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors() {
        assert!(BillingError::Conflict("x".into()).is_client_error());
        assert!(BillingError::PaymentMethodRequired.is_client_error());
        assert!(!BillingError::Gateway("timeout".into()).is_client_error());
        assert!(!BillingError::Database("down".into()).is_client_error());
    }

    #[test]
    fn test_conversion_to_shared_error() {
        let shared: GymError = BillingError::Conflict("pending change exists".into()).into();
        assert!(matches!(shared, GymError::Conflict(_)));

        let shared: GymError = BillingError::Gateway("503".into()).into();
        assert!(matches!(shared, GymError::Billing(_)));

        let shared: GymError = BillingError::PaymentMethodRequired.into();
        assert!(matches!(shared, GymError::Billing(ref msg) if msg.contains("Payment method required")));
    }
}
