//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook payload invalid: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Order already exists for checkout session {0}")]
    OrderAlreadyExists(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Notification delivery failed: {0}")]
    Notification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether a webhook handler failing with this error should be retried by
    /// the processor (surfaced as 5xx) rather than acknowledged.
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::WebhookSignatureInvalid
            | BillingError::WebhookPayloadInvalid(_)
            | BillingError::PermissionDenied(_)
            | BillingError::InvalidInput(_)
            | BillingError::InvalidState(_)
            | BillingError::OrderAlreadyExists(_) => false,

            // A missing order for a session we created means an upstream write
            // was lost; keep the event alive until someone reconciles it.
            BillingError::OrderNotFound(_) => true,

            BillingError::SubscriptionNotFound(_)
            | BillingError::ProjectNotFound(_)
            | BillingError::CustomerNotFound(_)
            | BillingError::NotFound(_) => false,

            BillingError::StripeApi(_)
            | BillingError::Database(_)
            | BillingError::Notification(_)
            | BillingError::Config(_)
            | BillingError::Internal(_) => true,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::WebhookPayloadInvalid(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_and_payload_errors_are_not_retryable() {
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
        assert!(!BillingError::WebhookPayloadInvalid("bad".into()).is_retryable());
    }

    #[test]
    fn test_missing_order_is_loud() {
        assert!(BillingError::OrderNotFound("cs_test".into()).is_retryable());
    }

    #[test]
    fn test_infrastructure_errors_are_retryable() {
        assert!(BillingError::Database("timeout".into()).is_retryable());
        assert!(BillingError::StripeApi("502".into()).is_retryable());
    }
}
