//! API error type

use agency_billing::BillingError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Billing is not available")]
    ServiceUnavailable,
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16()
        }));
        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::OrderNotFound(m)
            | BillingError::SubscriptionNotFound(m)
            | BillingError::ProjectNotFound(m)
            | BillingError::CustomerNotFound(m)
            | BillingError::NotFound(m) => ApiError::NotFound(m),
            BillingError::PermissionDenied(_) => ApiError::Forbidden,
            BillingError::InvalidState(m) | BillingError::OrderAlreadyExists(m) => {
                ApiError::Conflict(m)
            }
            BillingError::InvalidInput(m) | BillingError::WebhookPayloadInvalid(m) => {
                ApiError::BadRequest(m)
            }
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("invalid signature".to_string())
            }
            other => {
                tracing::error!(error = %other, "Billing operation failed");
                ApiError::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_errors_map_to_statuses() {
        let cases = [
            (BillingError::OrderNotFound("x".into()), StatusCode::NOT_FOUND),
            (BillingError::PermissionDenied("x".into()), StatusCode::FORBIDDEN),
            (BillingError::InvalidState("x".into()), StatusCode::CONFLICT),
            (BillingError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::Database("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), status);
        }
    }

    #[test]
    fn test_internal_detail_is_not_exposed() {
        let api = ApiError::from(BillingError::StripeApi("sk_live_secret leaked".into()));
        assert_eq!(api.to_string(), "Internal server error");
    }
}
