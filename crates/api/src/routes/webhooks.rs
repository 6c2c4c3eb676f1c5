//! Stripe webhook endpoint

use agency_billing::{BillingError, DispatchOutcome};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// Verify, log and dispatch a Stripe event.
///
/// - 200 once the event is applied, already applied, or deliberately ignored
/// - 400 for a bad signature or unparseable payload (nothing is written)
/// - 500 for failures Stripe should retry
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let webhooks = &state.billing.webhooks;
    let envelope = match webhooks.verify_event(&body, signature) {
        Ok(envelope) => envelope,
        Err(e) => return rejection(&e),
    };

    match webhooks.handle_event(&envelope).await {
        Ok(outcome) => {
            let status = match &outcome {
                DispatchOutcome::Applied => "applied",
                DispatchOutcome::NoOp => "no_op",
                DispatchOutcome::Ignored(_) => "ignored",
                DispatchOutcome::Duplicate => "duplicate",
            };
            (
                StatusCode::OK,
                Json(json!({ "received": true, "status": status })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                error = %e,
                "Webhook failed, asking Stripe to retry"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Webhook processing failed", "code": 500 })),
            )
                .into_response()
        }
    }
}

fn rejection(err: &BillingError) -> Response {
    let message = match err {
        BillingError::WebhookSignatureInvalid => "Invalid signature",
        _ => "Invalid payload",
    };
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message, "code": 400 })),
    )
        .into_response()
}
