//! Admin billing routes
//!
//! These routes are protected by `require_admin`.

use agency_billing::{ProcessingResult, WebhookEventRecord, WebhookReplayResult};
use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::portal::{ProjectBillingResponse, SubscriptionResponse};
use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_WEBHOOK_LIST_LIMIT: i64 = 50;
const MAX_WEBHOOK_LIST_LIMIT: i64 = 200;

// =============================================================================
// Setup Invoices
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SendSetupInvoiceRequest {
    pub amount_cents: i64,
    pub description: Option<String>,
}

/// Create and send a setup invoice, replacing any outstanding one
pub async fn send_setup_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(project_id): Path<Uuid>,
    Json(req): Json<SendSetupInvoiceRequest>,
) -> ApiResult<Json<ProjectBillingResponse>> {
    tracing::info!(
        admin_id = %auth_user.user_id,
        project_id = %project_id,
        amount_cents = req.amount_cents,
        "Admin sending setup invoice"
    );

    let project = state
        .billing
        .setup_invoices
        .create_and_send(project_id, req.amount_cents, req.description.as_deref())
        .await?;
    Ok(Json(project.into()))
}

#[derive(Debug, Serialize)]
pub struct ConfirmSetupInvoiceResponse {
    pub transitioned: bool,
    pub project: ProjectBillingResponse,
}

/// Manually confirm a setup invoice as paid
pub async fn confirm_setup_invoice(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<ConfirmSetupInvoiceResponse>> {
    tracing::info!(
        admin_id = %auth_user.user_id,
        project_id = %project_id,
        "Admin confirming setup invoice payment"
    );

    let transition = state
        .billing
        .setup_invoices
        .confirm_paid_by_admin(project_id)
        .await?;
    let transitioned = transition.transitioned();
    Ok(Json(ConfirmSetupInvoiceResponse {
        transitioned,
        project: transition.project().clone().into(),
    }))
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Cancel a subscription at Stripe immediately
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(subscription_id): Path<String>,
) -> ApiResult<Json<SubscriptionResponse>> {
    tracing::info!(
        admin_id = %auth_user.user_id,
        subscription_id = %subscription_id,
        "Admin canceling subscription"
    );

    let subscription = state
        .billing
        .subscriptions
        .cancel_subscription(&subscription_id)
        .await?;
    Ok(Json(subscription.into()))
}

// =============================================================================
// Webhook Log
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct WebhookListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct WebhookEventResponse {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub processing_result: ProcessingResult,
    pub error_message: Option<String>,
    pub replay_attempts: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<WebhookEventRecord> for WebhookEventResponse {
    fn from(record: WebhookEventRecord) -> Self {
        Self {
            id: record.id,
            stripe_event_id: record.external_event_id,
            event_type: record.event_type,
            processing_result: record.processing_result,
            error_message: record.error_message,
            replay_attempts: record.replay_attempts,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookListResponse {
    pub events: Vec<WebhookEventResponse>,
}

/// List logged webhook events, newest first
pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<WebhookListQuery>,
) -> ApiResult<Json<WebhookListResponse>> {
    let status = query
        .status
        .as_deref()
        .map(ProcessingResult::parse)
        .transpose()?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_WEBHOOK_LIST_LIMIT)
        .clamp(1, MAX_WEBHOOK_LIST_LIMIT);

    let events = state.billing.webhooks.list_webhooks(status, limit).await?;
    Ok(Json(WebhookListResponse {
        events: events.into_iter().map(WebhookEventResponse::from).collect(),
    }))
}

/// Replay a stored event from its payload
pub async fn replay_webhook(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(event_id): Path<String>,
) -> ApiResult<Json<WebhookReplayResult>> {
    tracing::info!(
        admin_id = %auth_user.user_id,
        stripe_event_id = %event_id,
        "Admin replaying webhook event"
    );

    let result = state.billing.webhooks.replay_webhook(&event_id).await?;
    Ok(Json(result))
}

// =============================================================================
// Billing Invariants
// =============================================================================

#[derive(Debug, Serialize)]
pub struct BillingInvariantsResponse {
    pub healthy: bool,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolationResponse>,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct InvariantViolationResponse {
    pub invariant: String,
    pub severity: String,
    pub description: String,
    pub entity_ids: Vec<String>,
    pub context: serde_json::Value,
}

/// Run all billing invariant checks
pub async fn check_billing_invariants(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<BillingInvariantsResponse>> {
    let checker = state
        .invariants
        .as_ref()
        .ok_or(ApiError::ServiceUnavailable)?;

    let req_id = Uuid::new_v4();
    tracing::info!(%req_id, admin_id = %auth_user.user_id, "Admin checking billing invariants");

    let summary = checker.run_all_checks().await.map_err(|e| {
        tracing::error!(%req_id, error = %e, "Failed to run invariant checks");
        ApiError::Internal
    })?;

    let violations = summary
        .violations
        .into_iter()
        .map(|v| InvariantViolationResponse {
            invariant: v.invariant,
            severity: v.severity.to_string(),
            description: v.description,
            entity_ids: v.entity_ids,
            context: v.context,
        })
        .collect();

    Ok(Json(BillingInvariantsResponse {
        healthy: summary.healthy,
        checks_run: summary.checks_run,
        checks_passed: summary.checks_passed,
        checks_failed: summary.checks_failed,
        violations,
        checked_at: summary.checked_at,
    }))
}
