//! Client portal billing routes
//!
//! Every route runs behind `require_auth`; the user id always comes from the
//! token, never from the request body.

use agency_billing::{CheckoutRequest, CheckoutResponse, Project, Subscription};
use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

// =============================================================================
// Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub subscription_id: String,
    pub status: String,
    pub price_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
}

impl From<Subscription> for SubscriptionResponse {
    fn from(sub: Subscription) -> Self {
        Self {
            subscription_id: sub.external_subscription_id,
            status: sub.status.to_string(),
            price_id: sub.price_id,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
            cancel_at: sub.cancel_at,
        }
    }
}

/// Billing view of a project
#[derive(Debug, Serialize)]
pub struct ProjectBillingResponse {
    pub project_id: Uuid,
    pub payment_status: String,
    pub setup_invoice_status: String,
    pub setup_invoice_paid: bool,
    pub setup_invoice_url: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

impl From<Project> for ProjectBillingResponse {
    fn from(project: Project) -> Self {
        Self {
            project_id: project.id,
            payment_status: project.payment_status.as_str().to_string(),
            setup_invoice_status: project.setup_invoice.status.to_string(),
            setup_invoice_paid: project.setup_invoice.paid,
            setup_invoice_url: project.setup_invoice.url,
            paid_at: project.paid_at,
        }
    }
}

// =============================================================================
// Checkout
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct StartCheckoutRequest {
    pub product_type: String,
    pub project_id: Option<Uuid>,
    pub name: Option<String>,
}

/// Start a one-time checkout for a catalog product
pub async fn start_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<StartCheckoutRequest>,
) -> ApiResult<(StatusCode, Json<CheckoutResponse>)> {
    let response = state
        .billing
        .checkout
        .start_checkout(CheckoutRequest {
            user_id: auth_user.user_id,
            email: auth_user.email,
            name: req.name,
            product_type: req.product_type,
            project_id: req.project_id,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(response)))
}

/// Cancel one of the caller's pending orders
pub async fn cancel_order(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .billing
        .orders
        .cancel_own_order(order_id, auth_user.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Subscription
// =============================================================================

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Option<SubscriptionResponse>>> {
    let subscription = state
        .billing
        .subscriptions
        .get_active_subscription(auth_user.user_id)
        .await?;
    Ok(Json(subscription.map(SubscriptionResponse::from)))
}

// =============================================================================
// Setup Invoice
// =============================================================================

/// Client reports having paid the setup invoice. Advisory only: an admin
/// or Stripe still has to confirm the payment.
pub async fn report_setup_invoice_paid(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<ProjectBillingResponse>> {
    let project = state
        .billing
        .setup_invoices
        .report_paid_by_client(project_id, auth_user.user_id)
        .await?;

    tracing::info!(
        project_id = %project_id,
        user_id = %auth_user.user_id,
        "Client reported setup invoice paid"
    );

    Ok(Json(project.into()))
}
