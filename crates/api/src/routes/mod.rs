//! HTTP routes

pub mod admin;
pub mod portal;
pub mod webhooks;

use axum::{
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_admin, require_auth},
    state::AppState,
};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    let portal_routes = Router::new()
        .route("/api/checkout", post(portal::start_checkout))
        .route("/api/orders/{id}", delete(portal::cancel_order))
        .route("/api/subscription", get(portal::get_subscription))
        .route(
            "/api/projects/{id}/setup-invoice/reported-paid",
            post(portal::report_setup_invoice_paid),
        )
        .layer(middleware::from_fn_with_state(auth_state.clone(), require_auth));

    let admin_routes = Router::new()
        .route(
            "/admin/projects/{id}/setup-invoice",
            post(admin::send_setup_invoice),
        )
        .route(
            "/admin/projects/{id}/setup-invoice/confirm",
            post(admin::confirm_setup_invoice),
        )
        .route(
            "/admin/subscriptions/{id}/cancel",
            post(admin::cancel_subscription),
        )
        .route("/admin/webhooks", get(admin::list_webhooks))
        .route(
            "/admin/webhooks/{event_id}/replay",
            post(admin::replay_webhook),
        )
        .route("/admin/billing/invariants", get(admin::check_billing_invariants))
        .layer(middleware::from_fn_with_state(auth_state, require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhooks::stripe_webhook))
        .merge(portal_routes)
        .merge(admin_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
