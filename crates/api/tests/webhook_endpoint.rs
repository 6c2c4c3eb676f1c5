#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! HTTP-level tests for the webhook endpoint and billing routes, running the
//! full router over the in-memory billing store.

use agency_api::{auth::JwtManager, create_router, AppState};
use agency_billing::signature::sign_payload;
use agency_billing::testing::{TestHarness, TEST_WEBHOOK_SECRET};
use agency_billing::{BillingStore, OrderStatus, Project, ProcessingResult};
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

const JWT_SECRET: &str = "test-jwt-secret-key-for-testing-only";

fn app(harness: &TestHarness) -> Router {
    create_router(AppState::with_billing(harness.service.clone(), JWT_SECRET))
}

fn bearer(user: Uuid, role: &str) -> String {
    let token = JwtManager::new(JWT_SECRET)
        .issue(user, "a@x.com", role, time::Duration::hours(1))
        .unwrap();
    format!("Bearer {}", token)
}

fn signed_webhook(body: &Value, secret: &str) -> Request<Body> {
    let raw = serde_json::to_vec(body).unwrap();
    let signature = sign_payload(&raw, secret, OffsetDateTime::now_utc().unix_timestamp()).unwrap();
    Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("stripe-signature", signature)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(raw))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn completed_event(event_id: &str, session_id: &str) -> Value {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": 1_735_689_600,
        "data": { "object": {
            "id": session_id,
            "mode": "payment",
            "payment_status": "paid",
            "payment_intent": "pi_1",
            "customer": "cus_1"
        }}
    })
}

async fn start_checkout(app: &Router, user: Uuid) -> Value {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/checkout")
                .header(header::AUTHORIZATION, bearer(user, "client"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "product_type": "website" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await
}

#[tokio::test]
async fn test_health() {
    let harness = TestHarness::new();
    let response = app(&harness)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_bad_signature_is_rejected_before_any_write() {
    let harness = TestHarness::new();
    let response = app(&harness)
        .oneshot(signed_webhook(&completed_event("evt_1", "cs_x"), "whsec_wrong"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(harness
        .store
        .list_webhook_events(None, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_missing_signature_is_rejected() {
    let harness = TestHarness::new();
    let response = app(&harness)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .body(Body::from(completed_event("evt_1", "cs_x").to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_checkout_then_duplicate_webhook_fulfills_once() {
    let harness = TestHarness::new();
    let app = app(&harness);
    let user = Uuid::new_v4();

    let checkout = start_checkout(&app, user).await;
    let session_id = checkout["session_id"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(signed_webhook(
                &completed_event("evt_1", &session_id),
                TEST_WEBHOOK_SECRET,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["received"], json!(true));
    }

    let orders = harness.store.orders().await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Paid);
    assert_eq!(harness.store.roles().await.len(), 1);
    assert_eq!(harness.notifier.delivered().len(), 1);
}

#[tokio::test]
async fn test_missing_order_returns_500_for_retry() {
    let harness = TestHarness::new();
    let response = app(&harness)
        .oneshot(signed_webhook(
            &completed_event("evt_1", "cs_unknown"),
            TEST_WEBHOOK_SECRET,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let logged = harness.store.get_webhook_event("evt_1").await.unwrap().unwrap();
    assert_eq!(logged.processing_result, ProcessingResult::Error);
}

#[tokio::test]
async fn test_unknown_event_type_is_acknowledged() {
    let harness = TestHarness::new();
    let event = json!({
        "id": "evt_9",
        "type": "payout.paid",
        "created": 1_735_689_600,
        "data": { "object": { "id": "po_1" } }
    });
    let response = app(&harness)
        .oneshot(signed_webhook(&event, TEST_WEBHOOK_SECRET))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], json!("ignored"));
}

#[tokio::test]
async fn test_order_cancellation_rules() {
    let harness = TestHarness::new();
    let app = app(&harness);
    let owner = Uuid::new_v4();
    let checkout = start_checkout(&app, owner).await;
    let order_id = checkout["order_id"].as_str().unwrap().to_string();

    let cancel = |user: Uuid| {
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/orders/{}", order_id))
            .header(header::AUTHORIZATION, bearer(user, "client"))
            .body(Body::empty())
            .unwrap()
    };

    let foreign = app.clone().oneshot(cancel(Uuid::new_v4())).await.unwrap();
    assert_eq!(foreign.status(), StatusCode::FORBIDDEN);

    let own = app.clone().oneshot(cancel(owner)).await.unwrap();
    assert_eq!(own.status(), StatusCode::NO_CONTENT);
    assert!(harness.store.orders().await.is_empty());

    let again = app.clone().oneshot(cancel(owner)).await.unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_setup_invoice_report_then_admin_confirm() {
    let harness = TestHarness::new();
    let app = app(&harness);
    let owner = Uuid::new_v4();
    let admin = Uuid::new_v4();
    let project = Project::new(owner, "Bakery site", "owner@bakery.test");
    harness.store.insert_project(&project).await.unwrap();

    let send = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/admin/projects/{}/setup-invoice", project.id))
                .header(header::AUTHORIZATION, bearer(admin, "admin"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({ "amount_cents": 150_000 }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(send.status(), StatusCode::OK);
    assert_eq!(json_body(send).await["setup_invoice_status"], json!("sent"));

    let report = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!(
                    "/api/projects/{}/setup-invoice/reported-paid",
                    project.id
                ))
                .header(header::AUTHORIZATION, bearer(owner, "client"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let report = json_body(report).await;
    assert_eq!(report["setup_invoice_status"], json!("needs_verification"));
    assert_eq!(report["payment_status"], json!("unpaid"));

    let client_confirm = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/admin/projects/{}/setup-invoice/confirm", project.id))
                .header(header::AUTHORIZATION, bearer(owner, "client"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(client_confirm.status(), StatusCode::FORBIDDEN);

    let confirm = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/admin/projects/{}/setup-invoice/confirm", project.id))
                .header(header::AUTHORIZATION, bearer(admin, "admin"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let confirm = json_body(confirm).await;
    assert_eq!(confirm["transitioned"], json!(true));
    assert_eq!(confirm["project"]["payment_status"], json!("paid"));
}

#[tokio::test]
async fn test_admin_lists_failed_webhooks() {
    let harness = TestHarness::new();
    let app = app(&harness);
    app.clone()
        .oneshot(signed_webhook(
            &completed_event("evt_1", "cs_unknown"),
            TEST_WEBHOOK_SECRET,
        ))
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/admin/webhooks?status=error")
                .header(header::AUTHORIZATION, bearer(Uuid::new_v4(), "admin"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["events"].as_array().unwrap().len(), 1);
    assert_eq!(body["events"][0]["stripe_event_id"], json!("evt_1"));
}

#[tokio::test]
async fn test_invariants_unavailable_without_postgres() {
    let harness = TestHarness::new();
    let response = app(&harness)
        .oneshot(
            Request::builder()
                .uri("/admin/billing/invariants")
                .header(header::AUTHORIZATION, bearer(Uuid::new_v4(), "admin"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
