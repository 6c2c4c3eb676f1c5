// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing Reconciliation
//!
//! End-to-end scenarios over the in-memory store, the recording provider and
//! the recording notifier:
//! - Duplicate and out-of-order webhook delivery
//! - Partial subscription updates
//! - Setup invoice verification and replacement
//! - Order cancellation rules
//! - Best-effort notification delivery

#[cfg(test)]
mod support {
    use uuid::Uuid;

    use crate::orders::{NewOrder, Order};
    use crate::testing::TestHarness;

    pub async fn pending_order(harness: &TestHarness, session_id: &str, user: Uuid) -> Order {
        harness
            .service
            .orders
            .create_pending_order(NewOrder {
                external_session_id: session_id.to_string(),
                external_customer_id: "cus_1".to_string(),
                product_type: "website".to_string(),
                amount_cents: 89_900,
                customer_email: "a@x.com".to_string(),
                customer_name: Some("Ann".to_string()),
                user_id: Some(user),
                project_id: None,
            })
            .await
            .unwrap()
    }

    pub fn paid_session(session_id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": session_id,
            "mode": "payment",
            "payment_status": "paid",
            "payment_intent": "pi_1",
            "customer": "cus_1",
            "customer_details": { "email": "a@x.com", "name": "Ann" }
        })
    }
}

#[cfg(test)]
mod order_webhook_tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::support::*;
    use crate::error::BillingError;
    use crate::orders::OrderStatus;
    use crate::store::BillingStore;
    use crate::testing::{event, TestHarness};
    use crate::webhook_types::*;
    use crate::webhooks::{DispatchOutcome, ProcessingResult};

    // =========================================================================
    // Duplicate "checkout completed" delivery pays the order exactly once
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_checkout_completed_fulfills_once() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();
        pending_order(&harness, "sess_1", user).await;

        let evt = event("evt_1", CHECKOUT_SESSION_COMPLETED, paid_session("sess_1"));
        let first = harness.service.webhooks.handle_event(&evt).await.unwrap();
        let second = harness.service.webhooks.handle_event(&evt).await.unwrap();

        assert_eq!(first, DispatchOutcome::Applied);
        assert_eq!(second, DispatchOutcome::Duplicate);

        let orders = harness.store.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Paid);
        assert_eq!(orders[0].external_payment_intent_id.as_deref(), Some("pi_1"));
        assert!(orders[0].paid_at.is_some());

        let roles = harness.store.roles().await;
        assert_eq!(roles.len(), 1);
        assert_eq!(roles.get(&user).map(String::as_str), Some("client"));

        assert_eq!(harness.store.notifications().await.len(), 1);
        assert_eq!(harness.notifier.delivered().len(), 1);
    }

    // =========================================================================
    // Handlers are idempotent without the webhook log, e.g. a redelivery
    // under a new event id
    // =========================================================================
    #[tokio::test]
    async fn test_redelivery_under_new_event_id_is_noop() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();
        pending_order(&harness, "sess_1", user).await;

        let webhooks = &harness.service.webhooks;
        webhooks
            .handle_event(&event("evt_1", CHECKOUT_SESSION_COMPLETED, paid_session("sess_1")))
            .await
            .unwrap();
        let again = webhooks
            .handle_event(&event(
                "evt_2",
                CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED,
                paid_session("sess_1"),
            ))
            .await
            .unwrap();

        assert_eq!(again, DispatchOutcome::NoOp);
        assert_eq!(harness.store.roles().await.len(), 1);
        assert_eq!(harness.store.notifications().await.len(), 1);
    }

    // =========================================================================
    // Completed-but-unpaid sessions stay pending until the async result
    // =========================================================================
    #[tokio::test]
    async fn test_unpaid_completion_leaves_order_pending() {
        let harness = TestHarness::new();
        pending_order(&harness, "sess_1", Uuid::new_v4()).await;

        let mut session = paid_session("sess_1");
        session["payment_status"] = json!("unpaid");
        let outcome = harness
            .service
            .webhooks
            .handle_event(&event("evt_1", CHECKOUT_SESSION_COMPLETED, session))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::NoOp);
        assert_eq!(harness.store.orders().await[0].status, OrderStatus::Pending);
        assert!(harness.store.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_session_fails_pending_order() {
        let harness = TestHarness::new();
        pending_order(&harness, "sess_1", Uuid::new_v4()).await;

        harness
            .service
            .webhooks
            .handle_event(&event(
                "evt_1",
                CHECKOUT_SESSION_EXPIRED,
                json!({ "id": "sess_1", "mode": "payment", "payment_status": "unpaid" }),
            ))
            .await
            .unwrap();

        assert_eq!(harness.store.orders().await[0].status, OrderStatus::Failed);
        assert!(harness.store.roles().await.is_empty());
    }

    // =========================================================================
    // A late expiry after payment does not un-pay the order
    // =========================================================================
    #[tokio::test]
    async fn test_out_of_order_failure_after_paid_is_ignored() {
        let harness = TestHarness::new();
        pending_order(&harness, "sess_1", Uuid::new_v4()).await;
        let webhooks = &harness.service.webhooks;

        webhooks
            .handle_event(&event("evt_1", CHECKOUT_SESSION_COMPLETED, paid_session("sess_1")))
            .await
            .unwrap();
        let outcome = webhooks
            .handle_event(&event(
                "evt_2",
                CHECKOUT_SESSION_ASYNC_PAYMENT_FAILED,
                json!({ "id": "sess_1", "mode": "payment" }),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::NoOp);
        assert_eq!(harness.store.orders().await[0].status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn test_full_refund_moves_paid_order_to_refunded() {
        let harness = TestHarness::new();
        pending_order(&harness, "sess_1", Uuid::new_v4()).await;
        let webhooks = &harness.service.webhooks;

        webhooks
            .handle_event(&event("evt_1", CHECKOUT_SESSION_COMPLETED, paid_session("sess_1")))
            .await
            .unwrap();
        webhooks
            .handle_event(&event(
                "evt_2",
                CHARGE_REFUNDED,
                json!({ "id": "ch_1", "payment_intent": "pi_1", "refunded": true }),
            ))
            .await
            .unwrap();

        assert_eq!(harness.store.orders().await[0].status, OrderStatus::Refunded);
        assert_eq!(harness.store.notifications().await.len(), 1);
    }

    // =========================================================================
    // A paid session with no local order is a lost write: loud, retried,
    // and replayable once the order exists
    // =========================================================================
    #[tokio::test]
    async fn test_missing_order_is_surfaced_and_replayable() {
        let harness = TestHarness::new();
        let webhooks = &harness.service.webhooks;

        let err = webhooks
            .handle_event(&event("evt_1", CHECKOUT_SESSION_COMPLETED, paid_session("sess_1")))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::OrderNotFound(_)));
        assert!(err.is_retryable());

        let logged = harness.store.get_webhook_event("evt_1").await.unwrap().unwrap();
        assert_eq!(logged.processing_result, ProcessingResult::Error);

        pending_order(&harness, "sess_1", Uuid::new_v4()).await;
        let results = webhooks.replay_all_failed(50).await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert_eq!(results[0].previous_status, ProcessingResult::Error);
        assert_eq!(results[0].new_status, ProcessingResult::Success);
        assert_eq!(harness.store.orders().await[0].status, OrderStatus::Paid);
    }

    // =========================================================================
    // Provider retries of a failed event may claim it again
    // =========================================================================
    #[tokio::test]
    async fn test_failed_event_is_reclaimed_on_redelivery() {
        let harness = TestHarness::new();
        let webhooks = &harness.service.webhooks;
        let evt = event("evt_1", CHECKOUT_SESSION_COMPLETED, paid_session("sess_1"));

        assert!(webhooks.handle_event(&evt).await.is_err());
        pending_order(&harness, "sess_1", Uuid::new_v4()).await;

        assert_eq!(
            webhooks.handle_event(&evt).await.unwrap(),
            DispatchOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_acknowledged() {
        let harness = TestHarness::new();

        let outcome = harness
            .service
            .webhooks
            .handle_event(&event("evt_1", "customer.tax_id.created", json!({ "id": "txi_1" })))
            .await
            .unwrap();

        assert!(matches!(outcome, DispatchOutcome::Ignored(_)));
        let logged = harness.store.get_webhook_event("evt_1").await.unwrap().unwrap();
        assert_eq!(logged.processing_result, ProcessingResult::Ignored);
    }

    #[tokio::test]
    async fn test_deposit_checkout_records_one_lead() {
        let harness = TestHarness::new();
        let session = json!({
            "id": "cs_dep_1",
            "mode": "payment",
            "payment_status": "paid",
            "amount_total": 50_000,
            "customer_details": { "email": "lead@x.com", "name": "Lee" },
            "metadata": { "checkout_type": "deposit", "service": "branding" }
        });
        let webhooks = &harness.service.webhooks;

        webhooks
            .handle_event(&event("evt_1", CHECKOUT_SESSION_COMPLETED, session.clone()))
            .await
            .unwrap();
        let again = webhooks
            .process_event(&event("evt_2", CHECKOUT_SESSION_COMPLETED, session))
            .await
            .unwrap();

        assert_eq!(again, DispatchOutcome::NoOp);
        let leads = harness.store.deposit_leads().await;
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].amount_cents, 50_000);
        assert!(harness.store.orders().await.is_empty());
    }
}

#[cfg(test)]
mod signature_tests {
    use time::OffsetDateTime;

    use crate::error::BillingError;
    use crate::signature::sign_payload;
    use crate::store::BillingStore;
    use crate::testing::{TestHarness, TEST_WEBHOOK_SECRET};

    const BODY: &[u8] =
        br#"{"id":"evt_1","type":"checkout.session.completed","created":1,"data":{"object":{"id":"sess_1"}}}"#;

    #[tokio::test]
    async fn test_bad_signature_rejected_without_mutation() {
        let harness = TestHarness::new();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign_payload(BODY, "whsec_wrong", now).unwrap();

        let err = harness
            .service
            .webhooks
            .verify_event(BODY, Some(&header))
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));

        let missing = harness.service.webhooks.verify_event(BODY, None).unwrap_err();
        assert!(matches!(missing, BillingError::WebhookSignatureInvalid));

        assert!(harness
            .store
            .list_webhook_events(None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_valid_signature_parses_envelope() {
        let harness = TestHarness::new();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let header = sign_payload(BODY, TEST_WEBHOOK_SECRET, now).unwrap();

        let envelope = harness
            .service
            .webhooks
            .verify_event(BODY, Some(&header))
            .unwrap();
        assert_eq!(envelope.id, "evt_1");
        assert_eq!(envelope.event_type, "checkout.session.completed");
    }
}

#[cfg(test)]
mod subscription_webhook_tests {
    use serde_json::json;
    use time::macros::datetime;
    use uuid::Uuid;

    use crate::subscriptions::{NewSubscription, SubscriptionStatus};
    use crate::testing::{event, TestHarness};
    use crate::webhook_types::*;
    use crate::webhooks::DispatchOutcome;

    fn new_subscription(user: Option<Uuid>) -> NewSubscription {
        NewSubscription {
            external_subscription_id: "sub_1".into(),
            external_customer_id: "cus_1".into(),
            price_id: "price_basic".into(),
            status: SubscriptionStatus::Active,
            current_period_start: datetime!(2025-01-01 0:00 UTC),
            current_period_end: datetime!(2025-02-01 0:00 UTC),
            cancel_at_period_end: false,
            customer_email: "a@x.com".into(),
            user_id: user,
        }
    }

    // =========================================================================
    // A status-only update leaves the period untouched
    // =========================================================================
    #[tokio::test]
    async fn test_status_only_update_keeps_period_end() {
        let harness = TestHarness::new();
        harness
            .service
            .subscriptions
            .upsert_subscription(new_subscription(None))
            .await
            .unwrap();

        harness
            .service
            .webhooks
            .handle_event(&event(
                "evt_1",
                CUSTOMER_SUBSCRIPTION_UPDATED,
                json!({ "id": "sub_1", "status": "past_due" }),
            ))
            .await
            .unwrap();

        let sub = harness.service.subscriptions.get_subscription("sub_1").await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.current_period_end, datetime!(2025-02-01 0:00 UTC));
        assert_eq!(sub.price_id, "price_basic");
        assert_eq!(sub.customer_email, "a@x.com");
    }

    #[tokio::test]
    async fn test_first_activation_grants_once() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();
        let ledger = &harness.service.subscriptions;

        ledger.upsert_subscription(new_subscription(Some(user))).await.unwrap();
        ledger.upsert_subscription(new_subscription(Some(user))).await.unwrap();

        harness
            .service
            .webhooks
            .handle_event(&event(
                "evt_1",
                CUSTOMER_SUBSCRIPTION_UPDATED,
                json!({ "id": "sub_1", "status": "active", "cancel_at_period_end": true }),
            ))
            .await
            .unwrap();

        assert_eq!(harness.store.roles().await.len(), 1);
        assert_eq!(harness.store.notifications().await.len(), 1);
        let sub = ledger.get_subscription("sub_1").await.unwrap();
        assert!(sub.cancel_at_period_end);
    }

    // =========================================================================
    // invoice.paid (subscription_create) creates the ledger entry and
    // fulfills for the user linked to the customer
    // =========================================================================
    #[tokio::test]
    async fn test_subscription_created_from_first_invoice() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();
        harness
            .service
            .customers
            .record_customer("cus_9", "b@x.com", Some(user))
            .await
            .unwrap();

        let invoice = json!({
            "id": "in_1",
            "customer": "cus_9",
            "customer_email": "b@x.com",
            "subscription": "sub_9",
            "billing_reason": "subscription_create",
            "lines": { "data": [{
                "period": { "start": 1_735_689_600, "end": 1_738_368_000 },
                "price": { "id": "price_care", "recurring": { "interval": "month" } }
            }]}
        });
        let webhooks = &harness.service.webhooks;
        let first = webhooks
            .handle_event(&event("evt_1", INVOICE_PAID, invoice.clone()))
            .await
            .unwrap();
        let replay = webhooks
            .process_event(&event("evt_1", INVOICE_PAID, invoice))
            .await
            .unwrap();

        assert_eq!(first, DispatchOutcome::Applied);
        assert_eq!(replay, DispatchOutcome::NoOp);

        let sub = harness.service.subscriptions.get_subscription("sub_9").await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.user_id, Some(user));
        assert_eq!(sub.price_id, "price_care");
        assert_eq!(harness.store.roles().await.len(), 1);
        assert_eq!(harness.store.notifications().await.len(), 1);
    }

    // =========================================================================
    // invoice.paid before checkout.session.completed: the late checkout
    // links the user to the already active subscription and grants access
    // =========================================================================
    #[tokio::test]
    async fn test_checkout_after_first_invoice_links_user_and_grants() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();
        let webhooks = &harness.service.webhooks;

        webhooks
            .handle_event(&event(
                "evt_inv",
                INVOICE_PAID,
                json!({
                    "id": "in_1",
                    "customer": "cus_9",
                    "customer_email": "b@x.com",
                    "subscription": "sub_9",
                    "billing_reason": "subscription_create",
                    "lines": { "data": [{
                        "period": { "start": 1_735_689_600, "end": 1_738_368_000 },
                        "price": { "id": "price_care", "recurring": { "interval": "month" } }
                    }]}
                }),
            ))
            .await
            .unwrap();

        let orphan = harness.service.subscriptions.get_subscription("sub_9").await.unwrap();
        assert_eq!(orphan.user_id, None);
        assert!(harness.store.roles().await.is_empty());

        let linked = webhooks
            .handle_event(&event(
                "evt_cs",
                CHECKOUT_SESSION_COMPLETED,
                json!({
                    "id": "cs_sub_9",
                    "mode": "subscription",
                    "payment_status": "paid",
                    "customer": "cus_9",
                    "customer_details": { "email": "b@x.com" },
                    "metadata": { "user_id": user.to_string() }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(linked, DispatchOutcome::Applied);

        let sub = harness.service.subscriptions.get_subscription("sub_9").await.unwrap();
        assert_eq!(sub.user_id, Some(user));
        let active = harness
            .service
            .subscriptions
            .get_active_subscription(user)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.external_subscription_id, "sub_9");
        assert_eq!(active.status, SubscriptionStatus::Active);
        assert_eq!(harness.store.roles().await.len(), 1);
        assert!(harness.store.roles().await.contains_key(&user));
        // The welcome went out once, on activation
        assert_eq!(harness.store.notifications().await.len(), 1);

        // Redelivered checkout changes nothing
        let again = webhooks
            .process_event(&event(
                "evt_cs",
                CHECKOUT_SESSION_COMPLETED,
                json!({
                    "id": "cs_sub_9",
                    "mode": "subscription",
                    "customer": "cus_9",
                    "customer_details": { "email": "b@x.com" },
                    "metadata": { "user_id": user.to_string() }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(again, DispatchOutcome::NoOp);
        assert_eq!(harness.store.roles().await.len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_invoice_advances_period() {
        let harness = TestHarness::new();
        harness
            .service
            .subscriptions
            .upsert_subscription(new_subscription(None))
            .await
            .unwrap();

        harness
            .service
            .webhooks
            .handle_event(&event(
                "evt_1",
                INVOICE_PAID,
                json!({
                    "id": "in_2",
                    "customer": "cus_1",
                    "subscription": "sub_1",
                    "billing_reason": "subscription_cycle",
                    "lines": { "data": [{
                        "period": { "start": 1_738_368_000 },
                        "price": { "id": "price_basic", "recurring": { "interval": "month" } }
                    }]}
                }),
            ))
            .await
            .unwrap();

        let sub = harness.service.subscriptions.get_subscription("sub_1").await.unwrap();
        assert_eq!(sub.current_period_start, datetime!(2025-02-01 0:00 UTC));
        assert_eq!(sub.current_period_end, datetime!(2025-03-01 0:00 UTC));
    }

    #[tokio::test]
    async fn test_deleted_subscription_is_canceled_once() {
        let harness = TestHarness::new();
        harness
            .service
            .subscriptions
            .upsert_subscription(new_subscription(None))
            .await
            .unwrap();
        let webhooks = &harness.service.webhooks;
        let deleted = json!({ "id": "sub_1", "status": "canceled" });

        let first = webhooks
            .handle_event(&event("evt_1", CUSTOMER_SUBSCRIPTION_DELETED, deleted.clone()))
            .await
            .unwrap();
        let second = webhooks
            .process_event(&event("evt_2", CUSTOMER_SUBSCRIPTION_DELETED, deleted))
            .await
            .unwrap();

        assert_eq!(first, DispatchOutcome::Applied);
        assert_eq!(second, DispatchOutcome::NoOp);
        let sub = harness.service.subscriptions.get_subscription("sub_1").await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_update_for_unknown_subscription_is_acknowledged() {
        let harness = TestHarness::new();
        let outcome = harness
            .service
            .webhooks
            .handle_event(&event(
                "evt_1",
                CUSTOMER_SUBSCRIPTION_UPDATED,
                json!({ "id": "sub_ghost", "status": "active" }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn test_custom_deal_applies_cancel_at() {
        let harness = TestHarness::new();
        harness
            .service
            .subscriptions
            .upsert_subscription(new_subscription(None))
            .await
            .unwrap();

        harness
            .service
            .webhooks
            .handle_event(&event(
                "evt_1",
                CUSTOMER_SUBSCRIPTION_CREATED,
                json!({
                    "id": "sub_1",
                    "status": "active",
                    "metadata": { "deal_type": "custom", "cancel_at": "1767225600" }
                }),
            ))
            .await
            .unwrap();

        let calls = harness.provider.cancel_at_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, datetime!(2026-01-01 0:00 UTC));
        let sub = harness.service.subscriptions.get_subscription("sub_1").await.unwrap();
        assert_eq!(sub.cancel_at, Some(datetime!(2026-01-01 0:00 UTC)));
    }

    #[tokio::test]
    async fn test_untagged_subscription_created_is_ignored() {
        let harness = TestHarness::new();
        let outcome = harness
            .service
            .webhooks
            .handle_event(&event(
                "evt_1",
                CUSTOMER_SUBSCRIPTION_CREATED,
                json!({ "id": "sub_1", "status": "active" }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Ignored(_)));
        assert!(harness.provider.cancel_at_calls().is_empty());
    }
}

#[cfg(test)]
mod setup_invoice_tests {
    use serde_json::json;
    use uuid::Uuid;

    use std::collections::HashMap;

    use crate::error::BillingError;
    use crate::projects::{PaymentStatus, Project, SetupInvoiceState, SetupInvoiceStatus};
    use crate::provider::{ProviderInvoice, ProviderInvoiceStatus};
    use crate::store::BillingStore;
    use crate::testing::{event, TestHarness};
    use crate::webhook_types::INVOICE_PAID;
    use crate::webhooks::DispatchOutcome;

    async fn project(harness: &TestHarness) -> Project {
        let project = Project::new(Uuid::new_v4(), "Bakery site", "owner@bakery.test");
        harness.store.insert_project(&project).await.unwrap();
        project
    }

    // =========================================================================
    // A second invoice replaces the first; one payable invoice remains
    // =========================================================================
    #[tokio::test]
    async fn test_second_invoice_voids_the_first() {
        let harness = TestHarness::new();
        let project = project(&harness).await;
        let flow = &harness.service.setup_invoices;

        let first = flow.create_and_send(project.id, 150_000, None).await.unwrap();
        assert_eq!(first.setup_invoice.status, SetupInvoiceStatus::Sent);
        let first_id = first.setup_invoice.stripe_invoice_id.clone().unwrap();

        let second = flow.create_and_send(project.id, 175_000, None).await.unwrap();
        let second_id = second.setup_invoice.stripe_invoice_id.clone().unwrap();
        assert_ne!(first_id, second_id);

        let customer = harness
            .service
            .customers
            .resolve(None, Some("owner@bakery.test"))
            .await
            .unwrap()
            .unwrap();
        let payable = harness.provider.payable_invoices(&customer.external_customer_id);
        assert_eq!(payable.len(), 1);
        assert_eq!(payable[0].id, second_id);
        assert_eq!(harness.provider.voided_invoices(), vec![first_id]);
    }

    // =========================================================================
    // Replacements of one project are serialized
    // =========================================================================
    #[tokio::test]
    async fn test_replacement_in_progress_is_rejected() {
        let harness = TestHarness::new();
        let project = project(&harness).await;
        let flow = &harness.service.setup_invoices;

        assert!(harness
            .store
            .claim_setup_invoice_lease(project.id, time::Duration::minutes(2))
            .await
            .unwrap());

        let err = flow.create_and_send(project.id, 150_000, None).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
        assert!(harness.provider.created_customers().is_empty());
        let stored = harness.store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(stored.setup_invoice.status, SetupInvoiceStatus::Pending);

        harness.store.release_setup_invoice_lease(project.id).await.unwrap();
        let sent = flow.create_and_send(project.id, 150_000, None).await.unwrap();
        assert_eq!(sent.setup_invoice.status, SetupInvoiceStatus::Sent);
    }

    #[tokio::test]
    async fn test_concurrent_replacements_leave_one_payable_invoice() {
        let harness = TestHarness::new();
        let project = project(&harness).await;
        let flow = &harness.service.setup_invoices;
        flow.create_and_send(project.id, 150_000, None).await.unwrap();

        let (a, b) = tokio::join!(
            flow.create_and_send(project.id, 160_000, None),
            flow.create_and_send(project.id, 170_000, None),
        );
        assert!(a.is_ok() || b.is_ok());

        let customer = harness
            .service
            .customers
            .resolve(None, Some("owner@bakery.test"))
            .await
            .unwrap()
            .unwrap();
        let payable = harness.provider.payable_invoices(&customer.external_customer_id);
        assert_eq!(payable.len(), 1);
        let stored = harness.store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(stored.setup_invoice.stripe_invoice_id, Some(payable[0].id.clone()));
    }

    // =========================================================================
    // The recorded invoice is withdrawn even when it sits under a customer
    // the project no longer resolves to
    // =========================================================================
    #[tokio::test]
    async fn test_recorded_invoice_under_old_customer_is_voided() {
        let harness = TestHarness::new();
        let mut project = Project::new(Uuid::new_v4(), "Bakery site", "new@bakery.test");
        project.setup_invoice = SetupInvoiceState {
            stripe_invoice_id: Some("in_old".to_string()),
            url: Some("https://invoice.stripe.test/in_old".to_string()),
            status: SetupInvoiceStatus::Sent,
            paid: false,
        };
        harness.store.insert_project(&project).await.unwrap();
        harness.provider.seed_invoice(
            "cus_old",
            ProviderInvoice {
                id: "in_old".to_string(),
                status: ProviderInvoiceStatus::Open,
                hosted_invoice_url: Some("https://invoice.stripe.test/in_old".to_string()),
                metadata: HashMap::from([
                    ("invoice_type".to_string(), "setup_fee".to_string()),
                    ("project_id".to_string(), project.id.to_string()),
                ]),
            },
        );

        let sent = harness
            .service
            .setup_invoices
            .create_and_send(project.id, 150_000, None)
            .await
            .unwrap();

        assert_ne!(sent.setup_invoice.stripe_invoice_id.as_deref(), Some("in_old"));
        assert_eq!(harness.provider.voided_invoices(), vec!["in_old".to_string()]);
        assert!(harness.provider.payable_invoices("cus_old").is_empty());
    }

    // =========================================================================
    // Client self-report is advisory only
    // =========================================================================
    #[tokio::test]
    async fn test_client_report_never_marks_paid() {
        let harness = TestHarness::new();
        let project = project(&harness).await;
        let flow = &harness.service.setup_invoices;
        flow.create_and_send(project.id, 150_000, None).await.unwrap();

        let reported = flow
            .report_paid_by_client(project.id, project.owner_user_id)
            .await
            .unwrap();
        assert_eq!(reported.setup_invoice.status, SetupInvoiceStatus::NeedsVerification);
        assert!(!reported.setup_invoice.paid);
        assert_eq!(reported.payment_status, PaymentStatus::Unpaid);

        let again = flow
            .report_paid_by_client(project.id, project.owner_user_id)
            .await
            .unwrap();
        assert_eq!(again.setup_invoice.status, SetupInvoiceStatus::NeedsVerification);
        assert!(harness.store.notifications().await.is_empty());
    }

    #[tokio::test]
    async fn test_admin_confirmation_is_idempotent() {
        let harness = TestHarness::new();
        let project = project(&harness).await;
        let flow = &harness.service.setup_invoices;
        flow.create_and_send(project.id, 150_000, None).await.unwrap();
        flow.report_paid_by_client(project.id, project.owner_user_id)
            .await
            .unwrap();

        let confirmed = flow.confirm_paid_by_admin(project.id).await.unwrap();
        assert!(confirmed.transitioned());
        assert_eq!(confirmed.project().setup_invoice.status, SetupInvoiceStatus::Paid);
        assert!(confirmed.project().setup_invoice.paid);

        let again = flow.confirm_paid_by_admin(project.id).await.unwrap();
        assert!(!again.transitioned());

        let stored = harness.store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(harness.store.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn test_paid_invoice_event_marks_project_paid_once() {
        let harness = TestHarness::new();
        let project = project(&harness).await;
        let sent = harness
            .service
            .setup_invoices
            .create_and_send(project.id, 150_000, None)
            .await
            .unwrap();
        let invoice_id = sent.setup_invoice.stripe_invoice_id.unwrap();

        let paid = json!({
            "id": invoice_id,
            "billing_reason": "manual",
            "metadata": { "invoice_type": "setup_fee", "project_id": project.id.to_string() }
        });
        let webhooks = &harness.service.webhooks;
        let first = webhooks
            .handle_event(&event("evt_1", INVOICE_PAID, paid.clone()))
            .await
            .unwrap();
        let second = webhooks
            .handle_event(&event("evt_2", INVOICE_PAID, paid))
            .await
            .unwrap();

        assert_eq!(first, DispatchOutcome::Applied);
        assert_eq!(second, DispatchOutcome::NoOp);
        let stored = harness.store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(stored.setup_invoice.status, SetupInvoiceStatus::Paid);
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
        assert_eq!(harness.store.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn test_report_rules() {
        let harness = TestHarness::new();
        let project = project(&harness).await;
        let flow = &harness.service.setup_invoices;

        let early = flow
            .report_paid_by_client(project.id, project.owner_user_id)
            .await
            .unwrap_err();
        assert!(matches!(early, BillingError::InvalidState(_)));

        flow.create_and_send(project.id, 150_000, None).await.unwrap();
        let stranger = flow
            .report_paid_by_client(project.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(stranger, BillingError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_cannot_reissue_after_payment() {
        let harness = TestHarness::new();
        let project = project(&harness).await;
        let flow = &harness.service.setup_invoices;
        flow.create_and_send(project.id, 150_000, None).await.unwrap();
        flow.confirm_paid_by_admin(project.id).await.unwrap();

        let err = flow.create_and_send(project.id, 150_000, None).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidState(_)));
    }
}

#[cfg(test)]
mod cancellation_tests {
    use uuid::Uuid;

    use super::support::*;
    use crate::error::BillingError;
    use crate::orders::OrderStatus;
    use crate::store::BillingStore;
    use crate::testing::{event, TestHarness};
    use crate::webhook_types::{CHECKOUT_SESSION_COMPLETED, CHECKOUT_SESSION_EXPIRED};
    use crate::webhooks::{DispatchOutcome, ProcessingResult};

    #[tokio::test]
    async fn test_owner_cancels_pending_order() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();
        let order = pending_order(&harness, "sess_1", user).await;

        harness
            .service
            .orders
            .cancel_own_order(order.id, user)
            .await
            .unwrap();
        assert!(harness.store.orders().await.is_empty());

        // The session can be used again after cancellation
        pending_order(&harness, "sess_1", user).await;
    }

    #[tokio::test]
    async fn test_cannot_cancel_paid_or_foreign_order() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();
        let order = pending_order(&harness, "sess_1", user).await;

        let foreign = harness
            .service
            .orders
            .cancel_own_order(order.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(foreign, BillingError::PermissionDenied(_)));

        harness
            .service
            .webhooks
            .handle_event(&event("evt_1", CHECKOUT_SESSION_COMPLETED, paid_session("sess_1")))
            .await
            .unwrap();

        let paid = harness
            .service
            .orders
            .cancel_own_order(order.id, user)
            .await
            .unwrap_err();
        assert!(matches!(paid, BillingError::InvalidState(_)));
        assert_eq!(harness.store.orders().await[0].status, OrderStatus::Paid);
    }

    // =========================================================================
    // Cancelling expires the session; the expiry event that follows is
    // acknowledged instead of being retried forever
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_expires_session_and_later_expiry_is_acknowledged() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();
        let order = pending_order(&harness, "sess_c", user).await;

        harness
            .service
            .orders
            .cancel_own_order(order.id, user)
            .await
            .unwrap();
        assert_eq!(harness.provider.expired_sessions(), vec!["sess_c".to_string()]);

        let outcome = harness
            .service
            .webhooks
            .handle_event(&event(
                "evt_exp",
                CHECKOUT_SESSION_EXPIRED,
                serde_json::json!({ "id": "sess_c", "mode": "payment", "status": "expired" }),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Ignored(_)));

        let logged = harness.store.get_webhook_event("evt_exp").await.unwrap().unwrap();
        assert_eq!(logged.processing_result, ProcessingResult::Ignored);
        assert!(harness.store.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_completed_session_cannot_be_cancelled() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();
        let order = pending_order(&harness, "sess_1", user).await;
        // Paid at Stripe, webhook not yet delivered
        harness.provider.complete_checkout_session("sess_1");

        let err = harness
            .service
            .orders
            .cancel_own_order(order.id, user)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::StripeApi(_)));

        let orders = harness.store.orders().await;
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, OrderStatus::Pending);

        // The delayed completion still resolves the kept order
        harness
            .service
            .webhooks
            .handle_event(&event("evt_1", CHECKOUT_SESSION_COMPLETED, paid_session("sess_1")))
            .await
            .unwrap();
        assert_eq!(harness.store.orders().await[0].status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();
        pending_order(&harness, "sess_1", user).await;

        let err = harness
            .service
            .orders
            .create_pending_order(crate::orders::NewOrder {
                external_session_id: "sess_1".into(),
                external_customer_id: "cus_1".into(),
                product_type: "website".into(),
                amount_cents: 89_900,
                customer_email: "a@x.com".into(),
                customer_name: None,
                user_id: Some(user),
                project_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::OrderAlreadyExists(_)));
    }
}

#[cfg(test)]
mod notification_tests {
    use uuid::Uuid;

    use super::support::*;
    use crate::notifications::NotificationStatus;
    use crate::orders::OrderStatus;
    use crate::testing::{event, TestHarness};
    use crate::webhook_types::CHECKOUT_SESSION_COMPLETED;
    use crate::webhooks::DispatchOutcome;

    // =========================================================================
    // A failing mail provider never rolls back or fails the ledger write
    // =========================================================================
    #[tokio::test]
    async fn test_notification_failure_keeps_ledger_and_retries_later() {
        let harness = TestHarness::new();
        pending_order(&harness, "sess_1", Uuid::new_v4()).await;
        harness.notifier.set_failing(true);

        let outcome = harness
            .service
            .webhooks
            .handle_event(&event("evt_1", CHECKOUT_SESSION_COMPLETED, paid_session("sess_1")))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Applied);
        assert_eq!(harness.store.orders().await[0].status, OrderStatus::Paid);

        let queued = harness.store.notifications().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, NotificationStatus::Pending);
        assert_eq!(queued[0].attempts, 1);

        harness.notifier.set_failing(false);
        let summary = harness.service.outbox.retry_pending(10).await.unwrap();
        assert_eq!(summary.sent, 1);

        let sent = harness.store.notifications().await;
        assert_eq!(sent[0].status, NotificationStatus::Sent);
        assert_eq!(harness.notifier.delivered().len(), 1);
    }
}
