//! Scheduled billing jobs

use agency_billing::{BillingService, InvariantChecker, ProcessingResult, ViolationSeverity};
use tracing::{error, info, warn};

/// Failed webhook events replayed per run
pub const REPLAY_BATCH_LIMIT: i64 = 50;
/// Pending notifications retried per run
pub const OUTBOX_BATCH_LIMIT: i64 = 100;

/// Retry delivery of queued notifications
pub async fn retry_notifications(billing: &BillingService) {
    if let Err(e) = billing.outbox.retry_pending(OUTBOX_BATCH_LIMIT).await {
        error!(error = %e, "Notification retry cycle failed");
    }
}

/// Replay webhook events that ended in `error`, oldest first. Events that
/// reach the replay limit are marked `failed` and left for an operator.
/// Returns how many replays succeeded.
pub async fn replay_failed_webhooks(billing: &BillingService) -> usize {
    let results = match billing.webhooks.replay_all_failed(REPLAY_BATCH_LIMIT).await {
        Ok(results) => results,
        Err(e) => {
            error!(error = %e, "Failed to list failed webhook events");
            return 0;
        }
    };

    if results.is_empty() {
        return 0;
    }

    let succeeded = results.iter().filter(|r| r.success).count();
    let mut given_up = 0;
    for result in results.iter().filter(|r| !r.success) {
        if result.new_status == ProcessingResult::Failed {
            given_up += 1;
            error!(
                stripe_event_id = %result.stripe_event_id,
                event_type = %result.event_type,
                error = ?result.new_error,
                "RECONCILIATION NEEDED: webhook replay limit reached, event marked failed"
            );
        } else {
            warn!(
                stripe_event_id = %result.stripe_event_id,
                event_type = %result.event_type,
                error = ?result.new_error,
                "Webhook replay still failing"
            );
        }
    }

    info!(
        replayed = results.len(),
        succeeded = succeeded,
        still_failing = results.len() - succeeded - given_up,
        given_up = given_up,
        "Webhook replay cycle complete"
    );
    succeeded
}

/// Run the invariant sweep and log every violation
pub async fn run_invariant_sweep(checker: &InvariantChecker) {
    let summary = match checker.run_all_checks().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Billing invariant sweep failed");
            return;
        }
    };

    for violation in &summary.violations {
        let entity_ids = violation.entity_ids.join(",");
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                entity_ids = %entity_ids,
                context = %violation.context,
                "RECONCILIATION NEEDED: {}",
                violation.description
            ),
            _ => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                entity_ids = %entity_ids,
                "{}",
                violation.description
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use agency_billing::testing::{event, TestHarness};
    use agency_billing::webhook_types::CHECKOUT_SESSION_COMPLETED;
    use agency_billing::notifications::{NotificationKind, NotificationStatus};
    use agency_billing::webhooks::MAX_REPLAY_ATTEMPTS;
    use agency_billing::{BillingStore, DispatchOutcome, NewOrder, OrderStatus};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn test_replay_recovers_event_once_order_exists() {
        let harness = TestHarness::new();
        let billing = &harness.service;
        let evt = event(
            "evt_1",
            CHECKOUT_SESSION_COMPLETED,
            json!({ "id": "cs_1", "mode": "payment", "payment_status": "paid" }),
        );

        assert!(billing.webhooks.handle_event(&evt).await.is_err());
        assert_eq!(replay_failed_webhooks(billing).await, 0);

        billing
            .orders
            .create_pending_order(NewOrder {
                external_session_id: "cs_1".into(),
                external_customer_id: "cus_1".into(),
                product_type: "website".into(),
                amount_cents: 89_900,
                customer_email: "a@x.com".into(),
                customer_name: None,
                user_id: Some(Uuid::new_v4()),
                project_id: None,
            })
            .await
            .unwrap();

        assert_eq!(replay_failed_webhooks(billing).await, 1);
        assert_eq!(harness.store.orders().await[0].status, OrderStatus::Paid);
        assert_eq!(replay_failed_webhooks(billing).await, 0);
    }

    #[tokio::test]
    async fn test_replay_gives_up_after_limit() {
        let harness = TestHarness::new();
        let billing = &harness.service;
        let evt = event(
            "evt_lost",
            CHECKOUT_SESSION_COMPLETED,
            json!({ "id": "cs_lost", "mode": "payment", "payment_status": "paid" }),
        );
        assert!(billing.webhooks.handle_event(&evt).await.is_err());

        for _ in 0..MAX_REPLAY_ATTEMPTS {
            assert_eq!(replay_failed_webhooks(billing).await, 0);
        }

        let logged = harness.store.get_webhook_event("evt_lost").await.unwrap().unwrap();
        assert_eq!(logged.processing_result, ProcessingResult::Failed);
        assert_eq!(logged.replay_attempts, MAX_REPLAY_ATTEMPTS);

        // No longer picked up by the job, and redeliveries are acknowledged
        assert!(billing.webhooks.replay_all_failed(50).await.unwrap().is_empty());
        assert_eq!(
            billing.webhooks.handle_event(&evt).await.unwrap(),
            DispatchOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn test_retry_sends_queued_notification() {
        let harness = TestHarness::new();
        harness.notifier.set_failing(true);
        harness
            .service
            .outbox
            .enqueue(
                NotificationKind::Welcome,
                "a@x.com",
                json!({}),
            )
            .await
            .unwrap();

        harness.notifier.set_failing(false);
        retry_notifications(&harness.service).await;

        let rows = harness.store.notifications().await;
        assert_eq!(rows[0].status, NotificationStatus::Sent);
    }
}
