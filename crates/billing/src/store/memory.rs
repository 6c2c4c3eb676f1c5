//! In-memory billing store for tests and local development.
//!
//! All state sits behind one lock, so every trait method is trivially atomic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::BillingStore;
use crate::customer::CustomerRecord;
use crate::error::{BillingError, BillingResult};
use crate::notifications::{Notification, NotificationStatus};
use crate::orders::{NewOrder, Order, OrderResolution, OrderStatus};
use crate::projects::{PaymentStatus, Project, SetupInvoiceState, SetupInvoiceStatus};
use crate::subscriptions::{NewSubscription, Subscription, SubscriptionChange, SubscriptionPatch};
use crate::webhooks::{ClaimOutcome, DepositLead, ProcessingResult, WebhookEventRecord};

#[derive(Default, Clone)]
pub struct MemoryBillingStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    customers: HashMap<String, CustomerRecord>,
    orders: HashMap<Uuid, Order>,
    subscriptions: HashMap<String, Subscription>,
    projects: HashMap<Uuid, Project>,
    roles: HashMap<Uuid, String>,
    notifications: Vec<Notification>,
    webhook_events: HashMap<String, WebhookEventRecord>,
    deposit_leads: HashMap<String, DepositLead>,
    setup_invoice_leases: HashMap<Uuid, OffsetDateTime>,
}

impl Inner {
    fn canonical_for(&self, email: &str) -> Option<&CustomerRecord> {
        self.customers
            .values()
            .find(|c| c.email == email && !c.is_duplicate)
    }
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All orders (for testing)
    pub async fn orders(&self) -> Vec<Order> {
        self.inner.read().await.orders.values().cloned().collect()
    }

    /// All notifications in enqueue order (for testing)
    pub async fn notifications(&self) -> Vec<Notification> {
        self.inner.read().await.notifications.clone()
    }

    /// All role grants (for testing)
    pub async fn roles(&self) -> HashMap<Uuid, String> {
        self.inner.read().await.roles.clone()
    }

    /// All deposit leads (for testing)
    pub async fn deposit_leads(&self) -> Vec<DepositLead> {
        self.inner
            .read()
            .await
            .deposit_leads
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn get_customer(&self, external_customer_id: &str) -> BillingResult<Option<CustomerRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .customers
            .get(external_customer_id)
            .cloned())
    }

    async fn find_canonical_customer_by_email(
        &self,
        email: &str,
    ) -> BillingResult<Option<CustomerRecord>> {
        Ok(self.inner.read().await.canonical_for(email).cloned())
    }

    async fn insert_customer_if_absent(
        &self,
        external_customer_id: &str,
        email: &str,
    ) -> BillingResult<CustomerRecord> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.customers.get(external_customer_id) {
            return Ok(existing.clone());
        }

        let record = CustomerRecord {
            external_customer_id: external_customer_id.to_string(),
            email: email.to_string(),
            linked_user_id: None,
            is_duplicate: inner.canonical_for(email).is_some(),
            created_at: OffsetDateTime::now_utc(),
        };
        inner
            .customers
            .insert(external_customer_id.to_string(), record.clone());
        Ok(record)
    }

    async fn link_customer_user(
        &self,
        external_customer_id: &str,
        user_id: Uuid,
    ) -> BillingResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.customers.get_mut(external_customer_id) {
            Some(record) if record.linked_user_id.is_none() => {
                record.linked_user_id = Some(user_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_order(&self, order: &NewOrder) -> BillingResult<Order> {
        let mut inner = self.inner.write().await;
        if inner
            .orders
            .values()
            .any(|o| o.external_session_id == order.external_session_id)
        {
            return Err(BillingError::OrderAlreadyExists(
                order.external_session_id.clone(),
            ));
        }

        let stored = Order {
            id: Uuid::new_v4(),
            external_session_id: order.external_session_id.clone(),
            external_customer_id: order.external_customer_id.clone(),
            product_type: order.product_type.clone(),
            amount_cents: order.amount_cents,
            customer_email: order.customer_email.clone(),
            customer_name: order.customer_name.clone(),
            status: OrderStatus::Pending,
            external_payment_intent_id: None,
            paid_at: None,
            user_id: order.user_id,
            project_id: order.project_id,
            created_at: OffsetDateTime::now_utc(),
        };
        inner.orders.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_order(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        Ok(self.inner.read().await.orders.get(&order_id).cloned())
    }

    async fn get_order_by_session(&self, session_id: &str) -> BillingResult<Option<Order>> {
        Ok(self
            .inner
            .read()
            .await
            .orders
            .values()
            .find(|o| o.external_session_id == session_id)
            .cloned())
    }

    async fn get_order_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<Order>> {
        Ok(self
            .inner
            .read()
            .await
            .orders
            .values()
            .find(|o| o.external_payment_intent_id.as_deref() == Some(payment_intent_id))
            .cloned())
    }

    async fn compare_and_set_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        resolution: &OrderResolution,
    ) -> BillingResult<Option<Order>> {
        let mut inner = self.inner.write().await;
        let Some(order) = inner.orders.get_mut(&order_id) else {
            return Ok(None);
        };
        if order.status != expected {
            return Ok(None);
        }

        order.status = resolution.status;
        if let Some(intent) = &resolution.payment_intent_id {
            order.external_payment_intent_id = Some(intent.clone());
        }
        if resolution.status == OrderStatus::Paid {
            order.paid_at = Some(resolution.paid_at.unwrap_or_else(OffsetDateTime::now_utc));
        }
        Ok(Some(order.clone()))
    }

    async fn delete_pending_order(&self, order_id: Uuid, owner: Uuid) -> BillingResult<bool> {
        let mut inner = self.inner.write().await;
        let deletable = inner
            .orders
            .get(&order_id)
            .is_some_and(|o| o.status == OrderStatus::Pending && o.user_id == Some(owner));
        if deletable {
            inner.orders.remove(&order_id);
        }
        Ok(deletable)
    }

    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<Option<Subscription>> {
        Ok(self
            .inner
            .read()
            .await
            .subscriptions
            .get(subscription_id)
            .cloned())
    }

    async fn upsert_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> BillingResult<SubscriptionChange> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;

        match inner
            .subscriptions
            .get_mut(&subscription.external_subscription_id)
        {
            Some(existing) => {
                let previous = existing.clone();
                subscription.as_patch().apply(existing, now);
                Ok(SubscriptionChange {
                    previous: Some(previous),
                    current: existing.clone(),
                })
            }
            None => {
                let created = subscription.clone().into_subscription(now);
                inner
                    .subscriptions
                    .insert(created.external_subscription_id.clone(), created.clone());
                Ok(SubscriptionChange {
                    previous: None,
                    current: created,
                })
            }
        }
    }

    async fn patch_subscription(
        &self,
        subscription_id: &str,
        patch: &SubscriptionPatch,
    ) -> BillingResult<Option<SubscriptionChange>> {
        let mut inner = self.inner.write().await;
        let Some(existing) = inner.subscriptions.get_mut(subscription_id) else {
            return Ok(None);
        };
        let previous = existing.clone();
        patch.apply(existing, OffsetDateTime::now_utc());
        Ok(Some(SubscriptionChange {
            previous: Some(previous),
            current: existing.clone(),
        }))
    }

    async fn list_subscriptions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let inner = self.inner.read().await;
        let mut subs: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.user_id == Some(user_id))
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn list_subscriptions_for_customer(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let inner = self.inner.read().await;
        let mut subs: Vec<Subscription> = inner
            .subscriptions
            .values()
            .filter(|s| s.external_customer_id == external_customer_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subs)
    }

    async fn insert_project(&self, project: &Project) -> BillingResult<()> {
        self.inner
            .write()
            .await
            .projects
            .insert(project.id, project.clone());
        Ok(())
    }

    async fn get_project(&self, project_id: Uuid) -> BillingResult<Option<Project>> {
        Ok(self.inner.read().await.projects.get(&project_id).cloned())
    }

    async fn find_project_by_setup_invoice(
        &self,
        invoice_id: &str,
    ) -> BillingResult<Option<Project>> {
        Ok(self
            .inner
            .read()
            .await
            .projects
            .values()
            .find(|p| p.setup_invoice.stripe_invoice_id.as_deref() == Some(invoice_id))
            .cloned())
    }

    async fn compare_and_set_setup_invoice(
        &self,
        project_id: Uuid,
        expected: &[SetupInvoiceStatus],
        next: &SetupInvoiceState,
    ) -> BillingResult<Option<Project>> {
        let mut inner = self.inner.write().await;
        let Some(project) = inner.projects.get_mut(&project_id) else {
            return Ok(None);
        };
        if !expected.contains(&project.setup_invoice.status) {
            return Ok(None);
        }
        project.setup_invoice = next.clone();
        Ok(Some(project.clone()))
    }

    async fn claim_setup_invoice_lease(
        &self,
        project_id: Uuid,
        ttl: time::Duration,
    ) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;
        if !inner.projects.contains_key(&project_id) {
            return Err(BillingError::ProjectNotFound(project_id.to_string()));
        }
        if inner
            .setup_invoice_leases
            .get(&project_id)
            .is_some_and(|until| *until > now)
        {
            return Ok(false);
        }
        inner.setup_invoice_leases.insert(project_id, now + ttl);
        Ok(true)
    }

    async fn release_setup_invoice_lease(&self, project_id: Uuid) -> BillingResult<()> {
        self.inner
            .write()
            .await
            .setup_invoice_leases
            .remove(&project_id);
        Ok(())
    }

    async fn mark_project_paid(&self, project_id: Uuid) -> BillingResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.projects.get_mut(&project_id) {
            Some(project) if project.payment_status != PaymentStatus::Paid => {
                project.payment_status = PaymentStatus::Paid;
                project.paid_at = Some(OffsetDateTime::now_utc());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::ProjectNotFound(project_id.to_string())),
        }
    }

    async fn grant_role_if_absent(&self, user_id: Uuid, role: &str) -> BillingResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.roles.contains_key(&user_id) {
            return Ok(false);
        }
        inner.roles.insert(user_id, role.to_string());
        Ok(true)
    }

    async fn get_role(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(self.inner.read().await.roles.get(&user_id).cloned())
    }

    async fn enqueue_notification(&self, notification: &Notification) -> BillingResult<()> {
        self.inner
            .write()
            .await
            .notifications
            .push(notification.clone());
        Ok(())
    }

    async fn list_pending_notifications(&self, limit: i64) -> BillingResult<Vec<Notification>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .inner
            .read()
            .await
            .notifications
            .iter()
            .filter(|n| n.status == NotificationStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn record_notification_attempt(
        &self,
        notification_id: Uuid,
        error: Option<&str>,
        max_attempts: i32,
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(n) = inner
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
        {
            n.attempts += 1;
            match error {
                None => {
                    n.status = NotificationStatus::Sent;
                    n.sent_at = Some(OffsetDateTime::now_utc());
                    n.last_error = None;
                }
                Some(error) => {
                    n.last_error = Some(error.to_string());
                    if n.attempts >= max_attempts {
                        n.status = NotificationStatus::Failed;
                    }
                }
            }
        }
        Ok(())
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        stale_after: time::Duration,
    ) -> BillingResult<ClaimOutcome> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.write().await;

        match inner.webhook_events.get_mut(event_id) {
            None => {
                inner.webhook_events.insert(
                    event_id.to_string(),
                    WebhookEventRecord {
                        id: Uuid::new_v4(),
                        external_event_id: event_id.to_string(),
                        event_type: event_type.to_string(),
                        payload: payload.clone(),
                        processing_result: ProcessingResult::Processing,
                        processing_started_at: Some(now),
                        error_message: None,
                        replay_attempts: 0,
                        created_at: now,
                    },
                );
                Ok(ClaimOutcome::Claimed)
            }
            Some(record) => {
                let stale = record.processing_result == ProcessingResult::Processing
                    && record
                        .processing_started_at
                        .is_some_and(|started| started < now - stale_after);
                if record.processing_result == ProcessingResult::Error || stale {
                    record.processing_result = ProcessingResult::Processing;
                    record.processing_started_at = Some(now);
                    Ok(ClaimOutcome::Claimed)
                } else {
                    Ok(ClaimOutcome::Duplicate(record.processing_result))
                }
            }
        }
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.webhook_events.get_mut(event_id) {
            record.processing_result = result;
            record.error_message = error_message.map(str::to_string);
            if result == ProcessingResult::Processing {
                record.processing_started_at = Some(OffsetDateTime::now_utc());
            }
        }
        Ok(())
    }

    async fn get_webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self.inner.read().await.webhook_events.get(event_id).cloned())
    }

    async fn list_webhook_events(
        &self,
        result: Option<ProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let inner = self.inner.read().await;
        let mut events: Vec<WebhookEventRecord> = inner
            .webhook_events
            .values()
            .filter(|e| result.map_or(true, |r| e.processing_result == r))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(events)
    }

    async fn list_replayable_webhook_events(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let inner = self.inner.read().await;
        let mut events: Vec<WebhookEventRecord> = inner
            .webhook_events
            .values()
            .filter(|e| {
                e.processing_result == ProcessingResult::Error && e.replay_attempts < max_attempts
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        events.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(events)
    }

    async fn record_replay_attempt(
        &self,
        event_id: &str,
        max_attempts: i32,
    ) -> BillingResult<ProcessingResult> {
        let mut inner = self.inner.write().await;
        let record = inner
            .webhook_events
            .get_mut(event_id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", event_id)))?;
        record.replay_attempts += 1;
        if record.processing_result == ProcessingResult::Error
            && record.replay_attempts >= max_attempts
        {
            record.processing_result = ProcessingResult::Failed;
        }
        Ok(record.processing_result)
    }

    async fn record_deposit_lead(&self, lead: &DepositLead) -> BillingResult<bool> {
        let mut inner = self.inner.write().await;
        if inner.deposit_leads.contains_key(&lead.external_session_id) {
            return Ok(false);
        }
        inner
            .deposit_leads
            .insert(lead.external_session_id.clone(), lead.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order(session: &str, owner: Uuid) -> NewOrder {
        NewOrder {
            external_session_id: session.into(),
            external_customer_id: "cus_1".into(),
            product_type: "website".into(),
            amount_cents: 89900,
            customer_email: "a@x.com".into(),
            customer_name: None,
            user_id: Some(owner),
            project_id: None,
        }
    }

    #[tokio::test]
    async fn test_second_order_for_session_is_rejected() {
        let store = MemoryBillingStore::new();
        let owner = Uuid::new_v4();
        store.insert_order(&new_order("cs_1", owner)).await.unwrap();

        let err = store.insert_order(&new_order("cs_1", owner)).await.unwrap_err();
        assert!(matches!(err, BillingError::OrderAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_expected_status() {
        let store = MemoryBillingStore::new();
        let order = store
            .insert_order(&new_order("cs_1", Uuid::new_v4()))
            .await
            .unwrap();

        let paid = OrderResolution::new(OrderStatus::Paid);
        assert!(store
            .compare_and_set_order_status(order.id, OrderStatus::Pending, &paid)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .compare_and_set_order_status(order.id, OrderStatus::Pending, &paid)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_claim_allows_retry_after_error_only() {
        let store = MemoryBillingStore::new();
        let payload = serde_json::json!({});
        let stale = time::Duration::minutes(30);

        assert_eq!(
            store.claim_webhook_event("evt_1", "x", &payload, stale).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            store.claim_webhook_event("evt_1", "x", &payload, stale).await.unwrap(),
            ClaimOutcome::Duplicate(ProcessingResult::Processing)
        );

        store
            .finish_webhook_event("evt_1", ProcessingResult::Error, Some("boom"))
            .await
            .unwrap();
        assert_eq!(
            store.claim_webhook_event("evt_1", "x", &payload, stale).await.unwrap(),
            ClaimOutcome::Claimed
        );

        store
            .finish_webhook_event("evt_1", ProcessingResult::Success, None)
            .await
            .unwrap();
        assert_eq!(
            store.claim_webhook_event("evt_1", "x", &payload, stale).await.unwrap(),
            ClaimOutcome::Duplicate(ProcessingResult::Success)
        );
    }

    #[tokio::test]
    async fn test_replay_attempts_cap_marks_event_failed() {
        let store = MemoryBillingStore::new();
        let payload = serde_json::json!({});
        let stale = time::Duration::minutes(30);

        store.claim_webhook_event("evt_1", "x", &payload, stale).await.unwrap();
        store
            .finish_webhook_event("evt_1", ProcessingResult::Error, Some("boom"))
            .await
            .unwrap();

        assert_eq!(
            store.record_replay_attempt("evt_1", 2).await.unwrap(),
            ProcessingResult::Error
        );
        assert_eq!(store.list_replayable_webhook_events(2, 10).await.unwrap().len(), 1);

        assert_eq!(
            store.record_replay_attempt("evt_1", 2).await.unwrap(),
            ProcessingResult::Failed
        );
        assert!(store.list_replayable_webhook_events(2, 10).await.unwrap().is_empty());

        // A given-up event is terminal for redeliveries too
        assert_eq!(
            store.claim_webhook_event("evt_1", "x", &payload, stale).await.unwrap(),
            ClaimOutcome::Duplicate(ProcessingResult::Failed)
        );
    }

    #[tokio::test]
    async fn test_replayable_events_are_oldest_first() {
        let store = MemoryBillingStore::new();
        let payload = serde_json::json!({});
        let stale = time::Duration::minutes(30);

        for id in ["evt_a", "evt_b", "evt_c"] {
            store.claim_webhook_event(id, "x", &payload, stale).await.unwrap();
            store
                .finish_webhook_event(id, ProcessingResult::Error, Some("boom"))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let events = store.list_replayable_webhook_events(5, 2).await.unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.external_event_id.as_str()).collect();
        assert_eq!(ids, vec!["evt_a", "evt_b"]);
    }

    #[tokio::test]
    async fn test_setup_invoice_lease_is_exclusive_until_released() {
        let store = MemoryBillingStore::new();
        let project = Project::new(Uuid::new_v4(), "Site", "a@x.com");
        store.insert_project(&project).await.unwrap();
        let ttl = time::Duration::minutes(2);

        assert!(store.claim_setup_invoice_lease(project.id, ttl).await.unwrap());
        assert!(!store.claim_setup_invoice_lease(project.id, ttl).await.unwrap());

        store.release_setup_invoice_lease(project.id).await.unwrap();
        assert!(store.claim_setup_invoice_lease(project.id, ttl).await.unwrap());

        // An expired lease can be taken over
        store.release_setup_invoice_lease(project.id).await.unwrap();
        assert!(store
            .claim_setup_invoice_lease(project.id, time::Duration::ZERO)
            .await
            .unwrap());
        assert!(store.claim_setup_invoice_lease(project.id, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_role_grant_is_insert_if_absent() {
        let store = MemoryBillingStore::new();
        let user = Uuid::new_v4();
        assert!(store.grant_role_if_absent(user, "client").await.unwrap());
        assert!(!store.grant_role_if_absent(user, "admin").await.unwrap());
        assert_eq!(store.get_role(user).await.unwrap().as_deref(), Some("client"));
    }
}
