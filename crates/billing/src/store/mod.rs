//! Persistence port for the billing ledgers
//!
//! Every method is a single-entity operation that is atomic on its own:
//! insert-if-absent, compare-and-set on a status, or a patch applied under a
//! row lock. Callers never hold a transaction across methods.

mod memory;
mod postgres;

pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::customer::CustomerRecord;
use crate::error::BillingResult;
use crate::notifications::Notification;
use crate::orders::{NewOrder, Order, OrderResolution, OrderStatus};
use crate::projects::{Project, SetupInvoiceState, SetupInvoiceStatus};
use crate::subscriptions::{NewSubscription, Subscription, SubscriptionChange, SubscriptionPatch};
use crate::webhooks::{ClaimOutcome, DepositLead, ProcessingResult, WebhookEventRecord};

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Customers

    async fn get_customer(&self, external_customer_id: &str) -> BillingResult<Option<CustomerRecord>>;

    /// The non-duplicate record for a normalized email
    async fn find_canonical_customer_by_email(
        &self,
        email: &str,
    ) -> BillingResult<Option<CustomerRecord>>;

    /// Insert a customer unless the id is already known. A new record becomes
    /// a duplicate when another canonical record owns the email. Returns the
    /// stored record either way.
    async fn insert_customer_if_absent(
        &self,
        external_customer_id: &str,
        email: &str,
    ) -> BillingResult<CustomerRecord>;

    /// Set `linked_user_id` only if it is empty. Returns whether it was set.
    async fn link_customer_user(
        &self,
        external_customer_id: &str,
        user_id: Uuid,
    ) -> BillingResult<bool>;

    // Orders

    /// Fails with `OrderAlreadyExists` when the session already has an order
    async fn insert_order(&self, order: &NewOrder) -> BillingResult<Order>;

    async fn get_order(&self, order_id: Uuid) -> BillingResult<Option<Order>>;

    async fn get_order_by_session(&self, session_id: &str) -> BillingResult<Option<Order>>;

    async fn get_order_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<Order>>;

    /// Apply a resolution only if the order is still in `expected` status.
    /// `paid_at` defaults to now when moving to paid. Returns the updated
    /// order, or `None` if the status had already changed.
    async fn compare_and_set_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        resolution: &OrderResolution,
    ) -> BillingResult<Option<Order>>;

    /// Delete an order only while it is pending and owned by `owner`
    async fn delete_pending_order(&self, order_id: Uuid, owner: Uuid) -> BillingResult<bool>;

    // Subscriptions

    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<Option<Subscription>>;

    /// Insert, or merge into the existing row as a patch
    async fn upsert_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> BillingResult<SubscriptionChange>;

    /// Patch an existing row under lock. `None` if the subscription is unknown.
    async fn patch_subscription(
        &self,
        subscription_id: &str,
        patch: &SubscriptionPatch,
    ) -> BillingResult<Option<SubscriptionChange>>;

    async fn list_subscriptions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>>;

    async fn list_subscriptions_for_customer(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Vec<Subscription>>;

    // Projects

    async fn insert_project(&self, project: &Project) -> BillingResult<()>;

    async fn get_project(&self, project_id: Uuid) -> BillingResult<Option<Project>>;

    async fn find_project_by_setup_invoice(&self, invoice_id: &str)
        -> BillingResult<Option<Project>>;

    /// Replace the setup-invoice state if the current status is one of
    /// `expected`. Returns the updated project, or `None` on mismatch.
    async fn compare_and_set_setup_invoice(
        &self,
        project_id: Uuid,
        expected: &[SetupInvoiceStatus],
        next: &SetupInvoiceState,
    ) -> BillingResult<Option<Project>>;

    /// Take the per-project lease that serializes setup-invoice replacement.
    /// Returns `false` while another holder's lease is unexpired.
    async fn claim_setup_invoice_lease(
        &self,
        project_id: Uuid,
        ttl: time::Duration,
    ) -> BillingResult<bool>;

    async fn release_setup_invoice_lease(&self, project_id: Uuid) -> BillingResult<()>;

    /// Set `payment_status = paid` if not already paid. Returns whether it changed.
    async fn mark_project_paid(&self, project_id: Uuid) -> BillingResult<bool>;

    // Access roles

    /// Returns whether a grant was created
    async fn grant_role_if_absent(&self, user_id: Uuid, role: &str) -> BillingResult<bool>;

    async fn get_role(&self, user_id: Uuid) -> BillingResult<Option<String>>;

    // Notification outbox

    async fn enqueue_notification(&self, notification: &Notification) -> BillingResult<()>;

    /// Pending notifications, oldest first
    async fn list_pending_notifications(&self, limit: i64) -> BillingResult<Vec<Notification>>;

    /// Record one delivery attempt. `error == None` marks the row sent;
    /// otherwise it stays pending until `max_attempts`, then becomes failed.
    async fn record_notification_attempt(
        &self,
        notification_id: Uuid,
        error: Option<&str>,
        max_attempts: i32,
    ) -> BillingResult<()>;

    // Webhook event log

    /// Claim an event for processing. New events, events that ended in
    /// `error`, and events stuck in `processing` longer than `stale_after`
    /// are claimable.
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        stale_after: time::Duration,
    ) -> BillingResult<ClaimOutcome>;

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    async fn get_webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;

    /// Newest first, optionally filtered by result
    async fn list_webhook_events(
        &self,
        result: Option<ProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Events in `error` with fewer than `max_attempts` replays, oldest first
    async fn list_replayable_webhook_events(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Count one replay. An event still in `error` once it reaches
    /// `max_attempts` becomes `failed`. Returns the resulting status.
    async fn record_replay_attempt(
        &self,
        event_id: &str,
        max_attempts: i32,
    ) -> BillingResult<ProcessingResult>;

    // Deposit leads

    /// Returns whether the lead was new
    async fn record_deposit_lead(&self, lead: &DepositLead) -> BillingResult<bool>;
}
