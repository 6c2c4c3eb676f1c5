//! Stripe webhook ingestion and dispatch
//!
//! Every verified event is claimed in the webhook log before dispatch so that
//! concurrent duplicate deliveries are processed once. Handlers stay idempotent
//! on their own: each one keys its mutation off a stable external id and
//! performs a conditional write, so replays converge regardless of the log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::customer::CustomerRegistry;
use crate::error::{BillingError, BillingResult};
use crate::orders::{OrderLedger, OrderResolution, OrderStatus, ResolveOutcome};
use crate::provider::{
    CHECKOUT_TYPE_DEPOSIT, DEAL_TYPE_CUSTOM, INVOICE_TYPE_SETUP_FEE, META_CANCEL_AT,
    META_CHECKOUT_TYPE, META_DEAL_TYPE, META_INVOICE_TYPE, META_PROJECT_ID, META_USER_ID,
};
use crate::setup_invoice::SetupInvoiceFlow;
use crate::signature::verify_signature;
use crate::store::BillingStore;
use crate::subscriptions::{
    estimate_renewal_window, IntervalUnit, NewSubscription, SubscriptionLedger,
    SubscriptionPatch, SubscriptionStatus,
};
use crate::webhook_types::{
    ChargeObject, CheckoutSessionObject, EventEnvelope, InvoiceObject, PriceObject,
    SubscriptionObject, WebhookEvent,
};

/// Events stuck in `processing` longer than this may be claimed again
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Replays of an event in `error` before it is marked `failed`
pub const MAX_REPLAY_ATTEMPTS: i32 = 10;

const BILLING_REASON_SUBSCRIPTION_CREATE: &str = "subscription_create";
const BILLING_REASON_SUBSCRIPTION_CYCLE: &str = "subscription_cycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingResult {
    Processing,
    Success,
    Ignored,
    Error,
    /// Still erroring after `MAX_REPLAY_ATTEMPTS` replays. Terminal.
    Failed,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Processing => "processing",
            ProcessingResult::Success => "success",
            ProcessingResult::Ignored => "ignored",
            ProcessingResult::Error => "error",
            ProcessingResult::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "processing" => Ok(ProcessingResult::Processing),
            "success" => Ok(ProcessingResult::Success),
            "ignored" => Ok(ProcessingResult::Ignored),
            "error" => Ok(ProcessingResult::Error),
            "failed" => Ok(ProcessingResult::Failed),
            other => Err(BillingError::InvalidInput(format!(
                "unknown processing result '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ProcessingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of trying to claim an event for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Someone else owns or already finished the event
    Duplicate(ProcessingResult),
}

/// Stored webhook event record
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub external_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processing_result: ProcessingResult,
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub replay_attempts: i32,
    pub created_at: OffsetDateTime,
}

/// A deposit checkout, kept outside the ledgers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepositLead {
    pub external_session_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub amount_cents: i64,
    pub metadata: serde_json::Value,
}

/// What a verified delivery did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A ledger entry changed
    Applied,
    /// The event was valid but the ledger already reflected it
    NoOp,
    /// Acknowledged without a ledger effect
    Ignored(String),
    /// Already processed or being processed by another delivery
    Duplicate,
}

/// Result of a webhook replay operation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReplayResult {
    pub record_id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub previous_status: ProcessingResult,
    pub previous_error: Option<String>,
    pub new_status: ProcessingResult,
    pub new_error: Option<String>,
    pub success: bool,
}

#[derive(Clone)]
pub struct WebhookHandler {
    webhook_secret: String,
    tolerance_secs: i64,
    store: Arc<dyn BillingStore>,
    customers: CustomerRegistry,
    orders: OrderLedger,
    subscriptions: SubscriptionLedger,
    setup_invoices: SetupInvoiceFlow,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: &str,
        tolerance_secs: i64,
        store: Arc<dyn BillingStore>,
        customers: CustomerRegistry,
        orders: OrderLedger,
        subscriptions: SubscriptionLedger,
        setup_invoices: SetupInvoiceFlow,
    ) -> Self {
        Self {
            webhook_secret: webhook_secret.to_string(),
            tolerance_secs,
            store,
            customers,
            orders,
            subscriptions,
            setup_invoices,
        }
    }

    /// Verify the signature over the raw body and parse the envelope.
    /// Nothing is written before this succeeds.
    pub fn verify_event(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<EventEnvelope> {
        let Some(signature) = signature else {
            tracing::warn!("Webhook request without Stripe-Signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        };

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, &self.webhook_secret, self.tolerance_secs, now)
            .inspect_err(|_| {
                tracing::warn!(payload_len = payload.len(), "Webhook signature rejected");
            })?;

        let envelope: EventEnvelope = serde_json::from_slice(payload).map_err(|e| {
            BillingError::WebhookPayloadInvalid(format!("event envelope: {}", e))
        })?;

        tracing::debug!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "Webhook signature verified"
        );

        Ok(envelope)
    }

    /// Handle a verified event.
    ///
    /// Claims the event atomically in the webhook log so concurrent
    /// deliveries of the same event dispatch once. Returns an error only for
    /// failures the processor should retry.
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> BillingResult<DispatchOutcome> {
        let payload = serde_json::to_value(envelope)?;

        let claim = self
            .store
            .claim_webhook_event(
                &envelope.id,
                &envelope.event_type,
                &payload,
                time::Duration::minutes(PROCESSING_TIMEOUT_MINUTES),
            )
            .await
            .inspect_err(|e| {
                tracing::error!(
                    event_id = %envelope.id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
            })?;

        if let ClaimOutcome::Duplicate(existing) = claim {
            tracing::info!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                existing_result = %existing,
                "Duplicate webhook event, skipping dispatch"
            );
            return Ok(DispatchOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(envelope).await;
        let (processing_result, error_message) = settle(&result);
        self.record_result(&envelope.id, processing_result, error_message.as_deref())
            .await;

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) if !e.is_retryable() => {
                tracing::warn!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Webhook event acknowledged without effect"
                );
                Ok(DispatchOutcome::Ignored(e.to_string()))
            }
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Webhook processing failed, processor will retry"
                );
                Err(e)
            }
        }
    }

    /// Route a parsed event to its ledger mutation
    pub async fn process_event(&self, envelope: &EventEnvelope) -> BillingResult<DispatchOutcome> {
        match WebhookEvent::from_envelope(envelope)? {
            WebhookEvent::CheckoutCompleted(session) => {
                self.handle_checkout_completed(&session).await
            }
            WebhookEvent::CheckoutAsyncPaymentSucceeded(session) => {
                if is_deposit(&session) {
                    return self.record_deposit(&session).await;
                }
                self.resolve_session(&session, OrderStatus::Paid).await
            }
            WebhookEvent::CheckoutAsyncPaymentFailed(session)
            | WebhookEvent::CheckoutExpired(session) => {
                if is_deposit(&session) || !is_payment_mode(&session) {
                    return Ok(DispatchOutcome::Ignored(
                        "session has no order to fail".to_string(),
                    ));
                }
                self.resolve_session(&session, OrderStatus::Failed).await
            }
            WebhookEvent::InvoicePaid(invoice) => self.handle_invoice_paid(&invoice).await,
            WebhookEvent::SubscriptionCreated(sub) => self.handle_subscription_created(&sub).await,
            WebhookEvent::SubscriptionUpdated(sub) => self.handle_subscription_updated(&sub).await,
            WebhookEvent::SubscriptionDeleted(sub) => self.handle_subscription_deleted(&sub).await,
            WebhookEvent::ChargeRefunded(charge) => self.handle_charge_refunded(&charge).await,
            WebhookEvent::Unhandled(event_type) => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event type");
                Ok(DispatchOutcome::Ignored(format!(
                    "unhandled event type {}",
                    event_type
                )))
            }
        }
    }

    async fn record_result(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) {
        // Retry once; the log feeds replay and audits
        for attempt in 1..=2 {
            match self
                .store
                .finish_webhook_event(event_id, result, error_message)
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!(
                        event_id = %event_id,
                        result = %result,
                        attempt,
                        error = %e,
                        "Failed to record webhook processing result"
                    );
                }
            }
        }
    }

    // ============ CHECKOUT ============

    async fn handle_checkout_completed(
        &self,
        session: &CheckoutSessionObject,
    ) -> BillingResult<DispatchOutcome> {
        if is_deposit(session) {
            if !session.is_paid() {
                return Ok(DispatchOutcome::NoOp);
            }
            return self.record_deposit(session).await;
        }

        if !is_payment_mode(session) {
            // Subscription checkouts create their ledger entry on invoice.paid;
            // here we only learn which user owns the customer.
            return self.link_checkout_customer(session).await;
        }

        if !session.is_paid() {
            tracing::info!(
                session_id = %session.id,
                payment_status = ?session.payment_status,
                "Checkout completed with payment pending, awaiting async result"
            );
            return Ok(DispatchOutcome::NoOp);
        }

        self.resolve_session(session, OrderStatus::Paid).await
    }

    async fn resolve_session(
        &self,
        session: &CheckoutSessionObject,
        status: OrderStatus,
    ) -> BillingResult<DispatchOutcome> {
        let mut resolution = OrderResolution::new(status);
        if status == OrderStatus::Paid {
            resolution.payment_intent_id = session.payment_intent.clone();
        }

        match self.orders.resolve_order(&session.id, resolution).await {
            Ok(outcome) => Ok(from_resolve(&outcome)),
            // The owner cancelled the order, which expires its session
            Err(BillingError::OrderNotFound(_)) if status == OrderStatus::Failed => {
                tracing::info!(
                    session_id = %session.id,
                    "Session closed for an order that no longer exists"
                );
                Ok(DispatchOutcome::Ignored(
                    "no order for session, cancelled by owner".to_string(),
                ))
            }
            Err(e) => Err(e),
        }
    }

    async fn link_checkout_customer(
        &self,
        session: &CheckoutSessionObject,
    ) -> BillingResult<DispatchOutcome> {
        let (Some(customer_id), Some(email)) = (session.customer.as_deref(), session.email())
        else {
            return Ok(DispatchOutcome::Ignored(
                "subscription checkout without customer".to_string(),
            ));
        };

        let user_id = metadata_uuid(&session.metadata, META_USER_ID);
        let before = self.customers.resolve(Some(customer_id), None).await?;
        let record = self
            .customers
            .record_customer(customer_id, email, user_id)
            .await?;

        let linked_now = before.and_then(|b| b.linked_user_id).is_none()
            && record.linked_user_id.is_some();

        // invoice.paid may have created the subscription before this event
        // named its user
        let mut subscriptions_linked = false;
        if let Some(user_id) = record.linked_user_id {
            for change in self
                .subscriptions
                .link_customer_subscriptions(customer_id, user_id)
                .await?
            {
                subscriptions_linked |= change.previous.as_ref() != Some(&change.current);
            }
        }

        Ok(if linked_now || subscriptions_linked {
            DispatchOutcome::Applied
        } else {
            DispatchOutcome::NoOp
        })
    }

    async fn record_deposit(
        &self,
        session: &CheckoutSessionObject,
    ) -> BillingResult<DispatchOutcome> {
        let lead = DepositLead {
            external_session_id: session.id.clone(),
            email: session.email().map(str::to_string),
            name: session.name().map(str::to_string),
            amount_cents: session.amount_total.unwrap_or(0),
            metadata: serde_json::to_value(&session.metadata)?,
        };

        let created = self.store.record_deposit_lead(&lead).await?;
        if created {
            tracing::info!(
                session_id = %session.id,
                amount_cents = lead.amount_cents,
                "Recorded deposit lead"
            );
            Ok(DispatchOutcome::Applied)
        } else {
            Ok(DispatchOutcome::NoOp)
        }
    }

    // ============ INVOICES ============

    async fn handle_invoice_paid(&self, invoice: &InvoiceObject) -> BillingResult<DispatchOutcome> {
        if invoice.metadata.get(META_INVOICE_TYPE).map(String::as_str)
            == Some(INVOICE_TYPE_SETUP_FEE)
        {
            let project_hint = metadata_uuid(&invoice.metadata, META_PROJECT_ID);
            let transition = self
                .setup_invoices
                .mark_paid_from_provider(&invoice.id, project_hint)
                .await?;
            return Ok(if transition.transitioned() {
                DispatchOutcome::Applied
            } else {
                DispatchOutcome::NoOp
            });
        }

        match invoice.billing_reason.as_deref() {
            Some(BILLING_REASON_SUBSCRIPTION_CREATE) => {
                self.create_subscription_from_invoice(invoice).await
            }
            Some(BILLING_REASON_SUBSCRIPTION_CYCLE) => {
                self.renew_subscription_from_invoice(invoice).await
            }
            other => Ok(DispatchOutcome::Ignored(format!(
                "invoice billing reason {:?} has no ledger effect",
                other
            ))),
        }
    }

    async fn create_subscription_from_invoice(
        &self,
        invoice: &InvoiceObject,
    ) -> BillingResult<DispatchOutcome> {
        let new_subscription = self.subscription_from_invoice(invoice).await?;
        let change = self
            .subscriptions
            .upsert_subscription(new_subscription)
            .await?;
        Ok(if change.previous.as_ref() == Some(&change.current) {
            DispatchOutcome::NoOp
        } else {
            DispatchOutcome::Applied
        })
    }

    async fn renew_subscription_from_invoice(
        &self,
        invoice: &InvoiceObject,
    ) -> BillingResult<DispatchOutcome> {
        let Some(subscription_id) = invoice.subscription.as_deref() else {
            return Ok(DispatchOutcome::Ignored(
                "renewal invoice without subscription".to_string(),
            ));
        };

        let (start, end, price) = invoice_period(invoice)?;
        let patch = SubscriptionPatch {
            status: Some(SubscriptionStatus::Active),
            price_id: price.map(|p| p.id.clone()),
            current_period_start: Some(start),
            current_period_end: Some(end),
            ..Default::default()
        };

        match self.subscriptions.patch_subscription(subscription_id, patch).await {
            Ok(_) => Ok(DispatchOutcome::Applied),
            Err(BillingError::SubscriptionNotFound(_)) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    invoice_id = %invoice.id,
                    "Renewal for subscription missing from ledger, creating it"
                );
                self.create_subscription_from_invoice(invoice).await
            }
            Err(e) => Err(e),
        }
    }

    async fn subscription_from_invoice(
        &self,
        invoice: &InvoiceObject,
    ) -> BillingResult<NewSubscription> {
        let subscription_id = invoice.subscription.clone().ok_or_else(|| {
            BillingError::WebhookPayloadInvalid(format!(
                "invoice {} has no subscription",
                invoice.id
            ))
        })?;
        let customer_id = invoice.customer.clone().ok_or_else(|| {
            BillingError::WebhookPayloadInvalid(format!("invoice {} has no customer", invoice.id))
        })?;

        let (start, end, price) = invoice_period(invoice)?;
        let price_id = price.map(|p| p.id.clone()).ok_or_else(|| {
            BillingError::WebhookPayloadInvalid(format!("invoice {} has no price", invoice.id))
        })?;

        let known = self.customers.resolve(Some(&customer_id), None).await?;
        let email = invoice
            .customer_email
            .clone()
            .or_else(|| known.as_ref().map(|c| c.email.clone()))
            .ok_or_else(|| {
                BillingError::WebhookPayloadInvalid(format!(
                    "invoice {} has no customer email",
                    invoice.id
                ))
            })?;

        let user_id = match metadata_uuid(&invoice.metadata, META_USER_ID) {
            Some(user_id) => Some(user_id),
            None => {
                self.customers
                    .linked_user(Some(&customer_id), Some(&email))
                    .await?
            }
        };

        if known.is_none() {
            self.customers
                .record_customer(&customer_id, &email, user_id)
                .await?;
        }

        Ok(NewSubscription {
            external_subscription_id: subscription_id,
            external_customer_id: customer_id,
            price_id,
            status: SubscriptionStatus::Active,
            current_period_start: start,
            current_period_end: end,
            cancel_at_period_end: false,
            customer_email: email,
            user_id,
        })
    }

    // ============ SUBSCRIPTIONS ============

    async fn handle_subscription_created(
        &self,
        sub: &SubscriptionObject,
    ) -> BillingResult<DispatchOutcome> {
        if sub.metadata.get(META_DEAL_TYPE).map(String::as_str) != Some(DEAL_TYPE_CUSTOM) {
            return Ok(DispatchOutcome::Ignored(
                "subscription is created from its first paid invoice".to_string(),
            ));
        }

        let Some(raw) = sub.metadata.get(META_CANCEL_AT) else {
            tracing::warn!(
                subscription_id = %sub.id,
                "Custom deal subscription without cancel_at metadata"
            );
            return Ok(DispatchOutcome::Ignored(
                "custom deal without cancel_at".to_string(),
            ));
        };

        let cancel_at = raw
            .parse::<i64>()
            .map_err(|_| {
                BillingError::WebhookPayloadInvalid(format!("cancel_at '{}' is not a timestamp", raw))
            })
            .and_then(timestamp)?;

        if sub.cancel_at.is_some_and(|existing| existing == cancel_at.unix_timestamp()) {
            return Ok(DispatchOutcome::NoOp);
        }

        self.subscriptions
            .apply_cancel_at(&sub.id, cancel_at)
            .await?;
        Ok(DispatchOutcome::Applied)
    }

    async fn handle_subscription_updated(
        &self,
        sub: &SubscriptionObject,
    ) -> BillingResult<DispatchOutcome> {
        let patch = patch_from_subscription(sub)?;
        if patch.is_empty() {
            return Ok(DispatchOutcome::NoOp);
        }

        match self.subscriptions.patch_subscription(&sub.id, patch).await {
            Ok(change) => Ok(if change.previous.as_ref() == Some(&change.current) {
                DispatchOutcome::NoOp
            } else {
                DispatchOutcome::Applied
            }),
            Err(BillingError::SubscriptionNotFound(_)) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    "Update for subscription not in ledger, acknowledging"
                );
                Ok(DispatchOutcome::Ignored(format!(
                    "subscription {} not in ledger",
                    sub.id
                )))
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_subscription_deleted(
        &self,
        sub: &SubscriptionObject,
    ) -> BillingResult<DispatchOutcome> {
        let patch = SubscriptionPatch::status(SubscriptionStatus::Canceled);
        match self.subscriptions.patch_subscription(&sub.id, patch).await {
            Ok(change) => {
                let already = change
                    .previous
                    .as_ref()
                    .is_some_and(|p| p.status == SubscriptionStatus::Canceled);
                Ok(if already {
                    DispatchOutcome::NoOp
                } else {
                    DispatchOutcome::Applied
                })
            }
            Err(BillingError::SubscriptionNotFound(_)) => {
                tracing::warn!(
                    subscription_id = %sub.id,
                    "Deleted subscription not in ledger, acknowledging"
                );
                Ok(DispatchOutcome::Ignored(format!(
                    "subscription {} not in ledger",
                    sub.id
                )))
            }
            Err(e) => Err(e),
        }
    }

    // ============ REFUNDS ============

    async fn handle_charge_refunded(
        &self,
        charge: &ChargeObject,
    ) -> BillingResult<DispatchOutcome> {
        if !charge.refunded {
            return Ok(DispatchOutcome::Ignored("partial refund".to_string()));
        }
        let Some(payment_intent) = charge.payment_intent.as_deref() else {
            return Ok(DispatchOutcome::Ignored(
                "refunded charge without payment intent".to_string(),
            ));
        };

        match self
            .orders
            .resolve_by_payment_intent(payment_intent, OrderResolution::new(OrderStatus::Refunded))
            .await?
        {
            Some(outcome) => Ok(from_resolve(&outcome)),
            None => {
                tracing::warn!(
                    charge_id = %charge.id,
                    payment_intent_id = %payment_intent,
                    "Refund for payment intent with no order"
                );
                Ok(DispatchOutcome::Ignored(
                    "no order for payment intent".to_string(),
                ))
            }
        }
    }

    // ============ WEBHOOK REPLAY FUNCTIONALITY ============

    /// List logged webhook events, newest first
    pub async fn list_webhooks(
        &self,
        status_filter: Option<ProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store.list_webhook_events(status_filter, limit).await
    }

    /// Re-process a logged event from its stored payload
    pub async fn replay_webhook(&self, stripe_event_id: &str) -> BillingResult<WebhookReplayResult> {
        tracing::info!(
            stripe_event_id = %stripe_event_id,
            "Attempting to replay webhook event"
        );

        let record = self
            .store
            .get_webhook_event(stripe_event_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "Webhook event {} not found in database",
                    stripe_event_id
                ))
            })?;

        let envelope: EventEnvelope = serde_json::from_value(record.payload.clone())?;

        let note = format!(
            "Replay initiated. Previous status: {}. Previous error: {}",
            record.processing_result,
            record.error_message.as_deref().unwrap_or("none")
        );
        self.store
            .finish_webhook_event(stripe_event_id, ProcessingResult::Processing, Some(&note))
            .await?;

        let result = self.process_event(&envelope).await;
        let (settled, new_error) = settle(&result);
        self.store
            .finish_webhook_event(stripe_event_id, settled, new_error.as_deref())
            .await?;
        let new_status = self
            .store
            .record_replay_attempt(stripe_event_id, MAX_REPLAY_ATTEMPTS)
            .await?;

        if new_status == ProcessingResult::Failed {
            tracing::error!(
                stripe_event_id = %stripe_event_id,
                event_type = %record.event_type,
                attempts = record.replay_attempts + 1,
                error = new_error.as_deref().unwrap_or("none"),
                "Webhook event still failing after replay limit, giving up"
            );
        }

        let success = !matches!(new_status, ProcessingResult::Error | ProcessingResult::Failed);
        tracing::info!(
            stripe_event_id = %stripe_event_id,
            previous_status = %record.processing_result,
            new_status = %new_status,
            success,
            "Webhook replay completed"
        );

        Ok(WebhookReplayResult {
            record_id: record.id,
            stripe_event_id: stripe_event_id.to_string(),
            event_type: record.event_type,
            previous_status: record.processing_result,
            previous_error: record.error_message,
            new_status,
            new_error,
            success,
        })
    }

    /// Replay events in `error` that are still under the replay limit,
    /// oldest first
    pub async fn replay_all_failed(&self, limit: i64) -> BillingResult<Vec<WebhookReplayResult>> {
        let failed = self
            .store
            .list_replayable_webhook_events(MAX_REPLAY_ATTEMPTS, limit)
            .await?;

        let mut results = Vec::with_capacity(failed.len());
        for record in failed {
            match self.replay_webhook(&record.external_event_id).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(
                        stripe_event_id = %record.external_event_id,
                        error = %e,
                        "Failed to replay webhook"
                    );
                    results.push(WebhookReplayResult {
                        record_id: record.id,
                        stripe_event_id: record.external_event_id,
                        event_type: record.event_type,
                        previous_status: record.processing_result,
                        previous_error: record.error_message,
                        new_status: ProcessingResult::Error,
                        new_error: Some(e.to_string()),
                        success: false,
                    });
                }
            }
        }

        Ok(results)
    }
}

/// Map a dispatch result to what the webhook log records
fn settle(result: &BillingResult<DispatchOutcome>) -> (ProcessingResult, Option<String>) {
    match result {
        Ok(DispatchOutcome::Applied) | Ok(DispatchOutcome::NoOp) | Ok(DispatchOutcome::Duplicate) => {
            (ProcessingResult::Success, None)
        }
        Ok(DispatchOutcome::Ignored(reason)) => (ProcessingResult::Ignored, Some(reason.clone())),
        Err(e) if !e.is_retryable() => (ProcessingResult::Ignored, Some(e.to_string())),
        Err(e) => (ProcessingResult::Error, Some(e.to_string())),
    }
}

fn from_resolve(outcome: &ResolveOutcome) -> DispatchOutcome {
    if outcome.transitioned() {
        DispatchOutcome::Applied
    } else {
        DispatchOutcome::NoOp
    }
}

fn is_deposit(session: &CheckoutSessionObject) -> bool {
    session.metadata.get(META_CHECKOUT_TYPE).map(String::as_str) == Some(CHECKOUT_TYPE_DEPOSIT)
}

/// One-time payment sessions; a missing mode is treated as payment
fn is_payment_mode(session: &CheckoutSessionObject) -> bool {
    session.mode.as_deref().map_or(true, |m| m == "payment")
}

fn metadata_uuid(
    metadata: &std::collections::HashMap<String, String>,
    key: &str,
) -> Option<Uuid> {
    metadata.get(key).and_then(|v| Uuid::parse_str(v).ok())
}

fn timestamp(ts: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|_| BillingError::WebhookPayloadInvalid(format!("timestamp {} out of range", ts)))
}

fn interval_of(price: Option<&PriceObject>) -> Option<(IntervalUnit, u32)> {
    let recurring = price?.recurring.as_ref()?;
    Some((IntervalUnit::parse(&recurring.interval)?, recurring.interval_count))
}

/// Period and price of the subscription line of an invoice
fn invoice_period(
    invoice: &InvoiceObject,
) -> BillingResult<(OffsetDateTime, OffsetDateTime, Option<&PriceObject>)> {
    let line = invoice.subscription_line().ok_or_else(|| {
        BillingError::WebhookPayloadInvalid(format!("invoice {} has no lines", invoice.id))
    })?;
    let price = line.price.as_ref();
    let period = line.period.ok_or_else(|| {
        BillingError::WebhookPayloadInvalid(format!("invoice {} line has no period", invoice.id))
    })?;
    let start = period.start.ok_or_else(|| {
        BillingError::WebhookPayloadInvalid(format!("invoice {} period has no start", invoice.id))
    })?;
    let start = timestamp(start)?;

    let end = match period.end {
        Some(end) => timestamp(end)?,
        None => estimate_renewal_window(start, interval_of(price)),
    };
    Ok((start, end, price))
}

/// Build a patch carrying only the fields the event reports
fn patch_from_subscription(sub: &SubscriptionObject) -> BillingResult<SubscriptionPatch> {
    let status = match sub.status.as_deref() {
        Some(raw) => {
            let mapped = SubscriptionStatus::from_provider(raw);
            if mapped.is_none() {
                tracing::warn!(
                    subscription_id = %sub.id,
                    status = %raw,
                    "Unrecognized subscription status, leaving status unchanged"
                );
            }
            mapped
        }
        None => None,
    };

    let start = sub.period_start().map(timestamp).transpose()?;
    let end = match (sub.period_end(), start) {
        (Some(end), _) => Some(timestamp(end)?),
        (None, Some(start)) => Some(estimate_renewal_window(start, interval_of(sub.price()))),
        (None, None) => None,
    };

    Ok(SubscriptionPatch {
        status,
        price_id: sub.price().map(|p| p.id.clone()),
        current_period_start: start,
        current_period_end: end,
        cancel_at_period_end: sub.cancel_at_period_end,
        cancel_at: sub.cancel_at.map(timestamp).transpose()?,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subscription(value: serde_json::Value) -> SubscriptionObject {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_patch_only_carries_reported_fields() {
        let patch = patch_from_subscription(&subscription(json!({
            "id": "sub_1",
            "status": "past_due"
        })))
        .unwrap();

        assert_eq!(patch.status, Some(SubscriptionStatus::PastDue));
        assert_eq!(patch.current_period_start, None);
        assert_eq!(patch.current_period_end, None);
        assert_eq!(patch.cancel_at_period_end, None);
        assert_eq!(patch.price_id, None);
    }

    #[test]
    fn test_patch_estimates_end_from_start_and_interval() {
        let patch = patch_from_subscription(&subscription(json!({
            "id": "sub_1",
            "current_period_start": 1_704_067_200,
            "items": { "data": [{
                "price": { "id": "price_year", "recurring": { "interval": "year" } }
            }]}
        })))
        .unwrap();

        let start = OffsetDateTime::from_unix_timestamp(1_704_067_200).unwrap();
        let end = patch.current_period_end.unwrap();
        assert_eq!(end.year(), start.year() + 1);
        assert_eq!(patch.price_id.as_deref(), Some("price_year"));
    }

    #[test]
    fn test_unknown_status_is_left_out() {
        let patch = patch_from_subscription(&subscription(json!({
            "id": "sub_1",
            "status": "something_new"
        })))
        .unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn test_settle_maps_errors_by_retryability() {
        let (result, _) = settle(&Err(BillingError::Database("down".into())));
        assert_eq!(result, ProcessingResult::Error);

        let (result, message) = settle(&Err(BillingError::WebhookPayloadInvalid("bad".into())));
        assert_eq!(result, ProcessingResult::Ignored);
        assert!(message.is_some());

        let (result, message) = settle(&Ok(DispatchOutcome::NoOp));
        assert_eq!(result, ProcessingResult::Success);
        assert!(message.is_none());
    }

    #[test]
    fn test_processing_result_round_trips() {
        for result in [
            ProcessingResult::Processing,
            ProcessingResult::Success,
            ProcessingResult::Ignored,
            ProcessingResult::Error,
            ProcessingResult::Failed,
        ] {
            assert_eq!(ProcessingResult::parse(result.as_str()).unwrap(), result);
        }
    }
}
