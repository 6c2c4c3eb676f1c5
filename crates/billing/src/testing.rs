//! In-process fakes for exercising the engine without Stripe or email
//!
//! Compiled for this crate's tests and, through the `testing` feature, for
//! downstream crates' tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::email::Notifier;
use crate::error::{BillingError, BillingResult};
use crate::notifications::Notification;
use crate::provider::{
    CheckoutSessionRequest, InvoiceRequest, PaymentProvider, ProviderCheckoutSession,
    ProviderCustomer, ProviderInvoice, ProviderInvoiceStatus,
};
use crate::store::MemoryBillingStore;
use crate::webhook_types::{EventData, EventEnvelope};
use crate::BillingService;

pub const TEST_WEBHOOK_SECRET: &str = "whsec_test_secret";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ProviderState {
    /// Newest first, as Stripe lists them
    customers: Vec<ProviderCustomer>,
    created_customers: Vec<ProviderCustomer>,
    invoices: Vec<(String, ProviderInvoice)>,
    voided: Vec<String>,
    deleted: Vec<String>,
    checkout_sessions: Vec<CheckoutSessionRequest>,
    completed_sessions: Vec<String>,
    expired_sessions: Vec<String>,
    cancel_at_calls: Vec<(String, OffsetDateTime)>,
    canceled_subscriptions: Vec<String>,
}

/// Payment provider that records every call
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
    counter: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Register a customer Stripe already knows. Appended to the end of the
    /// list, so seed newest first.
    pub fn seed_customer(&self, id: &str, email: &str) {
        lock(&self.state).customers.push(ProviderCustomer {
            id: id.to_string(),
            email: Some(email.to_string()),
        });
    }

    pub fn seed_invoice(&self, customer_id: &str, invoice: ProviderInvoice) {
        lock(&self.state)
            .invoices
            .push((customer_id.to_string(), invoice));
    }

    pub fn created_customers(&self) -> Vec<ProviderCustomer> {
        lock(&self.state).created_customers.clone()
    }

    pub fn checkout_sessions(&self) -> Vec<CheckoutSessionRequest> {
        lock(&self.state).checkout_sessions.clone()
    }

    /// Mark a session as paid so it can no longer be expired
    pub fn complete_checkout_session(&self, session_id: &str) {
        lock(&self.state)
            .completed_sessions
            .push(session_id.to_string());
    }

    pub fn expired_sessions(&self) -> Vec<String> {
        lock(&self.state).expired_sessions.clone()
    }

    pub fn voided_invoices(&self) -> Vec<String> {
        lock(&self.state).voided.clone()
    }

    pub fn deleted_invoices(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    /// Invoices that can still be paid
    pub fn payable_invoices(&self, customer_id: &str) -> Vec<ProviderInvoice> {
        lock(&self.state)
            .invoices
            .iter()
            .filter(|(c, i)| c == customer_id && i.status == ProviderInvoiceStatus::Open)
            .map(|(_, i)| i.clone())
            .collect()
    }

    pub fn cancel_at_calls(&self) -> Vec<(String, OffsetDateTime)> {
        lock(&self.state).cancel_at_calls.clone()
    }

    pub fn canceled_subscriptions(&self) -> Vec<String> {
        lock(&self.state).canceled_subscriptions.clone()
    }
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_customer(
        &self,
        email: &str,
        _name: Option<&str>,
        _user_id: Option<Uuid>,
    ) -> BillingResult<ProviderCustomer> {
        let customer = ProviderCustomer {
            id: self.next_id("cus"),
            email: Some(email.to_string()),
        };
        let mut state = lock(&self.state);
        state.customers.insert(0, customer.clone());
        state.created_customers.push(customer.clone());
        Ok(customer)
    }

    async fn list_customers_by_email(&self, email: &str) -> BillingResult<Vec<ProviderCustomer>> {
        Ok(lock(&self.state)
            .customers
            .iter()
            .filter(|c| c.email.as_deref() == Some(email))
            .cloned()
            .collect())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<ProviderCheckoutSession> {
        let id = self.next_id("cs_test");
        lock(&self.state).checkout_sessions.push(request.clone());
        Ok(ProviderCheckoutSession {
            url: Some(format!("https://checkout.stripe.test/{}", id)),
            id,
        })
    }

    async fn expire_checkout_session(&self, session_id: &str) -> BillingResult<()> {
        let mut state = lock(&self.state);
        if state.completed_sessions.iter().any(|s| s == session_id) {
            return Err(BillingError::StripeApi(format!(
                "checkout session {} is complete",
                session_id
            )));
        }
        if !state.expired_sessions.iter().any(|s| s == session_id) {
            state.expired_sessions.push(session_id.to_string());
        }
        Ok(())
    }

    async fn create_and_send_invoice(
        &self,
        request: &InvoiceRequest,
    ) -> BillingResult<ProviderInvoice> {
        let id = self.next_id("in");
        let invoice = ProviderInvoice {
            hosted_invoice_url: Some(format!("https://invoice.stripe.test/{}", id)),
            id,
            status: ProviderInvoiceStatus::Open,
            metadata: request.metadata.clone(),
        };
        lock(&self.state)
            .invoices
            .push((request.customer_id.clone(), invoice.clone()));
        Ok(invoice)
    }

    async fn list_invoices(
        &self,
        customer_id: &str,
        status: ProviderInvoiceStatus,
    ) -> BillingResult<Vec<ProviderInvoice>> {
        Ok(lock(&self.state)
            .invoices
            .iter()
            .filter(|(c, i)| c == customer_id && i.status == status)
            .map(|(_, i)| i.clone())
            .collect())
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice> {
        lock(&self.state)
            .invoices
            .iter()
            .map(|(_, i)| i)
            .find(|i| i.id == invoice_id)
            .cloned()
            .ok_or_else(|| BillingError::StripeApi(format!("no such invoice {}", invoice_id)))
    }

    async fn void_invoice(&self, invoice_id: &str) -> BillingResult<()> {
        let mut state = lock(&self.state);
        let invoice = state
            .invoices
            .iter_mut()
            .map(|(_, i)| i)
            .find(|i| i.id == invoice_id)
            .ok_or_else(|| BillingError::StripeApi(format!("no such invoice {}", invoice_id)))?;
        if invoice.status != ProviderInvoiceStatus::Open {
            return Err(BillingError::StripeApi(format!(
                "invoice {} is {}",
                invoice_id,
                invoice.status.as_str()
            )));
        }
        invoice.status = ProviderInvoiceStatus::Void;
        state.voided.push(invoice_id.to_string());
        Ok(())
    }

    async fn delete_invoice(&self, invoice_id: &str) -> BillingResult<()> {
        let mut state = lock(&self.state);
        let before = state.invoices.len();
        state
            .invoices
            .retain(|(_, i)| !(i.id == invoice_id && i.status == ProviderInvoiceStatus::Draft));
        if state.invoices.len() == before {
            return Err(BillingError::StripeApi(format!(
                "invoice {} is not a draft",
                invoice_id
            )));
        }
        state.deleted.push(invoice_id.to_string());
        Ok(())
    }

    async fn update_subscription_cancel_at(
        &self,
        subscription_id: &str,
        cancel_at: OffsetDateTime,
    ) -> BillingResult<()> {
        lock(&self.state)
            .cancel_at_calls
            .push((subscription_id.to_string(), cancel_at));
        Ok(())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        lock(&self.state)
            .canceled_subscriptions
            .push(subscription_id.to_string());
        Ok(())
    }
}

/// Notifier that records deliveries and can be switched to fail
#[derive(Default)]
pub struct RecordingNotifier {
    delivered: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn delivered(&self) -> Vec<Notification> {
        lock(&self.delivered).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, notification: &Notification) -> BillingResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BillingError::Notification("mail provider unavailable".to_string()));
        }
        lock(&self.delivered).push(notification.clone());
        Ok(())
    }
}

/// Configuration with a small product catalog and no real credentials
pub fn test_config() -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_fake".to_string(),
        webhook_secret: TEST_WEBHOOK_SECRET.to_string(),
        api_base: "http://stripe.invalid".to_string(),
        webhook_tolerance_secs: 300,
        setup_invoice_days_until_due: 14,
        default_access_role: "client".to_string(),
        currency: "usd".to_string(),
        checkout_success_url: "http://portal.test/success".to_string(),
        checkout_cancel_url: "http://portal.test/cancel".to_string(),
        product_prices: HashMap::from([
            ("website".to_string(), 89_900),
            ("audit".to_string(), 25_000),
        ]),
    }
}

/// A fully wired billing service over in-memory collaborators
pub struct TestHarness {
    pub store: Arc<MemoryBillingStore>,
    pub provider: Arc<FakeProvider>,
    pub notifier: Arc<RecordingNotifier>,
    pub service: BillingService,
}

impl TestHarness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryBillingStore::new());
        let provider = Arc::new(FakeProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let service = BillingService::new(
            test_config(),
            store.clone(),
            provider.clone(),
            notifier.clone(),
        );
        Self {
            store,
            provider,
            notifier,
            service,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an event envelope around a data object
pub fn event(id: &str, event_type: &str, object: serde_json::Value) -> EventEnvelope {
    EventEnvelope {
        id: id.to_string(),
        event_type: event_type.to_string(),
        created: OffsetDateTime::now_utc().unix_timestamp(),
        data: EventData { object },
    }
}
