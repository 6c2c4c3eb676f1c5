// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Service constructors wire several collaborators
#![allow(clippy::result_large_err)]
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Agency Billing Module
//!
//! Payment and fulfillment reconciliation against Stripe.
//!
//! ## Features
//!
//! - **Customer Registry**: email to Stripe customer, duplicate-aware
//! - **Order Ledger**: one-time checkout purchases and their outcome
//! - **Subscription Ledger**: mirror of recurring billing agreements
//! - **Setup Invoices**: manually confirmed setup fees for custom-deal projects
//! - **Webhooks**: verified, logged and replayable Stripe event dispatch
//! - **Fulfillment**: access grant, project payment and welcome notification,
//!   fired once per genuine transition
//! - **Invariants**: read-only consistency sweep over the ledgers

use std::sync::Arc;

use sqlx::PgPool;

pub mod checkout;
pub mod client;
pub mod customer;
pub mod email;
pub mod error;
pub mod fulfillment;
pub mod invariants;
pub mod notifications;
pub mod orders;
pub mod projects;
pub mod provider;
pub mod setup_invoice;
pub mod signature;
pub mod store;
pub mod subscriptions;
pub mod webhook_types;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{CheckoutRequest, CheckoutResponse, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Customer
pub use customer::{CustomerRecord, CustomerRegistry};

// Email
pub use email::{BillingEmailService, EmailConfig, Notifier};

// Error
pub use error::{BillingError, BillingResult};

// Fulfillment
pub use fulfillment::{FulfillmentReport, FulfillmentRequest, FulfillmentSource, FulfillmentTrigger};

// Invariants
pub use invariants::{InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity};

// Notifications
pub use notifications::{Notification, NotificationOutbox, OutboxRunSummary};

// Orders
pub use orders::{NewOrder, Order, OrderLedger, OrderResolution, OrderStatus, ResolveOutcome};

// Projects
pub use projects::{PaymentStatus, Project, SetupInvoiceState, SetupInvoiceStatus};

// Provider
pub use provider::PaymentProvider;

// Setup invoices
pub use setup_invoice::{SetupInvoiceFlow, SetupTransition};

// Store
pub use store::{BillingStore, MemoryBillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{
    estimate_renewal_window, NewSubscription, Subscription, SubscriptionLedger, SubscriptionPatch,
    SubscriptionStatus,
};

// Webhooks
pub use webhook_types::EventEnvelope;
pub use webhooks::{
    DispatchOutcome, ProcessingResult, WebhookEventRecord, WebhookHandler, WebhookReplayResult,
};

/// Billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub config: Arc<StripeConfig>,
    pub store: Arc<dyn BillingStore>,
    pub customers: CustomerRegistry,
    pub orders: OrderLedger,
    pub subscriptions: SubscriptionLedger,
    pub setup_invoices: SetupInvoiceFlow,
    pub checkout: CheckoutService,
    pub outbox: NotificationOutbox,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Wire every component over the given collaborators
    pub fn new(
        config: StripeConfig,
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let config = Arc::new(config);

        let outbox = NotificationOutbox::new(store.clone(), notifier);
        let fulfillment =
            FulfillmentTrigger::new(store.clone(), outbox.clone(), &config.default_access_role);
        let customers = CustomerRegistry::new(store.clone(), provider.clone());
        let orders = OrderLedger::new(store.clone(), provider.clone(), fulfillment.clone());
        let subscriptions =
            SubscriptionLedger::new(store.clone(), provider.clone(), fulfillment.clone());
        let setup_invoices = SetupInvoiceFlow::new(
            store.clone(),
            provider.clone(),
            customers.clone(),
            fulfillment,
            &config.currency,
            config.setup_invoice_days_until_due,
        );
        let checkout = CheckoutService::new(
            config.clone(),
            store.clone(),
            provider,
            customers.clone(),
            orders.clone(),
        );
        let webhooks = WebhookHandler::new(
            &config.webhook_secret,
            config.webhook_tolerance_secs,
            store.clone(),
            customers.clone(),
            orders.clone(),
            subscriptions.clone(),
            setup_invoices.clone(),
        );

        Self {
            config,
            store,
            customers,
            orders,
            subscriptions,
            setup_invoices,
            checkout,
            outbox,
            webhooks,
        }
    }

    /// Create from environment: Stripe, Postgres and Resend
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        let provider = Arc::new(StripeClient::new(config.clone()));
        let store = Arc::new(PgBillingStore::new(pool));
        let notifier = Arc::new(BillingEmailService::from_env());
        Ok(Self::new(config, store, provider, notifier))
    }
}
