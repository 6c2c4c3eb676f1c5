//! Payment provider port
//!
//! The engine never talks to Stripe directly; it goes through this trait so the
//! ledgers can be exercised against a fake in tests. `StripeClient` is the
//! production implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Metadata key tagging an invoice by purpose
pub const META_INVOICE_TYPE: &str = "invoice_type";
/// `invoice_type` value for project setup-fee invoices
pub const INVOICE_TYPE_SETUP_FEE: &str = "setup_fee";
/// Metadata key carrying the owning project id
pub const META_PROJECT_ID: &str = "project_id";
/// Metadata key carrying the platform user id
pub const META_USER_ID: &str = "user_id";
/// Metadata key carrying the product purchased through checkout
pub const META_PRODUCT_TYPE: &str = "product_type";
/// Metadata key tagging a checkout session by purpose
pub const META_CHECKOUT_TYPE: &str = "checkout_type";
/// `checkout_type` value for deposit checkouts handled outside the ledgers
pub const CHECKOUT_TYPE_DEPOSIT: &str = "deposit";
/// Metadata key tagging a subscription as a negotiated deal
pub const META_DEAL_TYPE: &str = "deal_type";
/// `deal_type` value for custom deals with a fixed end date
pub const DEAL_TYPE_CUSTOM: &str = "custom";
/// Metadata key carrying a unix timestamp at which a custom deal ends
pub const META_CANCEL_AT: &str = "cancel_at";

/// Customer as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderInvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

impl ProviderInvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderInvoiceStatus::Draft => "draft",
            ProviderInvoiceStatus::Open => "open",
            ProviderInvoiceStatus::Paid => "paid",
            ProviderInvoiceStatus::Void => "void",
            ProviderInvoiceStatus::Uncollectible => "uncollectible",
        }
    }
}

/// Invoice as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInvoice {
    pub id: String,
    pub status: ProviderInvoiceStatus,
    pub hosted_invoice_url: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl ProviderInvoice {
    /// Whether this invoice is the setup fee of the given project
    pub fn is_setup_fee_for(&self, project_id: Uuid) -> bool {
        self.metadata.get(META_INVOICE_TYPE).map(String::as_str) == Some(INVOICE_TYPE_SETUP_FEE)
            && self.metadata.get(META_PROJECT_ID) == Some(&project_id.to_string())
    }
}

/// Parameters for a one-off invoice with a single line item
#[derive(Debug, Clone)]
pub struct InvoiceRequest {
    pub customer_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub description: String,
    pub days_until_due: u32,
    pub metadata: HashMap<String, String>,
}

/// Parameters for a one-time payment checkout session
#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub customer_id: String,
    pub product_name: String,
    pub amount_cents: i64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_customer(
        &self,
        email: &str,
        name: Option<&str>,
        user_id: Option<Uuid>,
    ) -> BillingResult<ProviderCustomer>;

    /// Customers for an email, newest first
    async fn list_customers_by_email(&self, email: &str) -> BillingResult<Vec<ProviderCustomer>>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<ProviderCheckoutSession>;

    /// Expire an open checkout session so it can no longer be paid. Fails if
    /// the session has already completed.
    async fn expire_checkout_session(&self, session_id: &str) -> BillingResult<()>;

    /// Create an invoice with one line item, finalize it and send it to the
    /// customer. The returned invoice carries its payable URL.
    async fn create_and_send_invoice(&self, request: &InvoiceRequest)
        -> BillingResult<ProviderInvoice>;

    async fn list_invoices(
        &self,
        customer_id: &str,
        status: ProviderInvoiceStatus,
    ) -> BillingResult<Vec<ProviderInvoice>>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice>;

    async fn void_invoice(&self, invoice_id: &str) -> BillingResult<()>;

    /// Only drafts can be deleted
    async fn delete_invoice(&self, invoice_id: &str) -> BillingResult<()>;

    async fn update_subscription_cancel_at(
        &self,
        subscription_id: &str,
        cancel_at: OffsetDateTime,
    ) -> BillingResult<()>;

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()>;
}
