//! Webhook event wire types
//!
//! Only the fields the reconciliation engine reads are modelled. Everything is
//! optional where Stripe may omit it across API versions (notably subscription
//! periods, which newer API versions report per item instead of at the top).

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BillingError, BillingResult};

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED: &str =
    "checkout.session.async_payment_succeeded";
pub const CHECKOUT_SESSION_ASYNC_PAYMENT_FAILED: &str = "checkout.session.async_payment_failed";
pub const CHECKOUT_SESSION_EXPIRED: &str = "checkout.session.expired";
pub const INVOICE_PAID: &str = "invoice.paid";
pub const CUSTOMER_SUBSCRIPTION_CREATED: &str = "customer.subscription.created";
pub const CUSTOMER_SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";
pub const CUSTOMER_SUBSCRIPTION_DELETED: &str = "customer.subscription.deleted";
pub const CHARGE_REFUNDED: &str = "charge.refunded";

/// Event envelope as delivered to the webhook endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// Accept either a bare id or an expanded object carrying an `id`
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expandable {
        Id(String),
        Object { id: String },
    }

    Ok(Option::<Expandable>::deserialize(deserializer)?.map(|e| match e {
        Expandable::Id(id) => id,
        Expandable::Object { id } => id,
    }))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    pub customer_email: Option<String>,
    pub customer_details: Option<CustomerDetails>,
    pub mode: Option<String>,
    pub payment_status: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub payment_intent: Option<String>,
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    pub fn email(&self) -> Option<&str> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.as_deref())
            .or(self.customer_email.as_deref())
    }

    pub fn name(&self) -> Option<&str> {
        self.customer_details.as_ref().and_then(|d| d.name.as_deref())
    }

    /// `no_payment_required` sessions (fully discounted) count as paid
    pub fn is_paid(&self) -> bool {
        matches!(
            self.payment_status.as_deref(),
            Some("paid") | Some("no_payment_required")
        )
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Period {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Recurring {
    pub interval: String,
    #[serde(default = "default_interval_count")]
    pub interval_count: u32,
}

fn default_interval_count() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceObject {
    pub id: String,
    pub recurring: Option<Recurring>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLine {
    pub period: Option<Period>,
    pub price: Option<PriceObject>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    pub customer_email: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    pub subscription: Option<String>,
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub lines: InvoiceLines,
}

impl InvoiceObject {
    /// The line describing the subscription period, if any
    pub fn subscription_line(&self) -> Option<&InvoiceLine> {
        self.lines
            .data
            .iter()
            .find(|l| l.price.as_ref().is_some_and(|p| p.recurring.is_some()))
            .or_else(|| self.lines.data.first())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    pub price: Option<PriceObject>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub customer: Option<String>,
    pub status: Option<String>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: Option<bool>,
    pub cancel_at: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub items: SubscriptionItems,
}

impl SubscriptionObject {
    fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.data.first()
    }

    pub fn price(&self) -> Option<&PriceObject> {
        self.first_item().and_then(|i| i.price.as_ref())
    }

    pub fn period_start(&self) -> Option<i64> {
        self.current_period_start
            .or_else(|| self.first_item().and_then(|i| i.current_period_start))
    }

    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.first_item().and_then(|i| i.current_period_end))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default, deserialize_with = "expandable_id")]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub refunded: bool,
}

/// Events the engine reacts to. Anything else is acknowledged and ignored.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    CheckoutCompleted(CheckoutSessionObject),
    CheckoutAsyncPaymentSucceeded(CheckoutSessionObject),
    CheckoutAsyncPaymentFailed(CheckoutSessionObject),
    CheckoutExpired(CheckoutSessionObject),
    InvoicePaid(InvoiceObject),
    SubscriptionCreated(SubscriptionObject),
    SubscriptionUpdated(SubscriptionObject),
    SubscriptionDeleted(SubscriptionObject),
    ChargeRefunded(ChargeObject),
    Unhandled(String),
}

impl WebhookEvent {
    pub fn from_envelope(envelope: &EventEnvelope) -> BillingResult<Self> {
        let object = &envelope.data.object;
        Ok(match envelope.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED => Self::CheckoutCompleted(parse_object(object)?),
            CHECKOUT_SESSION_ASYNC_PAYMENT_SUCCEEDED => {
                Self::CheckoutAsyncPaymentSucceeded(parse_object(object)?)
            }
            CHECKOUT_SESSION_ASYNC_PAYMENT_FAILED => {
                Self::CheckoutAsyncPaymentFailed(parse_object(object)?)
            }
            CHECKOUT_SESSION_EXPIRED => Self::CheckoutExpired(parse_object(object)?),
            INVOICE_PAID => Self::InvoicePaid(parse_object(object)?),
            CUSTOMER_SUBSCRIPTION_CREATED => Self::SubscriptionCreated(parse_object(object)?),
            CUSTOMER_SUBSCRIPTION_UPDATED => Self::SubscriptionUpdated(parse_object(object)?),
            CUSTOMER_SUBSCRIPTION_DELETED => Self::SubscriptionDeleted(parse_object(object)?),
            CHARGE_REFUNDED => Self::ChargeRefunded(parse_object(object)?),
            other => Self::Unhandled(other.to_string()),
        })
    }
}

fn parse_object<T: DeserializeOwned>(object: &serde_json::Value) -> BillingResult<T> {
    serde_json::from_value(object.clone())
        .map_err(|e| BillingError::WebhookPayloadInvalid(format!("event object: {}", e)))
}
