//! Stripe client and configuration
//!
//! Customer, invoice and subscription calls that async-stripe models cleanly go
//! through `stripe::Client`. Calls where we need fields the typed models make
//! awkward (invoice metadata on list, send/void actions, checkout sessions with
//! inline price data) use form posts against the REST API directly.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use stripe::{
    CancelSubscription, CollectionMethod, CreateCustomer, CreateInvoice, CreateInvoiceItem,
    Customer, CustomerId, Invoice, InvoiceId, InvoiceItem, ListCustomers, Subscription,
    SubscriptionId,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    CheckoutSessionRequest, InvoiceRequest, PaymentProvider, ProviderCheckoutSession,
    ProviderCustomer, ProviderInvoice, ProviderInvoiceStatus, META_USER_ID,
};

const DEFAULT_API_BASE: &str = "https://api.stripe.com";

/// Stripe and billing configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Base URL of the Stripe REST API
    pub api_base: String,
    /// Accepted clock skew for webhook signatures, in seconds
    pub webhook_tolerance_secs: i64,
    pub setup_invoice_days_until_due: u32,
    /// Role granted on the first paid order or activated subscription
    pub default_access_role: String,
    pub currency: String,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    /// One-time products sold through checkout, priced in cents
    pub product_prices: HashMap<String, i64>,
}

impl StripeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let webhook_tolerance_secs = match std::env::var("STRIPE_WEBHOOK_TOLERANCE_SECS") {
            Ok(raw) => raw.parse().map_err(|_| {
                BillingError::Config("STRIPE_WEBHOOK_TOLERANCE_SECS must be an integer".to_string())
            })?,
            Err(_) => 300,
        };

        let setup_invoice_days_until_due = match std::env::var("SETUP_INVOICE_DAYS_UNTIL_DUE") {
            Ok(raw) => raw.parse().map_err(|_| {
                BillingError::Config("SETUP_INVOICE_DAYS_UNTIL_DUE must be an integer".to_string())
            })?,
            Err(_) => 14,
        };

        let product_prices = match std::env::var("PRODUCT_PRICES") {
            Ok(raw) => parse_product_prices(&raw)?,
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            secret_key,
            webhook_secret,
            api_base: std::env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string()),
            webhook_tolerance_secs,
            setup_invoice_days_until_due,
            default_access_role: std::env::var("DEFAULT_ACCESS_ROLE")
                .unwrap_or_else(|_| "client".to_string()),
            currency: std::env::var("BILLING_CURRENCY").unwrap_or_else(|_| "usd".to_string()),
            checkout_success_url: std::env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000/portal/billing?checkout=success".to_string()),
            checkout_cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| "http://localhost:3000/portal/billing?checkout=cancelled".to_string()),
            product_prices,
        })
    }

    /// Price of a catalog product in cents
    pub fn price_for(&self, product_type: &str) -> Option<i64> {
        self.product_prices.get(product_type).copied()
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base.trim_end_matches('/'), path)
    }
}

/// Parse a `name=cents,name=cents` product catalog
pub fn parse_product_prices(raw: &str) -> BillingResult<HashMap<String, i64>> {
    let mut prices = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, cents) = entry.split_once('=').ok_or_else(|| {
            BillingError::Config(format!("PRODUCT_PRICES entry '{}' is not name=cents", entry))
        })?;
        let cents: i64 = cents.trim().parse().map_err(|_| {
            BillingError::Config(format!("PRODUCT_PRICES price for '{}' is not an integer", name))
        })?;
        if cents <= 0 {
            return Err(BillingError::Config(format!(
                "PRODUCT_PRICES price for '{}' must be positive",
                name
            )));
        }
        prices.insert(name.trim().to_string(), cents);
    }
    Ok(prices)
}

/// Stripe API client wrapper
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    http: reqwest::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = if config.api_base == DEFAULT_API_BASE {
            stripe::Client::new(config.secret_key.clone())
        } else {
            let base = format!("{}/", config.api_base.trim_end_matches('/'));
            stripe::Client::from_url(base.as_str(), config.secret_key.clone())
        };

        Self {
            client,
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    async fn post_form<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> BillingResult<T> {
        let response = self
            .http
            .post(self.config.api_url(path))
            .bearer_auth(&self.config.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to call Stripe API: {}", e)))?;
        Self::read_json(path, response).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> BillingResult<T> {
        let response = self
            .http
            .get(self.config.api_url(path))
            .bearer_auth(&self.config.secret_key)
            .query(query)
            .send()
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to call Stripe API: {}", e)))?;
        Self::read_json(path, response).await
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(
        path: &str,
        response: reqwest::Response,
    ) -> BillingResult<T> {
        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                path = %path,
                error_body = %error_body,
                "Stripe API call failed"
            );
            return Err(BillingError::StripeApi(format!(
                "Stripe API error ({}): {}",
                status, error_body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BillingError::StripeApi(format!("Failed to parse Stripe response: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct RawList<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct RawInvoice {
    id: String,
    status: Option<ProviderInvoiceStatus>,
    hosted_invoice_url: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl From<RawInvoice> for ProviderInvoice {
    fn from(raw: RawInvoice) -> Self {
        Self {
            id: raw.id,
            status: raw.status.unwrap_or(ProviderInvoiceStatus::Draft),
            hosted_invoice_url: raw.hosted_invoice_url,
            metadata: raw.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCheckoutSession {
    id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    #[allow(dead_code)]
    id: String,
}

fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
    id.parse()
        .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))
}

fn metadata_form(metadata: &HashMap<String, String>, form: &mut Vec<(String, String)>) {
    for (key, value) in metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_customer(
        &self,
        email: &str,
        name: Option<&str>,
        user_id: Option<Uuid>,
    ) -> BillingResult<ProviderCustomer> {
        let mut metadata = HashMap::new();
        if let Some(user_id) = user_id {
            metadata.insert(META_USER_ID.to_string(), user_id.to_string());
        }

        let mut params = CreateCustomer::new();
        params.email = Some(email);
        params.name = name;
        params.metadata = Some(metadata);

        let customer = Customer::create(&self.client, params).await?;

        Ok(ProviderCustomer {
            id: customer.id.to_string(),
            email: customer.email,
        })
    }

    async fn list_customers_by_email(&self, email: &str) -> BillingResult<Vec<ProviderCustomer>> {
        let mut params = ListCustomers::new();
        params.email = Some(email);
        params.limit = Some(100);

        let customers = Customer::list(&self.client, &params).await?;

        Ok(customers
            .data
            .into_iter()
            .map(|c| ProviderCustomer {
                id: c.id.to_string(),
                email: c.email,
            })
            .collect())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> BillingResult<ProviderCheckoutSession> {
        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            ("customer".into(), request.customer_id.clone()),
            ("success_url".into(), request.success_url.clone()),
            ("cancel_url".into(), request.cancel_url.clone()),
            ("line_items[0][quantity]".into(), "1".into()),
            (
                "line_items[0][price_data][currency]".into(),
                request.currency.clone(),
            ),
            (
                "line_items[0][price_data][unit_amount]".into(),
                request.amount_cents.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".into(),
                request.product_name.clone(),
            ),
        ];
        metadata_form(&request.metadata, &mut form);

        let session: RawCheckoutSession = self.post_form("/v1/checkout/sessions", &form).await?;

        Ok(ProviderCheckoutSession {
            id: session.id,
            url: session.url,
        })
    }

    async fn expire_checkout_session(&self, session_id: &str) -> BillingResult<()> {
        let _: RawObject = self
            .post_form(&format!("/v1/checkout/sessions/{}/expire", session_id), &[])
            .await?;

        tracing::info!(session_id = %session_id, "Expired checkout session");
        Ok(())
    }

    async fn create_and_send_invoice(
        &self,
        request: &InvoiceRequest,
    ) -> BillingResult<ProviderInvoice> {
        let customer_id = parse_customer_id(&request.customer_id)?;

        let mut params = CreateInvoice::new();
        params.customer = Some(customer_id.clone());
        params.collection_method = Some(CollectionMethod::SendInvoice);
        params.days_until_due = Some(request.days_until_due);
        params.description = Some(&request.description);
        params.metadata = Some(request.metadata.clone());
        params.auto_advance = Some(false);

        let invoice = Invoice::create(&self.client, params).await?;

        let mut item = CreateInvoiceItem::new(customer_id);
        item.invoice = Some(invoice.id.clone());
        item.amount = Some(request.amount_cents);
        item.currency = serde_json::from_value(serde_json::Value::String(
            request.currency.to_lowercase(),
        ))
        .ok();
        item.description = Some(&request.description);
        item.metadata = Some(request.metadata.clone());

        if let Err(e) = InvoiceItem::create(&self.client, item).await {
            // Leave no empty draft behind
            if let Err(cleanup) = Invoice::delete(&self.client, &invoice.id).await {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    error = %cleanup,
                    "Failed to delete draft invoice after line item failure"
                );
            }
            return Err(e.into());
        }

        // Sending finalizes the draft and produces the hosted payment page
        let sent: RawInvoice = self
            .post_form(&format!("/v1/invoices/{}/send", invoice.id), &[])
            .await?;

        tracing::info!(
            invoice_id = %sent.id,
            customer_id = %request.customer_id,
            amount_cents = request.amount_cents,
            "Sent invoice"
        );

        Ok(sent.into())
    }

    async fn list_invoices(
        &self,
        customer_id: &str,
        status: ProviderInvoiceStatus,
    ) -> BillingResult<Vec<ProviderInvoice>> {
        let list: RawList<RawInvoice> = self
            .get_json(
                "/v1/invoices",
                &[
                    ("customer", customer_id),
                    ("status", status.as_str()),
                    ("limit", "100"),
                ],
            )
            .await?;

        Ok(list.data.into_iter().map(Into::into).collect())
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice> {
        let invoice: RawInvoice = self
            .get_json(&format!("/v1/invoices/{}", invoice_id), &[])
            .await?;
        Ok(invoice.into())
    }

    async fn void_invoice(&self, invoice_id: &str) -> BillingResult<()> {
        let _: RawObject = self
            .post_form(&format!("/v1/invoices/{}/void", invoice_id), &[])
            .await?;
        Ok(())
    }

    async fn delete_invoice(&self, invoice_id: &str) -> BillingResult<()> {
        let id: InvoiceId = invoice_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid invoice ID: {}", e)))?;
        Invoice::delete(&self.client, &id).await?;
        Ok(())
    }

    async fn update_subscription_cancel_at(
        &self,
        subscription_id: &str,
        cancel_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let form = vec![(
            "cancel_at".to_string(),
            cancel_at.unix_timestamp().to_string(),
        )];
        let _: RawObject = self
            .post_form(&format!("/v1/subscriptions/{}", subscription_id), &form)
            .await?;
        Ok(())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let id: SubscriptionId = subscription_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;
        Subscription::cancel(&self.client, &id, CancelSubscription::new()).await?;
        Ok(())
    }
}
