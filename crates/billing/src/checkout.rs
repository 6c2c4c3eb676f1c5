//! One-time checkout

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::StripeConfig;
use crate::customer::CustomerRegistry;
use crate::error::{BillingError, BillingResult};
use crate::orders::{NewOrder, OrderLedger};
use crate::projects::PaymentStatus;
use crate::provider::{
    CheckoutSessionRequest, PaymentProvider, META_PRODUCT_TYPE, META_PROJECT_ID, META_USER_ID,
};
use crate::store::BillingStore;

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub product_type: String,
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Clone)]
pub struct CheckoutService {
    config: Arc<StripeConfig>,
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    customers: CustomerRegistry,
    orders: OrderLedger,
}

impl CheckoutService {
    pub fn new(
        config: Arc<StripeConfig>,
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        customers: CustomerRegistry,
        orders: OrderLedger,
    ) -> Self {
        Self {
            config,
            store,
            provider,
            customers,
            orders,
        }
    }

    /// Create a Stripe checkout session for a catalog product and record the
    /// pending order for it. The price always comes from the catalog.
    pub async fn start_checkout(&self, request: CheckoutRequest) -> BillingResult<CheckoutResponse> {
        let amount_cents = self.config.price_for(&request.product_type).ok_or_else(|| {
            BillingError::InvalidInput(format!("unknown product '{}'", request.product_type))
        })?;

        if let Some(project_id) = request.project_id {
            let project = self
                .store
                .get_project(project_id)
                .await?
                .ok_or_else(|| BillingError::ProjectNotFound(project_id.to_string()))?;
            if project.owner_user_id != request.user_id {
                return Err(BillingError::PermissionDenied(
                    "project belongs to another user".to_string(),
                ));
            }
            if project.payment_status == PaymentStatus::Paid {
                return Err(BillingError::InvalidState(
                    "project is already paid".to_string(),
                ));
            }
        }

        let customer = self
            .customers
            .ensure_customer(&request.email, request.name.as_deref(), Some(request.user_id))
            .await?;

        let mut metadata = HashMap::new();
        metadata.insert(META_PRODUCT_TYPE.to_string(), request.product_type.clone());
        metadata.insert(META_USER_ID.to_string(), request.user_id.to_string());
        if let Some(project_id) = request.project_id {
            metadata.insert(META_PROJECT_ID.to_string(), project_id.to_string());
        }

        let session = self
            .provider
            .create_checkout_session(&CheckoutSessionRequest {
                customer_id: customer.external_customer_id.clone(),
                product_name: request.product_type.clone(),
                amount_cents,
                currency: self.config.currency.clone(),
                success_url: self.config.checkout_success_url.clone(),
                cancel_url: self.config.checkout_cancel_url.clone(),
                metadata,
            })
            .await?;

        let order = self
            .orders
            .create_pending_order(NewOrder {
                external_session_id: session.id.clone(),
                external_customer_id: customer.external_customer_id,
                product_type: request.product_type,
                amount_cents,
                customer_email: customer.email,
                customer_name: request.name,
                user_id: Some(request.user_id),
                project_id: request.project_id,
            })
            .await?;

        tracing::info!(
            order_id = %order.id,
            session_id = %session.id,
            user_id = %request.user_id,
            "Checkout session created"
        );

        Ok(CheckoutResponse {
            order_id: order.id,
            session_id: session.id,
            url: session.url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;

    #[tokio::test]
    async fn test_checkout_creates_pending_order_at_catalog_price() {
        let harness = TestHarness::new();
        let user = Uuid::new_v4();

        let response = harness
            .service
            .checkout
            .start_checkout(CheckoutRequest {
                user_id: user,
                email: "A@X.com".into(),
                name: Some("Ann".into()),
                product_type: "website".into(),
                project_id: None,
            })
            .await
            .unwrap();

        let order = harness.service.orders.get_order(response.order_id).await.unwrap();
        assert_eq!(order.external_session_id, response.session_id);
        assert_eq!(order.amount_cents, 89_900);
        assert_eq!(order.customer_email, "a@x.com");
        assert_eq!(order.user_id, Some(user));
        assert_eq!(harness.provider.checkout_sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_product_is_rejected_before_any_call() {
        let harness = TestHarness::new();

        let err = harness
            .service
            .checkout
            .start_checkout(CheckoutRequest {
                user_id: Uuid::new_v4(),
                email: "a@x.com".into(),
                name: None,
                product_type: "free-lunch".into(),
                project_id: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert!(harness.provider.checkout_sessions().is_empty());
        assert!(harness.provider.created_customers().is_empty());
    }
}
