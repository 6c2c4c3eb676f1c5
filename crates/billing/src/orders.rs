//! Order ledger
//!
//! One-time purchases. An order is created `pending` when its checkout session
//! is created and is resolved by webhook events keyed on the session id. It is
//! never created by a webhook.
//!
//! Allowed transitions: `pending -> paid | failed`, `paid -> refunded`. Any
//! other resolution is logged and ignored so that replays and out-of-order
//! deliveries converge instead of erroring.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::fulfillment::{FulfillmentRequest, FulfillmentSource, FulfillmentTrigger};
use crate::provider::PaymentProvider;
use crate::store::BillingStore;

/// Attempts at a compare-and-set before giving up on a contended order
const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            "failed" => Ok(OrderStatus::Failed),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(BillingError::Internal(format!("unknown order status '{}'", other))),
        }
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Paid)
                | (OrderStatus::Pending, OrderStatus::Failed)
                | (OrderStatus::Paid, OrderStatus::Refunded)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub external_session_id: String,
    pub external_customer_id: String,
    pub product_type: String,
    pub amount_cents: i64,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub status: OrderStatus,
    pub external_payment_intent_id: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
    pub user_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub external_session_id: String,
    pub external_customer_id: String,
    pub product_type: String,
    pub amount_cents: i64,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub user_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
}

/// What a webhook reports about an order
#[derive(Debug, Clone)]
pub struct OrderResolution {
    pub status: OrderStatus,
    pub payment_intent_id: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
}

impl OrderResolution {
    pub fn new(status: OrderStatus) -> Self {
        Self {
            status,
            payment_intent_id: None,
            paid_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResolveOutcome {
    Transitioned { from: OrderStatus, order: Order },
    Unchanged(Order),
}

impl ResolveOutcome {
    pub fn order(&self) -> &Order {
        match self {
            ResolveOutcome::Transitioned { order, .. } => order,
            ResolveOutcome::Unchanged(order) => order,
        }
    }

    pub fn transitioned(&self) -> bool {
        matches!(self, ResolveOutcome::Transitioned { .. })
    }
}

#[derive(Clone)]
pub struct OrderLedger {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    fulfillment: FulfillmentTrigger,
}

impl OrderLedger {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        fulfillment: FulfillmentTrigger,
    ) -> Self {
        Self {
            store,
            provider,
            fulfillment,
        }
    }

    pub async fn create_pending_order(&self, new_order: NewOrder) -> BillingResult<Order> {
        if new_order.amount_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "order amount must be positive".to_string(),
            ));
        }

        let order = self.store.insert_order(&new_order).await?;

        tracing::info!(
            order_id = %order.id,
            session_id = %order.external_session_id,
            product_type = %order.product_type,
            amount_cents = order.amount_cents,
            "Created pending order"
        );

        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> BillingResult<Order> {
        self.store
            .get_order(order_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))
    }

    /// Resolve the order for a checkout session.
    ///
    /// Fails with `OrderNotFound` when no order exists for the session: every
    /// session we create has an order, so a miss means a lost upstream write.
    pub async fn resolve_order(
        &self,
        session_id: &str,
        resolution: OrderResolution,
    ) -> BillingResult<ResolveOutcome> {
        for _ in 0..MAX_RESOLVE_ATTEMPTS {
            let current = self
                .store
                .get_order_by_session(session_id)
                .await?
                .ok_or_else(|| {
                    tracing::error!(
                        session_id = %session_id,
                        target_status = %resolution.status,
                        "Order not found for checkout session we created"
                    );
                    BillingError::OrderNotFound(session_id.to_string())
                })?;

            if !current.status.can_transition_to(resolution.status) {
                tracing::info!(
                    order_id = %current.id,
                    session_id = %session_id,
                    current_status = %current.status,
                    target_status = %resolution.status,
                    "Order resolution is a no-op"
                );
                return Ok(ResolveOutcome::Unchanged(current));
            }

            let Some(updated) = self
                .store
                .compare_and_set_order_status(current.id, current.status, &resolution)
                .await?
            else {
                // Another delivery moved the order first; re-read and re-evaluate
                tracing::debug!(order_id = %current.id, "Order changed concurrently, retrying");
                continue;
            };

            tracing::info!(
                order_id = %updated.id,
                session_id = %session_id,
                from = %current.status,
                to = %updated.status,
                "Order transitioned"
            );

            if updated.status == OrderStatus::Paid {
                self.fulfillment
                    .fire(FulfillmentRequest {
                        source: FulfillmentSource::Order {
                            order_id: updated.id,
                        },
                        user_id: updated.user_id,
                        project_id: updated.project_id,
                        recipient_email: updated.customer_email.clone(),
                        recipient_name: updated.customer_name.clone(),
                        grants_access: true,
                    })
                    .await;
            }

            return Ok(ResolveOutcome::Transitioned {
                from: current.status,
                order: updated,
            });
        }

        Err(BillingError::Internal(format!(
            "order for session {} kept changing concurrently",
            session_id
        )))
    }

    /// Resolve the order paid with a payment intent (used for refunds).
    /// Returns `None` when no order carries the payment intent.
    pub async fn resolve_by_payment_intent(
        &self,
        payment_intent_id: &str,
        resolution: OrderResolution,
    ) -> BillingResult<Option<ResolveOutcome>> {
        match self
            .store
            .get_order_by_payment_intent(payment_intent_id)
            .await?
        {
            Some(order) => Ok(Some(
                self.resolve_order(&order.external_session_id, resolution)
                    .await?,
            )),
            None => Ok(None),
        }
    }

    /// Cancel an order on behalf of its owner. Only pending orders can be
    /// cancelled. The checkout session is expired at the provider first so it
    /// can no longer be paid; the order is then deleted so the session can be
    /// recreated. If the provider refuses (the session already completed) the
    /// order is kept and the error is returned.
    pub async fn cancel_own_order(&self, order_id: Uuid, requester_id: Uuid) -> BillingResult<()> {
        let order = self.get_order(order_id).await?;

        if order.user_id != Some(requester_id) {
            tracing::warn!(
                order_id = %order_id,
                requester_id = %requester_id,
                "Rejected cancellation of order not owned by requester"
            );
            return Err(BillingError::PermissionDenied(
                "order belongs to another user".to_string(),
            ));
        }

        if order.status != OrderStatus::Pending {
            return Err(BillingError::InvalidState(format!(
                "only pending orders can be cancelled, order is {}",
                order.status
            )));
        }

        self.provider
            .expire_checkout_session(&order.external_session_id)
            .await?;

        if !self
            .store
            .delete_pending_order(order_id, requester_id)
            .await?
        {
            // Resolved between the read and the delete
            return Err(BillingError::InvalidState(
                "order is no longer pending".to_string(),
            ));
        }

        tracing::info!(order_id = %order_id, user_id = %requester_id, "Order cancelled by owner");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use OrderStatus::*;
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Failed));
        assert!(Paid.can_transition_to(Refunded));

        assert!(!Paid.can_transition_to(Paid));
        assert!(!Paid.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Paid));
        assert!(!Refunded.can_transition_to(Paid));
        assert!(!Pending.can_transition_to(Refunded));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Failed,
            OrderStatus::Refunded,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OrderStatus::parse("cancelled").is_err());
    }
}
