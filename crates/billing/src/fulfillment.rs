//! Fulfillment trigger
//!
//! Runs the side effects of a terminal-positive transition: grant the default
//! access role, mark the linked project paid and enqueue one welcome
//! notification. Callers invoke it only after their own compare-and-set
//! reported a genuine transition; it does not re-check entity state.
//!
//! Nothing here fails the caller. The ledger write that preceded the trigger
//! is authoritative; failed steps are logged for reconciliation and the
//! notification stays queued in the outbox for the worker to retry.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::notifications::{NotificationKind, NotificationOutbox};
use crate::store::BillingStore;

/// The ledger entity whose transition fired the trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FulfillmentSource {
    Order { order_id: Uuid },
    Subscription { subscription_id: String },
    SetupInvoice { project_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct FulfillmentRequest {
    pub source: FulfillmentSource,
    pub user_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    /// Whether this purchase grants platform access
    pub grants_access: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FulfillmentReport {
    pub role_granted: bool,
    pub project_marked_paid: bool,
    pub notification_id: Option<Uuid>,
    pub notification_delivered: bool,
}

#[derive(Clone)]
pub struct FulfillmentTrigger {
    store: Arc<dyn BillingStore>,
    outbox: NotificationOutbox,
    default_role: String,
}

impl FulfillmentTrigger {
    pub fn new(store: Arc<dyn BillingStore>, outbox: NotificationOutbox, default_role: &str) -> Self {
        Self {
            store,
            outbox,
            default_role: default_role.to_string(),
        }
    }

    pub async fn fire(&self, request: FulfillmentRequest) -> FulfillmentReport {
        let mut report = FulfillmentReport::default();

        if let (true, Some(user_id)) = (request.grants_access, request.user_id) {
            report.role_granted = self.grant_access(user_id, &request.source).await;
        }

        if let Some(project_id) = request.project_id {
            match self.store.mark_project_paid(project_id).await {
                Ok(marked) => {
                    report.project_marked_paid = marked;
                    if marked {
                        tracing::info!(project_id = %project_id, "Project marked paid");
                    } else {
                        tracing::debug!(project_id = %project_id, "Project already paid");
                    }
                }
                Err(e) => {
                    tracing::error!(
                        project_id = %project_id,
                        source = ?request.source,
                        error = %e,
                        "RECONCILIATION NEEDED: failed to mark project paid"
                    );
                }
            }
        }

        let context = serde_json::json!({
            "name": request.recipient_name,
            "source": request.source,
            "project_id": request.project_id,
        });

        match self
            .outbox
            .enqueue(NotificationKind::Welcome, &request.recipient_email, context)
            .await
        {
            Ok(notification) => {
                report.notification_id = Some(notification.id);
                report.notification_delivered = self.outbox.deliver_now(&notification).await;
            }
            Err(e) => {
                tracing::error!(
                    source = ?request.source,
                    error = %e,
                    "Failed to enqueue welcome notification"
                );
            }
        }

        report
    }

    /// Grant the default role if the user has none. Used on its own when a
    /// user is linked to an entity that was already fulfilled.
    pub async fn grant_access(&self, user_id: Uuid, source: &FulfillmentSource) -> bool {
        match self
            .store
            .grant_role_if_absent(user_id, &self.default_role)
            .await
        {
            Ok(granted) => {
                if granted {
                    tracing::info!(
                        user_id = %user_id,
                        role = %self.default_role,
                        "Granted access role"
                    );
                }
                granted
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    source = ?source,
                    error = %e,
                    "RECONCILIATION NEEDED: failed to grant access role after payment"
                );
                false
            }
        }
    }
}
