//! Billing view of a client project: payment status and setup-invoice state.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "unpaid" => Ok(PaymentStatus::Unpaid),
            "paid" => Ok(PaymentStatus::Paid),
            other => Err(BillingError::Internal(format!(
                "unknown payment status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupInvoiceStatus {
    Pending,
    Sent,
    NeedsVerification,
    Paid,
}

impl SetupInvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupInvoiceStatus::Pending => "pending",
            SetupInvoiceStatus::Sent => "sent",
            SetupInvoiceStatus::NeedsVerification => "needs_verification",
            SetupInvoiceStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(SetupInvoiceStatus::Pending),
            "sent" => Ok(SetupInvoiceStatus::Sent),
            "needs_verification" => Ok(SetupInvoiceStatus::NeedsVerification),
            "paid" => Ok(SetupInvoiceStatus::Paid),
            other => Err(BillingError::Internal(format!(
                "unknown setup invoice status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SetupInvoiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupInvoiceState {
    pub stripe_invoice_id: Option<String>,
    pub url: Option<String>,
    pub status: SetupInvoiceStatus,
    pub paid: bool,
}

impl Default for SetupInvoiceState {
    fn default() -> Self {
        Self {
            stripe_invoice_id: None,
            url: None,
            status: SetupInvoiceStatus::Pending,
            paid: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub name: String,
    pub client_email: String,
    pub client_name: Option<String>,
    pub payment_status: PaymentStatus,
    pub setup_invoice: SetupInvoiceState,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Project {
    /// A fresh, unpaid project
    pub fn new(owner_user_id: Uuid, name: &str, client_email: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_user_id,
            name: name.to_string(),
            client_email: client_email.to_string(),
            client_name: None,
            payment_status: PaymentStatus::Unpaid,
            setup_invoice: SetupInvoiceState::default(),
            paid_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}
