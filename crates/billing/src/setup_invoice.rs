//! Setup-fee invoices for custom-deal projects
//!
//! `pending -> sent -> needs_verification -> paid`. An admin creates and sends
//! the invoice, the client may report having paid it, and only an admin
//! confirmation or Stripe's `invoice.paid` makes it `paid`. A client report is
//! advisory and never sets `paid` on its own.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::customer::CustomerRegistry;
use crate::error::{BillingError, BillingResult};
use crate::fulfillment::{FulfillmentRequest, FulfillmentSource, FulfillmentTrigger};
use crate::projects::{Project, SetupInvoiceState, SetupInvoiceStatus};
use crate::provider::{
    InvoiceRequest, PaymentProvider, ProviderInvoiceStatus, INVOICE_TYPE_SETUP_FEE,
    META_INVOICE_TYPE, META_PROJECT_ID,
};
use crate::store::BillingStore;

const MAX_CAS_ATTEMPTS: usize = 3;

/// Upper bound on one invoice replacement. Outlives a crashed holder.
const REPLACEMENT_LEASE_SECS: i64 = 120;

/// Statuses from which the invoice may still be replaced or paid
const UNPAID: &[SetupInvoiceStatus] = &[
    SetupInvoiceStatus::Pending,
    SetupInvoiceStatus::Sent,
    SetupInvoiceStatus::NeedsVerification,
];

/// Who confirmed a setup fee as paid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaidConfirmation {
    Admin,
    Provider,
}

impl PaidConfirmation {
    fn as_str(&self) -> &'static str {
        match self {
            PaidConfirmation::Admin => "admin",
            PaidConfirmation::Provider => "stripe",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SetupTransition {
    Transitioned(Project),
    Unchanged(Project),
}

impl SetupTransition {
    pub fn project(&self) -> &Project {
        match self {
            SetupTransition::Transitioned(p) | SetupTransition::Unchanged(p) => p,
        }
    }

    pub fn transitioned(&self) -> bool {
        matches!(self, SetupTransition::Transitioned(_))
    }
}

#[derive(Clone)]
pub struct SetupInvoiceFlow {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    customers: CustomerRegistry,
    fulfillment: FulfillmentTrigger,
    currency: String,
    days_until_due: u32,
}

impl SetupInvoiceFlow {
    pub fn new(
        store: Arc<dyn BillingStore>,
        provider: Arc<dyn PaymentProvider>,
        customers: CustomerRegistry,
        fulfillment: FulfillmentTrigger,
        currency: &str,
        days_until_due: u32,
    ) -> Self {
        Self {
            store,
            provider,
            customers,
            fulfillment,
            currency: currency.to_string(),
            days_until_due,
        }
    }

    async fn get_project(&self, project_id: Uuid) -> BillingResult<Project> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| BillingError::ProjectNotFound(project_id.to_string()))
    }

    /// Create and send a setup invoice, replacing any open or draft one for
    /// the same project first. Replacements of one project are serialized by
    /// a lease; a concurrent call fails with `InvalidState` instead of racing
    /// to leave a second payable invoice.
    pub async fn create_and_send(
        &self,
        project_id: Uuid,
        amount_cents: i64,
        description: Option<&str>,
    ) -> BillingResult<Project> {
        if amount_cents <= 0 {
            return Err(BillingError::InvalidInput(
                "setup fee must be positive".to_string(),
            ));
        }

        if !self
            .store
            .claim_setup_invoice_lease(
                project_id,
                time::Duration::seconds(REPLACEMENT_LEASE_SECS),
            )
            .await?
        {
            tracing::warn!(
                project_id = %project_id,
                "Setup invoice replacement already in progress"
            );
            return Err(BillingError::InvalidState(
                "setup invoice is already being replaced".to_string(),
            ));
        }

        let result = self
            .replace_invoice(project_id, amount_cents, description)
            .await;

        if let Err(e) = self.store.release_setup_invoice_lease(project_id).await {
            tracing::warn!(
                project_id = %project_id,
                error = %e,
                "Failed to release setup invoice lease, it will expire"
            );
        }

        result
    }

    /// Runs under the project's replacement lease
    async fn replace_invoice(
        &self,
        project_id: Uuid,
        amount_cents: i64,
        description: Option<&str>,
    ) -> BillingResult<Project> {
        let project = self.get_project(project_id).await?;
        if project.setup_invoice.status == SetupInvoiceStatus::Paid {
            return Err(BillingError::InvalidState(
                "setup fee is already paid".to_string(),
            ));
        }

        let customer = self
            .customers
            .ensure_customer(
                &project.client_email,
                project.client_name.as_deref(),
                Some(project.owner_user_id),
            )
            .await?;

        self.clear_outstanding(&customer.external_customer_id, &project)
            .await?;

        let mut metadata = HashMap::new();
        metadata.insert(
            META_INVOICE_TYPE.to_string(),
            INVOICE_TYPE_SETUP_FEE.to_string(),
        );
        metadata.insert(META_PROJECT_ID.to_string(), project_id.to_string());

        let invoice = self
            .provider
            .create_and_send_invoice(&InvoiceRequest {
                customer_id: customer.external_customer_id.clone(),
                amount_cents,
                currency: self.currency.clone(),
                description: description
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Setup fee: {}", project.name)),
                days_until_due: self.days_until_due,
                metadata,
            })
            .await?;

        let next = SetupInvoiceState {
            stripe_invoice_id: Some(invoice.id.clone()),
            url: invoice.hosted_invoice_url.clone(),
            status: SetupInvoiceStatus::Sent,
            paid: false,
        };

        let Some(updated) = self
            .store
            .compare_and_set_setup_invoice(project_id, UNPAID, &next)
            .await?
        else {
            // Paid while we were creating the replacement; withdraw it
            if let Err(e) = self.provider.void_invoice(&invoice.id).await {
                tracing::error!(
                    project_id = %project_id,
                    invoice_id = %invoice.id,
                    error = %e,
                    "RECONCILIATION NEEDED: failed to void setup invoice created after payment"
                );
            }
            return Err(BillingError::InvalidState(
                "setup fee was paid while creating the invoice".to_string(),
            ));
        };

        tracing::info!(
            project_id = %project_id,
            invoice_id = %invoice.id,
            amount_cents,
            "Setup invoice sent"
        );

        Ok(updated)
    }

    /// Void open and delete draft setup invoices belonging to this project:
    /// those under the current customer, and the project's recorded invoice
    /// wherever it lives (the client email may have moved to another customer).
    async fn clear_outstanding(&self, customer_id: &str, project: &Project) -> BillingResult<()> {
        let mut withdrawn = Vec::new();
        for status in [ProviderInvoiceStatus::Open, ProviderInvoiceStatus::Draft] {
            let invoices = self.provider.list_invoices(customer_id, status).await?;
            for invoice in invoices.iter().filter(|i| i.is_setup_fee_for(project.id)) {
                self.withdraw(project.id, &invoice.id, status).await?;
                withdrawn.push(invoice.id.clone());
            }
        }

        if let Some(recorded) = project.setup_invoice.stripe_invoice_id.as_deref() {
            if !withdrawn.iter().any(|id| id == recorded) {
                let invoice = self.provider.retrieve_invoice(recorded).await?;
                if matches!(
                    invoice.status,
                    ProviderInvoiceStatus::Open | ProviderInvoiceStatus::Draft
                ) {
                    self.withdraw(project.id, &invoice.id, invoice.status).await?;
                }
            }
        }
        Ok(())
    }

    async fn withdraw(
        &self,
        project_id: Uuid,
        invoice_id: &str,
        status: ProviderInvoiceStatus,
    ) -> BillingResult<()> {
        match status {
            ProviderInvoiceStatus::Open => self.provider.void_invoice(invoice_id).await?,
            _ => self.provider.delete_invoice(invoice_id).await?,
        }
        tracing::info!(
            project_id = %project_id,
            invoice_id = %invoice_id,
            previous_status = status.as_str(),
            "Withdrew superseded setup invoice"
        );
        Ok(())
    }

    /// Client says they paid. Moves `sent` to `needs_verification` only.
    pub async fn report_paid_by_client(
        &self,
        project_id: Uuid,
        requester_id: Uuid,
    ) -> BillingResult<Project> {
        let project = self.get_project(project_id).await?;
        if project.owner_user_id != requester_id {
            return Err(BillingError::PermissionDenied(
                "project belongs to another user".to_string(),
            ));
        }

        match project.setup_invoice.status {
            SetupInvoiceStatus::NeedsVerification | SetupInvoiceStatus::Paid => return Ok(project),
            SetupInvoiceStatus::Pending => {
                return Err(BillingError::InvalidState(
                    "no setup invoice has been sent".to_string(),
                ))
            }
            SetupInvoiceStatus::Sent => {}
        }

        let next = SetupInvoiceState {
            status: SetupInvoiceStatus::NeedsVerification,
            paid: false,
            ..project.setup_invoice.clone()
        };

        match self
            .store
            .compare_and_set_setup_invoice(project_id, &[SetupInvoiceStatus::Sent], &next)
            .await?
        {
            Some(updated) => {
                tracing::info!(project_id = %project_id, "Client reported setup fee paid");
                Ok(updated)
            }
            None => self.get_project(project_id).await,
        }
    }

    /// Admin confirms payment received out of band
    pub async fn confirm_paid_by_admin(&self, project_id: Uuid) -> BillingResult<SetupTransition> {
        self.mark_paid(project_id, PaidConfirmation::Admin).await
    }

    /// Stripe reported a setup-fee invoice as paid. The invoice id is the
    /// primary key; `project_hint` from the invoice metadata covers invoices
    /// that are no longer the one recorded on the project.
    pub async fn mark_paid_from_provider(
        &self,
        invoice_id: &str,
        project_hint: Option<Uuid>,
    ) -> BillingResult<SetupTransition> {
        let project_id = match self.store.find_project_by_setup_invoice(invoice_id).await? {
            Some(project) => project.id,
            None => {
                let Some(project_id) = project_hint else {
                    tracing::error!(
                        invoice_id = %invoice_id,
                        "Paid setup invoice matches no project"
                    );
                    return Err(BillingError::ProjectNotFound(format!(
                        "no project for setup invoice {}",
                        invoice_id
                    )));
                };
                tracing::warn!(
                    invoice_id = %invoice_id,
                    project_id = %project_id,
                    "Paid setup invoice is not the one recorded on the project"
                );
                project_id
            }
        };

        self.mark_paid(project_id, PaidConfirmation::Provider).await
    }

    async fn mark_paid(
        &self,
        project_id: Uuid,
        confirmation: PaidConfirmation,
    ) -> BillingResult<SetupTransition> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let project = self.get_project(project_id).await?;
            if project.setup_invoice.status == SetupInvoiceStatus::Paid {
                tracing::debug!(project_id = %project_id, "Setup fee already paid");
                return Ok(SetupTransition::Unchanged(project));
            }

            let next = SetupInvoiceState {
                status: SetupInvoiceStatus::Paid,
                paid: true,
                ..project.setup_invoice.clone()
            };

            let Some(updated) = self
                .store
                .compare_and_set_setup_invoice(project_id, &[project.setup_invoice.status], &next)
                .await?
            else {
                continue;
            };

            tracing::info!(
                project_id = %project_id,
                from = %project.setup_invoice.status,
                confirmed_by = confirmation.as_str(),
                "Setup fee marked paid"
            );

            self.fulfillment
                .fire(FulfillmentRequest {
                    source: FulfillmentSource::SetupInvoice { project_id },
                    user_id: Some(updated.owner_user_id),
                    project_id: Some(project_id),
                    recipient_email: updated.client_email.clone(),
                    recipient_name: updated.client_name.clone(),
                    grants_access: false,
                })
                .await;

            return Ok(SetupTransition::Transitioned(updated));
        }

        Err(BillingError::Internal(format!(
            "setup invoice for project {} kept changing concurrently",
            project_id
        )))
    }
}
