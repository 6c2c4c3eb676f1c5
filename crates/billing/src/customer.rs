//! Customer registry
//!
//! Maps a billing identity (normalized email) to a Stripe customer id. Stripe
//! happily creates several customers for the same email, so the registry keeps
//! exactly one canonical record per email and marks the rest as duplicates.
//! Lookups by id resolve duplicates back to the canonical record.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::provider::PaymentProvider;
use crate::store::BillingStore;

/// A Stripe customer known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerRecord {
    pub external_customer_id: String,
    /// Normalized (trimmed, lowercased) email
    pub email: String,
    /// Set at most once, never overwritten
    pub linked_user_id: Option<Uuid>,
    /// True when another record already owns this email
    pub is_duplicate: bool,
    pub created_at: OffsetDateTime,
}

/// Normalize an email for registry lookups
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Clone)]
pub struct CustomerRegistry {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
}

impl CustomerRegistry {
    pub fn new(store: Arc<dyn BillingStore>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { store, provider }
    }

    /// Return the canonical customer for an email, creating it at Stripe if
    /// neither the registry nor Stripe knows one yet.
    pub async fn ensure_customer(
        &self,
        email: &str,
        name: Option<&str>,
        user_id: Option<Uuid>,
    ) -> BillingResult<CustomerRecord> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(BillingError::InvalidInput("email is required".to_string()));
        }

        if let Some(existing) = self.store.find_canonical_customer_by_email(&email).await? {
            return self.link_if_requested(existing, user_id).await;
        }

        // Stripe lists newest first; the oldest customer becomes canonical
        let known = self.provider.list_customers_by_email(&email).await?;
        if !known.is_empty() {
            let mut canonical = None;
            for customer in known.iter().rev() {
                let record = self.store.insert_customer_if_absent(&customer.id, &email).await?;
                if !record.is_duplicate && canonical.is_none() {
                    canonical = Some(record);
                }
            }

            if known.len() > 1 {
                tracing::warn!(
                    email_domain = %email_domain(&email),
                    customer_count = known.len(),
                    "Multiple Stripe customers share one email, registered extras as duplicates"
                );
            }

            if let Some(record) = canonical {
                return self.link_if_requested(record, user_id).await;
            }
            // Every id was already registered as a duplicate of a record that
            // has since been removed; fall through to the canonical lookup.
            if let Some(record) = self.store.find_canonical_customer_by_email(&email).await? {
                return self.link_if_requested(record, user_id).await;
            }
        }

        let created = self
            .provider
            .create_customer(&email, name, user_id)
            .await?;
        let record = self.store.insert_customer_if_absent(&created.id, &email).await?;

        tracing::info!(
            customer_id = %record.external_customer_id,
            duplicate = record.is_duplicate,
            "Created Stripe customer"
        );

        let record = if record.is_duplicate {
            // Lost a race with a concurrent creation; prefer the canonical record
            self.store
                .find_canonical_customer_by_email(&email)
                .await?
                .unwrap_or(record)
        } else {
            record
        };

        self.link_if_requested(record, user_id).await
    }

    /// Register a customer reported by a webhook event
    pub async fn record_customer(
        &self,
        external_customer_id: &str,
        email: &str,
        user_id: Option<Uuid>,
    ) -> BillingResult<CustomerRecord> {
        let email = normalize_email(email);
        let record = self
            .store
            .insert_customer_if_absent(external_customer_id, &email)
            .await?;
        self.link_if_requested(record, user_id).await
    }

    /// Resolve a customer by Stripe id first, then by email. Duplicates
    /// resolve to the canonical record for their email.
    pub async fn resolve(
        &self,
        external_customer_id: Option<&str>,
        email: Option<&str>,
    ) -> BillingResult<Option<CustomerRecord>> {
        if let Some(id) = external_customer_id {
            if let Some(record) = self.store.get_customer(id).await? {
                if !record.is_duplicate {
                    return Ok(Some(record));
                }
                let canonical = self
                    .store
                    .find_canonical_customer_by_email(&record.email)
                    .await?;
                return Ok(Some(canonical.unwrap_or(record)));
            }
        }

        match email {
            Some(email) => {
                self.store
                    .find_canonical_customer_by_email(&normalize_email(email))
                    .await
            }
            None => Ok(None),
        }
    }

    /// User linked to a billing identity, looking through duplicates
    pub async fn linked_user(
        &self,
        external_customer_id: Option<&str>,
        email: Option<&str>,
    ) -> BillingResult<Option<Uuid>> {
        if let Some(id) = external_customer_id {
            if let Some(record) = self.store.get_customer(id).await? {
                if record.linked_user_id.is_some() {
                    return Ok(record.linked_user_id);
                }
            }
        }
        Ok(self
            .resolve(external_customer_id, email)
            .await?
            .and_then(|r| r.linked_user_id))
    }

    /// First writer wins: links only when no user is linked yet
    pub async fn link_user(&self, external_customer_id: &str, user_id: Uuid) -> BillingResult<bool> {
        let linked = self
            .store
            .link_customer_user(external_customer_id, user_id)
            .await?;
        if linked {
            tracing::info!(
                customer_id = %external_customer_id,
                user_id = %user_id,
                "Linked billing identity to user"
            );
        }
        Ok(linked)
    }

    async fn link_if_requested(
        &self,
        record: CustomerRecord,
        user_id: Option<Uuid>,
    ) -> BillingResult<CustomerRecord> {
        match (user_id, record.linked_user_id) {
            (Some(user_id), None) => {
                self.link_user(&record.external_customer_id, user_id).await?;
                Ok(self
                    .store
                    .get_customer(&record.external_customer_id)
                    .await?
                    .unwrap_or(record))
            }
            _ => Ok(record),
        }
    }
}

/// Domain part of an email, safe to log
fn email_domain(email: &str) -> &str {
    email.rsplit_once('@').map(|(_, d)| d).unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBillingStore;
    use crate::testing::FakeProvider;

    fn registry() -> (CustomerRegistry, Arc<FakeProvider>, Arc<MemoryBillingStore>) {
        let store = Arc::new(MemoryBillingStore::new());
        let provider = Arc::new(FakeProvider::new());
        (
            CustomerRegistry::new(store.clone(), provider.clone()),
            provider,
            store,
        )
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  A@X.com "), "a@x.com");
    }

    #[tokio::test]
    async fn test_ensure_customer_creates_once() {
        let (registry, provider, _) = registry();

        let first = registry.ensure_customer("A@x.com", None, None).await.unwrap();
        let second = registry.ensure_customer("a@x.com", None, None).await.unwrap();

        assert_eq!(first.external_customer_id, second.external_customer_id);
        assert_eq!(provider.created_customers().len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_customer_adopts_oldest_existing_stripe_customer() {
        let (registry, provider, store) = registry();
        // Listed newest first, like Stripe
        provider.seed_customer("cus_new", "a@x.com");
        provider.seed_customer("cus_old", "a@x.com");

        let record = registry.ensure_customer("a@x.com", None, None).await.unwrap();

        assert_eq!(record.external_customer_id, "cus_old");
        assert!(provider.created_customers().is_empty());
        let dup = store.get_customer("cus_new").await.unwrap().unwrap();
        assert!(dup.is_duplicate);
    }

    #[tokio::test]
    async fn test_resolve_duplicate_id_returns_canonical() {
        let (registry, _, _) = registry();
        registry.record_customer("cus_a", "a@x.com", None).await.unwrap();
        let dup = registry.record_customer("cus_b", "a@x.com", None).await.unwrap();
        assert!(dup.is_duplicate);

        let resolved = registry.resolve(Some("cus_b"), None).await.unwrap().unwrap();
        assert_eq!(resolved.external_customer_id, "cus_a");
    }

    #[tokio::test]
    async fn test_linked_user_first_writer_wins() {
        let (registry, _, _) = registry();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        registry.record_customer("cus_a", "a@x.com", Some(first)).await.unwrap();

        let linked = registry.link_user("cus_a", second).await.unwrap();

        assert!(!linked);
        assert_eq!(
            registry.linked_user(Some("cus_a"), None).await.unwrap(),
            Some(first)
        );
    }
}
