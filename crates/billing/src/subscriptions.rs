//! Subscription ledger
//!
//! Subscriptions are upserted by Stripe subscription id. The first event for a
//! subscription creates the row; every later event is applied as a patch that
//! only writes the fields the event actually reported.
//!
//! `current_period_end` never moves backwards unless the subscription is
//! canceled. An out-of-order delivery carrying an older period is dropped for
//! the period fields while the rest of the patch still applies.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::fulfillment::{FulfillmentRequest, FulfillmentSource, FulfillmentTrigger};
use crate::provider::PaymentProvider;
use crate::store::BillingStore;

/// Renewal window assumed when the provider reports no billing interval
pub const DEFAULT_RENEWAL_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Unpaid,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            other => Err(BillingError::Internal(format!(
                "unknown subscription status '{}'",
                other
            ))),
        }
    }

    /// Map a Stripe subscription status onto the ledger's states
    pub fn from_provider(s: &str) -> Option<Self> {
        match s {
            "active" | "trialing" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            "unpaid" | "incomplete" | "paused" => Some(SubscriptionStatus::Unpaid),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub external_subscription_id: String,
    pub external_customer_id: String,
    pub price_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub cancel_at: Option<OffsetDateTime>,
    pub customer_email: String,
    pub user_id: Option<Uuid>,
    /// First time the subscription became active
    pub activated_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Full description of a subscription, used on first creation
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub external_subscription_id: String,
    pub external_customer_id: String,
    pub price_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub customer_email: String,
    pub user_id: Option<Uuid>,
}

impl NewSubscription {
    pub fn into_subscription(self, now: OffsetDateTime) -> Subscription {
        Subscription {
            activated_at: (self.status == SubscriptionStatus::Active).then_some(now),
            external_subscription_id: self.external_subscription_id,
            external_customer_id: self.external_customer_id,
            price_id: self.price_id,
            status: self.status,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            cancel_at: None,
            customer_email: self.customer_email,
            user_id: self.user_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// The same data as a patch over an existing row
    pub fn as_patch(&self) -> SubscriptionPatch {
        SubscriptionPatch {
            status: Some(self.status),
            price_id: Some(self.price_id.clone()),
            current_period_start: Some(self.current_period_start),
            current_period_end: Some(self.current_period_end),
            cancel_at_period_end: Some(self.cancel_at_period_end),
            cancel_at: None,
            customer_email: Some(self.customer_email.clone()),
            user_id: self.user_id,
        }
    }
}

/// Fields reported by a single event. `None` means "not reported" and leaves
/// the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPatch {
    pub status: Option<SubscriptionStatus>,
    pub price_id: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub cancel_at: Option<OffsetDateTime>,
    pub customer_email: Option<String>,
    /// Only fills an empty link, never replaces one
    pub user_id: Option<Uuid>,
}

impl SubscriptionPatch {
    pub fn status(status: SubscriptionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch in place. Returns whether anything changed.
    pub fn apply(&self, sub: &mut Subscription, now: OffsetDateTime) -> bool {
        let before = sub.clone();

        if let Some(status) = self.status {
            sub.status = status;
        }
        if let Some(price_id) = &self.price_id {
            sub.price_id = price_id.clone();
        }

        let canceled = sub.status == SubscriptionStatus::Canceled;
        match (self.current_period_start, self.current_period_end) {
            (start, Some(end)) => {
                if end >= sub.current_period_end || canceled {
                    sub.current_period_end = end;
                    if let Some(start) = start {
                        sub.current_period_start = start;
                    }
                } else {
                    tracing::debug!(
                        subscription_id = %sub.external_subscription_id,
                        stored_end = %sub.current_period_end,
                        reported_end = %end,
                        "Ignoring stale subscription period"
                    );
                }
            }
            (Some(start), None) => {
                if start >= sub.current_period_start || canceled {
                    sub.current_period_start = start;
                }
            }
            (None, None) => {}
        }

        if let Some(flag) = self.cancel_at_period_end {
            sub.cancel_at_period_end = flag;
        }
        if let Some(cancel_at) = self.cancel_at {
            sub.cancel_at = Some(cancel_at);
        }
        if let Some(email) = &self.customer_email {
            sub.customer_email = email.clone();
        }
        if sub.user_id.is_none() {
            sub.user_id = self.user_id;
        }
        if sub.status == SubscriptionStatus::Active && sub.activated_at.is_none() {
            sub.activated_at = Some(now);
        }

        let changed = *sub != before;
        if changed {
            sub.updated_at = now;
        }
        changed
    }
}

/// Result of an upsert or patch, with the row as it was before
#[derive(Debug, Clone)]
pub struct SubscriptionChange {
    pub previous: Option<Subscription>,
    pub current: Subscription,
}

impl SubscriptionChange {
    /// True exactly once per subscription: the write that first made it active
    pub fn first_activation(&self) -> bool {
        let was_activated = self
            .previous
            .as_ref()
            .is_some_and(|p| p.activated_at.is_some());
        !was_activated && self.current.activated_at.is_some()
    }

    /// The user who became entitled by this write without it being the first
    /// activation: linked to an already activated subscription, or the
    /// subscription came back to active after being linked while lapsed.
    pub fn newly_entitled_user(&self) -> Option<Uuid> {
        let previous = self.previous.as_ref()?;
        let user_id = self.current.user_id?;
        let entitled_before = previous.user_id.is_some()
            && previous.status == SubscriptionStatus::Active;
        let entitled_now = self.current.status == SubscriptionStatus::Active;

        (previous.activated_at.is_some() && entitled_now && !entitled_before).then_some(user_id)
    }
}

/// Recurring interval as reported on a price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(IntervalUnit::Day),
            "week" => Some(IntervalUnit::Week),
            "month" => Some(IntervalUnit::Month),
            "year" => Some(IntervalUnit::Year),
            _ => None,
        }
    }
}

/// Approximate the end of a billing period when only its start is known.
///
/// Uses the price's recurring interval when the event carries one and falls
/// back to a flat 30 days otherwise. Months and years are calendar-based with
/// the day clamped to the end of shorter months.
pub fn estimate_renewal_window(
    start: OffsetDateTime,
    interval: Option<(IntervalUnit, u32)>,
) -> OffsetDateTime {
    let Some((unit, count)) = interval else {
        return start + Duration::days(DEFAULT_RENEWAL_DAYS);
    };
    let count = count.max(1);

    match unit {
        IntervalUnit::Day => start + Duration::days(i64::from(count)),
        IntervalUnit::Week => start + Duration::weeks(i64::from(count)),
        IntervalUnit::Month => add_months(start, count),
        IntervalUnit::Year => add_months(start, count.saturating_mul(12)),
    }
}

fn add_months(start: OffsetDateTime, months: u32) -> OffsetDateTime {
    let zero_based = i64::from(start.month() as u8) - 1 + i64::from(months);
    let year = i64::from(start.year()) + zero_based.div_euclid(12);
    let month_index = zero_based.rem_euclid(12) as u8 + 1;

    let (Ok(year), Ok(month)) = (i32::try_from(year), time::Month::try_from(month_index)) else {
        return start + Duration::days(DEFAULT_RENEWAL_DAYS * i64::from(months));
    };

    let day = start.day().min(time::util::days_in_year_month(year, month));
    match time::Date::from_calendar_date(year, month, day) {
        Ok(date) => start.replace_date(date),
        Err(_) => start + Duration::days(DEFAULT_RENEWAL_DAYS * i64::from(months)),
    }
}

/// Pick the subscription to show a user: the most recently created active one,
/// otherwise the most recently created of any status.
pub fn select_current_subscription(subscriptions: &[Subscription]) -> Option<&Subscription> {
    subscriptions
        .iter()
        .filter(|s| s.status == SubscriptionStatus::Active)
        .max_by_key(|s| s.created_at)
        .or_else(|| subscriptions.iter().max_by_key(|s| s.created_at))
}

#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn BillingStore>,
    provider: Arc<dyn PaymentProvider>,
    fulfillment: FulfillmentTrigger,
}

impl SubscriptionLedger {
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

    /// Create the subscription, or merge into it if an earlier event already
    /// created it.
    pub async fn upsert_subscription(
        &self,
        new_subscription: NewSubscription,
    ) -> BillingResult<SubscriptionChange> {
        let change = self.store.upsert_subscription(&new_subscription).await?;

        tracing::info!(
            subscription_id = %change.current.external_subscription_id,
            status = %change.current.status,
            created = change.previous.is_none(),
            "Upserted subscription"
        );

        self.after_write(&change).await;
        Ok(change)
    }

    /// Patch reported fields. Fails with `SubscriptionNotFound` if the
    /// subscription is not in the ledger.
    pub async fn patch_subscription(
        &self,
        subscription_id: &str,
        patch: SubscriptionPatch,
    ) -> BillingResult<SubscriptionChange> {
        let change = self
            .store
            .patch_subscription(subscription_id, &patch)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        tracing::info!(
            subscription_id = %subscription_id,
            status = %change.current.status,
            period_end = %change.current.current_period_end,
            "Patched subscription"
        );

        self.after_write(&change).await;
        Ok(change)
    }

    /// Fill the user link on every subscription of a customer that has none
    pub async fn link_customer_subscriptions(
        &self,
        customer_id: &str,
        user_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionChange>> {
        let unlinked: Vec<Subscription> = self
            .store
            .list_subscriptions_for_customer(customer_id)
            .await?
            .into_iter()
            .filter(|s| s.user_id.is_none())
            .collect();

        let mut changes = Vec::with_capacity(unlinked.len());
        for sub in unlinked {
            let patch = SubscriptionPatch {
                user_id: Some(user_id),
                ..Default::default()
            };
            let change = self
                .patch_subscription(&sub.external_subscription_id, patch)
                .await?;
            tracing::info!(
                subscription_id = %sub.external_subscription_id,
                customer_id = %customer_id,
                user_id = ?change.current.user_id,
                "Linked subscription to user"
            );
            changes.push(change);
        }
        Ok(changes)
    }

    pub async fn get_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        self.store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))
    }

    /// The subscription a user should see: latest active, else latest of any status
    pub async fn get_active_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscriptions = self.store.list_subscriptions_for_user(user_id).await?;
        Ok(select_current_subscription(&subscriptions).cloned())
    }

    /// Cancel at Stripe immediately and mirror the status locally.
    /// The `customer.subscription.deleted` event that follows is a no-op.
    pub async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<Subscription> {
        let existing = self.get_subscription(subscription_id).await?;
        if existing.status == SubscriptionStatus::Canceled {
            return Ok(existing);
        }

        self.provider.cancel_subscription(subscription_id).await?;
        let change = self
            .patch_subscription(
                subscription_id,
                SubscriptionPatch::status(SubscriptionStatus::Canceled),
            )
            .await?;
        Ok(change.current)
    }

    /// Push a custom deal's end date to Stripe, then record it locally
    pub async fn apply_cancel_at(
        &self,
        subscription_id: &str,
        cancel_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionChange>> {
        self.provider
            .update_subscription_cancel_at(subscription_id, cancel_at)
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            cancel_at = %cancel_at,
            "Applied custom deal end date"
        );

        // The row may not exist yet when subscription.created beats invoice.paid;
        // the later `customer.subscription.updated` carries cancel_at anyway.
        let patch = SubscriptionPatch {
            cancel_at: Some(cancel_at),
            ..Default::default()
        };
        match self.patch_subscription(subscription_id, patch).await {
            Ok(change) => Ok(Some(change)),
            Err(BillingError::SubscriptionNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn after_write(&self, change: &SubscriptionChange) {
        let sub = &change.current;
        let source = FulfillmentSource::Subscription {
            subscription_id: sub.external_subscription_id.clone(),
        };

        if !change.first_activation() {
            // The welcome went out on first activation; only access is owed
            if let Some(user_id) = change.newly_entitled_user() {
                self.fulfillment.grant_access(user_id, &source).await;
            }
            return;
        }

        self.fulfillment
            .fire(FulfillmentRequest {
                source,
                user_id: sub.user_id,
                project_id: None,
                recipient_email: sub.customer_email.clone(),
                recipient_name: None,
                grants_access: true,
            })
            .await;
    }
}
