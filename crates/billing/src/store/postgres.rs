//! Postgres billing store

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::BillingStore;
use crate::customer::CustomerRecord;
use crate::error::{BillingError, BillingResult};
use crate::notifications::{Notification, NotificationKind, NotificationStatus};
use crate::orders::{NewOrder, Order, OrderResolution, OrderStatus};
use crate::projects::{PaymentStatus, Project, SetupInvoiceState, SetupInvoiceStatus};
use crate::subscriptions::{
    NewSubscription, Subscription, SubscriptionChange, SubscriptionPatch, SubscriptionStatus,
};
use crate::webhooks::{ClaimOutcome, DepositLead, ProcessingResult, WebhookEventRecord};

const ORDER_COLUMNS: &str = "id, external_session_id, external_customer_id, product_type, \
     amount_cents, customer_email, customer_name, status, external_payment_intent_id, paid_at, \
     user_id, project_id, created_at";

const SUBSCRIPTION_COLUMNS: &str = "external_subscription_id, external_customer_id, price_id, \
     status, current_period_start, current_period_end, cancel_at_period_end, cancel_at, \
     customer_email, user_id, activated_at, created_at, updated_at";

const PROJECT_COLUMNS: &str = "id, owner_user_id, name, client_email, client_name, \
     payment_status, setup_invoice_stripe_id, setup_invoice_url, setup_invoice_status, \
     setup_invoice_paid, paid_at, created_at";

const NOTIFICATION_COLUMNS: &str =
    "id, kind, recipient, context, status, attempts, last_error, created_at, sent_at";

const WEBHOOK_COLUMNS: &str = "id, external_event_id, event_type, payload, processing_result, \
     processing_started_at, error_message, replay_attempts, created_at";

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct CustomerRow {
    external_customer_id: String,
    email: String,
    linked_user_id: Option<Uuid>,
    is_duplicate: bool,
    created_at: OffsetDateTime,
}

impl From<CustomerRow> for CustomerRecord {
    fn from(row: CustomerRow) -> Self {
        Self {
            external_customer_id: row.external_customer_id,
            email: row.email,
            linked_user_id: row.linked_user_id,
            is_duplicate: row.is_duplicate,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    external_session_id: String,
    external_customer_id: String,
    product_type: String,
    amount_cents: i64,
    customer_email: String,
    customer_name: Option<String>,
    status: String,
    external_payment_intent_id: Option<String>,
    paid_at: Option<OffsetDateTime>,
    user_id: Option<Uuid>,
    project_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for Order {
    type Error = BillingError;

    fn try_from(row: OrderRow) -> BillingResult<Self> {
        Ok(Self {
            id: row.id,
            external_session_id: row.external_session_id,
            external_customer_id: row.external_customer_id,
            product_type: row.product_type,
            amount_cents: row.amount_cents,
            customer_email: row.customer_email,
            customer_name: row.customer_name,
            status: OrderStatus::parse(&row.status)?,
            external_payment_intent_id: row.external_payment_intent_id,
            paid_at: row.paid_at,
            user_id: row.user_id,
            project_id: row.project_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    external_subscription_id: String,
    external_customer_id: String,
    price_id: String,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    cancel_at: Option<OffsetDateTime>,
    customer_email: String,
    user_id: Option<Uuid>,
    activated_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Self {
            external_subscription_id: row.external_subscription_id,
            external_customer_id: row.external_customer_id,
            price_id: row.price_id,
            status: SubscriptionStatus::parse(&row.status)?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            cancel_at: row.cancel_at,
            customer_email: row.customer_email,
            user_id: row.user_id,
            activated_at: row.activated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: Uuid,
    owner_user_id: Uuid,
    name: String,
    client_email: String,
    client_name: Option<String>,
    payment_status: String,
    setup_invoice_stripe_id: Option<String>,
    setup_invoice_url: Option<String>,
    setup_invoice_status: String,
    setup_invoice_paid: bool,
    paid_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<ProjectRow> for Project {
    type Error = BillingError;

    fn try_from(row: ProjectRow) -> BillingResult<Self> {
        Ok(Self {
            id: row.id,
            owner_user_id: row.owner_user_id,
            name: row.name,
            client_email: row.client_email,
            client_name: row.client_name,
            payment_status: PaymentStatus::parse(&row.payment_status)?,
            setup_invoice: SetupInvoiceState {
                stripe_invoice_id: row.setup_invoice_stripe_id,
                url: row.setup_invoice_url,
                status: SetupInvoiceStatus::parse(&row.setup_invoice_status)?,
                paid: row.setup_invoice_paid,
            },
            paid_at: row.paid_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    kind: String,
    recipient: String,
    context: serde_json::Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    sent_at: Option<OffsetDateTime>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = BillingError;

    fn try_from(row: NotificationRow) -> BillingResult<Self> {
        Ok(Self {
            id: row.id,
            kind: NotificationKind::parse(&row.kind)?,
            recipient: row.recipient,
            context: row.context,
            status: NotificationStatus::parse(&row.status)?,
            attempts: row.attempts,
            last_error: row.last_error,
            created_at: row.created_at,
            sent_at: row.sent_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    external_event_id: String,
    event_type: String,
    payload: serde_json::Value,
    processing_result: String,
    processing_started_at: Option<OffsetDateTime>,
    error_message: Option<String>,
    replay_attempts: i32,
    created_at: OffsetDateTime,
}

impl TryFrom<WebhookRow> for WebhookEventRecord {
    type Error = BillingError;

    fn try_from(row: WebhookRow) -> BillingResult<Self> {
        Ok(Self {
            id: row.id,
            external_event_id: row.external_event_id,
            event_type: row.event_type,
            payload: row.payload,
            processing_result: ProcessingResult::parse(&row.processing_result)?,
            processing_started_at: row.processing_started_at,
            error_message: row.error_message,
            replay_attempts: row.replay_attempts,
            created_at: row.created_at,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

impl PgBillingStore {
    async fn fetch_order(&self, column: &str, value: &str) -> BillingResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE {} = $1",
            ORDER_COLUMNS, column
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn insert_subscription_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        sub: &Subscription,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (external_subscription_id, external_customer_id, price_id, status,
                 current_period_start, current_period_end, cancel_at_period_end, cancel_at,
                 customer_email, user_id, activated_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&sub.external_subscription_id)
        .bind(&sub.external_customer_id)
        .bind(&sub.price_id)
        .bind(sub.status.as_str())
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.cancel_at_period_end)
        .bind(sub.cancel_at)
        .bind(&sub.customer_email)
        .bind(sub.user_id)
        .bind(sub.activated_at)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_subscription_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        sub: &Subscription,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET price_id = $2, status = $3,
                current_period_start = $4, current_period_end = $5,
                cancel_at_period_end = $6, cancel_at = $7, customer_email = $8,
                user_id = $9, activated_at = $10, updated_at = $11
            WHERE external_subscription_id = $1
            "#,
        )
        .bind(&sub.external_subscription_id)
        .bind(&sub.price_id)
        .bind(sub.status.as_str())
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.cancel_at_period_end)
        .bind(sub.cancel_at)
        .bind(&sub.customer_email)
        .bind(sub.user_id)
        .bind(sub.activated_at)
        .bind(sub.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn lock_subscription(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE external_subscription_id = $1 FOR UPDATE",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&mut **tx)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn fetch_project(&self, column: &str, value: &str) -> BillingResult<Option<Project>> {
        let row: Option<ProjectRow> = sqlx::query_as(&format!(
            "SELECT {} FROM projects WHERE {} = $1",
            PROJECT_COLUMNS, column
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Project::try_from).transpose()
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_customer(&self, external_customer_id: &str) -> BillingResult<Option<CustomerRecord>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            r#"
            SELECT external_customer_id, email, linked_user_id, is_duplicate, created_at
            FROM billing_customers
            WHERE external_customer_id = $1
            "#,
        )
        .bind(external_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn find_canonical_customer_by_email(
        &self,
        email: &str,
    ) -> BillingResult<Option<CustomerRecord>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            r#"
            SELECT external_customer_id, email, linked_user_id, is_duplicate, created_at
            FROM billing_customers
            WHERE email = $1 AND NOT is_duplicate
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn insert_customer_if_absent(
        &self,
        external_customer_id: &str,
        email: &str,
    ) -> BillingResult<CustomerRecord> {
        // Two concurrent canonical inserts for one email collide on the partial
        // unique index; the loser retries and lands as a duplicate.
        for _ in 0..2 {
            let inserted = sqlx::query(
                r#"
                INSERT INTO billing_customers (external_customer_id, email, is_duplicate)
                SELECT $1, $2, EXISTS (
                    SELECT 1 FROM billing_customers WHERE email = $2 AND NOT is_duplicate
                )
                ON CONFLICT (external_customer_id) DO NOTHING
                "#,
            )
            .bind(external_customer_id)
            .bind(email)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => break,
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.get_customer(external_customer_id).await?.ok_or_else(|| {
            BillingError::Database(format!(
                "customer {} missing after insert",
                external_customer_id
            ))
        })
    }

    async fn link_customer_user(
        &self,
        external_customer_id: &str,
        user_id: Uuid,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_customers
            SET linked_user_id = $2, updated_at = NOW()
            WHERE external_customer_id = $1 AND linked_user_id IS NULL
            "#,
        )
        .bind(external_customer_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_order(&self, order: &NewOrder) -> BillingResult<Order> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO orders
                (id, external_session_id, external_customer_id, product_type, amount_cents,
                 customer_email, customer_name, status, user_id, project_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9)
            ON CONFLICT (external_session_id) DO NOTHING
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&order.external_session_id)
        .bind(&order.external_customer_id)
        .bind(&order.product_type)
        .bind(order.amount_cents)
        .bind(&order.customer_email)
        .bind(&order.customer_name)
        .bind(order.user_id)
        .bind(order.project_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(BillingError::OrderAlreadyExists(
                order.external_session_id.clone(),
            )),
        }
    }

    async fn get_order(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn get_order_by_session(&self, session_id: &str) -> BillingResult<Option<Order>> {
        self.fetch_order("external_session_id", session_id).await
    }

    async fn get_order_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<Order>> {
        self.fetch_order("external_payment_intent_id", payment_intent_id)
            .await
    }

    async fn compare_and_set_order_status(
        &self,
        order_id: Uuid,
        expected: OrderStatus,
        resolution: &OrderResolution,
    ) -> BillingResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            r#"
            UPDATE orders
            SET status = $3,
                external_payment_intent_id = COALESCE($4, external_payment_intent_id),
                paid_at = CASE WHEN $3 = 'paid' THEN COALESCE($5, NOW()) ELSE paid_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(order_id)
        .bind(expected.as_str())
        .bind(resolution.status.as_str())
        .bind(&resolution.payment_intent_id)
        .bind(resolution.paid_at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Order::try_from).transpose()
    }

    async fn delete_pending_order(&self, order_id: Uuid, owner: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            "DELETE FROM orders WHERE id = $1 AND user_id = $2 AND status = 'pending'",
        )
        .bind(order_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_subscription(&self, subscription_id: &str) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE external_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn upsert_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> BillingResult<SubscriptionChange> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        // Serialize first-creation races on the id before the row exists
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&subscription.external_subscription_id)
            .execute(&mut *tx)
            .await?;

        let change = match Self::lock_subscription(&mut tx, &subscription.external_subscription_id)
            .await?
        {
            Some(existing) => {
                let mut current = existing.clone();
                if subscription.as_patch().apply(&mut current, now) {
                    Self::update_subscription_row(&mut tx, &current).await?;
                }
                SubscriptionChange {
                    previous: Some(existing),
                    current,
                }
            }
            None => {
                let created = subscription.clone().into_subscription(now);
                Self::insert_subscription_row(&mut tx, &created).await?;
                SubscriptionChange {
                    previous: None,
                    current: created,
                }
            }
        };

        tx.commit().await?;
        Ok(change)
    }

    async fn patch_subscription(
        &self,
        subscription_id: &str,
        patch: &SubscriptionPatch,
    ) -> BillingResult<Option<SubscriptionChange>> {
        let mut tx = self.pool.begin().await?;

        let Some(existing) = Self::lock_subscription(&mut tx, subscription_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let mut current = existing.clone();
        if patch.apply(&mut current, OffsetDateTime::now_utc()) {
            Self::update_subscription_row(&mut tx, &current).await?;
        }
        tx.commit().await?;

        Ok(Some(SubscriptionChange {
            previous: Some(existing),
            current,
        }))
    }

    async fn list_subscriptions_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn list_subscriptions_for_customer(
        &self,
        external_customer_id: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM subscriptions WHERE external_customer_id = $1 ORDER BY created_at DESC",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(external_customer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    async fn insert_project(&self, project: &Project) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO projects
                (id, owner_user_id, name, client_email, client_name, payment_status,
                 setup_invoice_stripe_id, setup_invoice_url, setup_invoice_status,
                 setup_invoice_paid, paid_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(project.id)
        .bind(project.owner_user_id)
        .bind(&project.name)
        .bind(&project.client_email)
        .bind(&project.client_name)
        .bind(project.payment_status.as_str())
        .bind(&project.setup_invoice.stripe_invoice_id)
        .bind(&project.setup_invoice.url)
        .bind(project.setup_invoice.status.as_str())
        .bind(project.setup_invoice.paid)
        .bind(project.paid_at)
        .bind(project.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_project(&self, project_id: Uuid) -> BillingResult<Option<Project>> {
        let row: Option<ProjectRow> = sqlx::query_as(&format!(
            "SELECT {} FROM projects WHERE id = $1",
            PROJECT_COLUMNS
        ))
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Project::try_from).transpose()
    }

    async fn find_project_by_setup_invoice(
        &self,
        invoice_id: &str,
    ) -> BillingResult<Option<Project>> {
        self.fetch_project("setup_invoice_stripe_id", invoice_id)
            .await
    }

    async fn compare_and_set_setup_invoice(
        &self,
        project_id: Uuid,
        expected: &[SetupInvoiceStatus],
        next: &SetupInvoiceState,
    ) -> BillingResult<Option<Project>> {
        let expected: Vec<&str> = expected.iter().map(SetupInvoiceStatus::as_str).collect();

        let row: Option<ProjectRow> = sqlx::query_as(&format!(
            r#"
            UPDATE projects
            SET setup_invoice_stripe_id = $3,
                setup_invoice_url = $4,
                setup_invoice_status = $5,
                setup_invoice_paid = $6,
                updated_at = NOW()
            WHERE id = $1 AND setup_invoice_status = ANY($2)
            RETURNING {}
            "#,
            PROJECT_COLUMNS
        ))
        .bind(project_id)
        .bind(&expected)
        .bind(&next.stripe_invoice_id)
        .bind(&next.url)
        .bind(next.status.as_str())
        .bind(next.paid)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Project::try_from).transpose()
    }

    async fn claim_setup_invoice_lease(
        &self,
        project_id: Uuid,
        ttl: time::Duration,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET setup_invoice_lock_until = NOW() + make_interval(secs => $2)
            WHERE id = $1
              AND (setup_invoice_lock_until IS NULL OR setup_invoice_lock_until <= NOW())
            "#,
        )
        .bind(project_id)
        .bind(ttl.as_seconds_f64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(BillingError::ProjectNotFound(project_id.to_string())),
        }
    }

    async fn release_setup_invoice_lease(&self, project_id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE projects SET setup_invoice_lock_until = NULL WHERE id = $1")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_project_paid(&self, project_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE projects
            SET payment_status = 'paid', paid_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND payment_status <> 'paid'
            "#,
        )
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(BillingError::ProjectNotFound(project_id.to_string())),
        }
    }

    async fn grant_role_if_absent(&self, user_id: Uuid, role: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO access_roles (user_id, role)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_role(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT role FROM access_roles WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn enqueue_notification(&self, notification: &Notification) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO notifications (id, kind, recipient, context, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(notification.id)
        .bind(notification.kind.as_str())
        .bind(&notification.recipient)
        .bind(&notification.context)
        .bind(notification.status.as_str())
        .bind(notification.attempts)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_pending_notifications(&self, limit: i64) -> BillingResult<Vec<Notification>> {
        let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM notifications WHERE status = 'pending' ORDER BY created_at ASC LIMIT $1",
            NOTIFICATION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn record_notification_attempt(
        &self,
        notification_id: Uuid,
        error: Option<&str>,
        max_attempts: i32,
    ) -> BillingResult<()> {
        match error {
            None => {
                sqlx::query(
                    r#"
                    UPDATE notifications
                    SET status = 'sent', attempts = attempts + 1, last_error = NULL, sent_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(notification_id)
                .execute(&self.pool)
                .await?;
            }
            Some(error) => {
                sqlx::query(
                    r#"
                    UPDATE notifications
                    SET attempts = attempts + 1,
                        last_error = $2,
                        status = CASE WHEN attempts + 1 >= $3 THEN 'failed' ELSE status END
                    WHERE id = $1
                    "#,
                )
                .bind(notification_id)
                .bind(error)
                .bind(max_attempts)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
        stale_after: time::Duration,
    ) -> BillingResult<ClaimOutcome> {
        // Only one delivery can win the row. Failed events and events stuck in
        // processing past the timeout can be claimed again.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (id, external_event_id, event_type, payload, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (external_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                payload = EXCLUDED.payload
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result = 'processing'
                   AND webhook_events.processing_started_at < NOW() - make_interval(secs => $5))
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .bind(stale_after.as_seconds_f64())
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT processing_result FROM webhook_events WHERE external_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let result = match existing {
            Some(result) => ProcessingResult::parse(&result)?,
            None => ProcessingResult::Processing,
        };
        Ok(ClaimOutcome::Duplicate(result))
    }

    async fn finish_webhook_event(
        &self,
        event_id: &str,
        result: ProcessingResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2,
                error_message = $3,
                processing_started_at = CASE WHEN $2 = 'processing' THEN NOW()
                                             ELSE processing_started_at END
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(result.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_webhook_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let row: Option<WebhookRow> = sqlx::query_as(&format!(
            "SELECT {} FROM webhook_events WHERE external_event_id = $1",
            WEBHOOK_COLUMNS
        ))
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WebhookEventRecord::try_from).transpose()
    }

    async fn list_webhook_events(
        &self,
        result: Option<ProcessingResult>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookRow> = match result {
            Some(result) => {
                sqlx::query_as(&format!(
                    r#"
                    SELECT {} FROM webhook_events
                    WHERE processing_result = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#,
                    WEBHOOK_COLUMNS
                ))
                .bind(result.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM webhook_events ORDER BY created_at DESC LIMIT $1",
                    WEBHOOK_COLUMNS
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(WebhookEventRecord::try_from).collect()
    }

    async fn list_replayable_webhook_events(
        &self,
        max_attempts: i32,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM webhook_events
            WHERE processing_result = 'error' AND replay_attempts < $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
            WEBHOOK_COLUMNS
        ))
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WebhookEventRecord::try_from).collect()
    }

    async fn record_replay_attempt(
        &self,
        event_id: &str,
        max_attempts: i32,
    ) -> BillingResult<ProcessingResult> {
        let result: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE webhook_events
            SET replay_attempts = replay_attempts + 1,
                processing_result = CASE
                    WHEN processing_result = 'error' AND replay_attempts + 1 >= $2 THEN 'failed'
                    ELSE processing_result END
            WHERE external_event_id = $1
            RETURNING processing_result
            "#,
        )
        .bind(event_id)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        match result {
            Some(result) => ProcessingResult::parse(&result),
            None => Err(BillingError::NotFound(format!("webhook event {}", event_id))),
        }
    }

    async fn record_deposit_lead(&self, lead: &DepositLead) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO deposit_leads (external_session_id, email, name, amount_cents, metadata)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (external_session_id) DO NOTHING
            "#,
        )
        .bind(&lead.external_session_id)
        .bind(&lead.email)
        .bind(&lead.name)
        .bind(lead.amount_cents)
        .bind(&lead.metadata)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
