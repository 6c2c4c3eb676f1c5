//! Billing Invariants Module
//!
//! Runnable consistency checks over the billing ledgers. Every check is a
//! read-only SQL query; violations carry enough context to reconcile by hand.
//! Run daily by the worker and on demand from the admin API.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Ids of the affected ledger entries
    pub entity_ids: Vec<String>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Customer paid but did not receive what they paid for
    Critical,
    /// Ledger disagrees with itself
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    pub fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }

    pub fn count_by_severity(&self, severity: ViolationSeverity) -> usize {
        self.violations
            .iter()
            .filter(|v| v.severity == severity)
            .count()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaidOrderRow {
    id: Uuid,
    external_session_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct SetupFlagRow {
    id: Uuid,
    setup_invoice_status: String,
    setup_invoice_paid: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct UnpaidProjectRow {
    project_id: Uuid,
    source_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateCanonicalRow {
    email: String,
    customer_ids: Vec<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct PeriodRow {
    external_subscription_id: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
}

const CHECKS_RUN: usize = 6;

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_paid_orders_have_paid_at().await?);
        violations.extend(self.check_setup_flag_matches_status().await?);
        violations.extend(self.check_paid_setup_invoice_marks_project().await?);
        violations.extend(self.check_paid_order_marks_project().await?);
        violations.extend(self.check_single_canonical_customer().await?);
        violations.extend(self.check_active_period_ordered().await?);

        let summary = InvariantCheckSummary::from_violations(now, CHECKS_RUN, violations);
        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Billing invariants hold");
        } else {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                critical = summary.count_by_severity(ViolationSeverity::Critical),
                "Billing invariant violations found"
            );
        }
        Ok(summary)
    }

    /// Invariant 1: Paid and refunded orders carry `paid_at`
    async fn check_paid_orders_have_paid_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaidOrderRow> = sqlx::query_as(
            r#"
            SELECT id, external_session_id
            FROM orders
            WHERE status IN ('paid', 'refunded') AND paid_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_orders_have_paid_at".to_string(),
                entity_ids: vec![row.id.to_string()],
                description: "Paid order has no paid_at timestamp".to_string(),
                context: serde_json::json!({
                    "session_id": row.external_session_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 2: `setup_invoice_paid` is true exactly when status is `paid`
    async fn check_setup_flag_matches_status(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SetupFlagRow> = sqlx::query_as(
            r#"
            SELECT id, setup_invoice_status, setup_invoice_paid
            FROM projects
            WHERE setup_invoice_paid <> (setup_invoice_status = 'paid')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "setup_flag_matches_status".to_string(),
                entity_ids: vec![row.id.to_string()],
                description: format!(
                    "Setup invoice status '{}' disagrees with paid flag {}",
                    row.setup_invoice_status, row.setup_invoice_paid
                ),
                context: serde_json::json!({
                    "setup_invoice_status": row.setup_invoice_status,
                    "setup_invoice_paid": row.setup_invoice_paid,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: A paid setup invoice implies a paid project
    async fn check_paid_setup_invoice_marks_project(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnpaidProjectRow> = sqlx::query_as(
            r#"
            SELECT id AS project_id, COALESCE(setup_invoice_stripe_id, '') AS source_id
            FROM projects
            WHERE setup_invoice_status = 'paid' AND payment_status <> 'paid'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_setup_invoice_marks_project".to_string(),
                entity_ids: vec![row.project_id.to_string()],
                description: "Setup invoice is paid but project is unpaid".to_string(),
                context: serde_json::json!({ "invoice_id": row.source_id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: A paid order linked to a project implies a paid project
    async fn check_paid_order_marks_project(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnpaidProjectRow> = sqlx::query_as(
            r#"
            SELECT p.id AS project_id, o.external_session_id AS source_id
            FROM orders o
            JOIN projects p ON p.id = o.project_id
            WHERE o.status = 'paid' AND p.payment_status <> 'paid'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_order_marks_project".to_string(),
                entity_ids: vec![row.project_id.to_string(), row.source_id.clone()],
                description: "Order is paid but its project is unpaid".to_string(),
                context: serde_json::json!({ "session_id": row.source_id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: At most one non-duplicate customer per email
    async fn check_single_canonical_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateCanonicalRow> = sqlx::query_as(
            r#"
            SELECT email, ARRAY_AGG(external_customer_id) AS customer_ids
            FROM billing_customers
            WHERE NOT is_duplicate
            GROUP BY email
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_canonical_customer".to_string(),
                description: format!(
                    "{} canonical customers share one email",
                    row.customer_ids.len()
                ),
                context: serde_json::json!({ "email": row.email }),
                entity_ids: row.customer_ids,
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: Active subscriptions end after they start
    async fn check_active_period_ordered(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PeriodRow> = sqlx::query_as(
            r#"
            SELECT external_subscription_id, current_period_start, current_period_end
            FROM subscriptions
            WHERE status = 'active' AND current_period_end < current_period_start
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_period_ordered".to_string(),
                entity_ids: vec![row.external_subscription_id],
                description: "Active subscription period ends before it starts".to_string(),
                context: serde_json::json!({
                    "current_period_start": row.current_period_start,
                    "current_period_end": row.current_period_end,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}
