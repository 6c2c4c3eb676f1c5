// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Agency Background Worker
//!
//! Handles scheduled billing jobs:
//! - Notification outbox retry (every 5 minutes)
//! - Failed webhook replay (every 15 minutes)
//! - Billing invariant sweep (daily at 4:00 AM UTC)
//! - Heartbeat (every 5 minutes)

mod jobs;

use std::sync::Arc;
use std::time::Duration;

use agency_billing::{BillingService, InvariantChecker};
use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Agency Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = agency_shared::create_pool(&database_url).await?;

    let scheduler = JobScheduler::new().await?;
    let mut job_count = 0;

    // Job 1: Invariant sweep, daily at 04:00 UTC
    // Read-only, so it runs even without Stripe credentials
    let checker = Arc::new(InvariantChecker::new(pool.clone()));
    scheduler
        .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running billing invariant sweep");
                jobs::run_invariant_sweep(&checker).await;
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Billing invariant sweep (daily at 4:00 AM UTC)");

    match BillingService::from_env(pool.clone()) {
        Ok(billing) => {
            let billing = Arc::new(billing);

            // Job 2: Notification outbox retry every 5 minutes
            let outbox_billing = billing.clone();
            scheduler
                .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
                    let billing = outbox_billing.clone();
                    Box::pin(async move {
                        jobs::retry_notifications(&billing).await;
                    })
                })?)
                .await?;
            job_count += 1;
            info!("Scheduled: Notification outbox retry (every 5 minutes)");

            // Job 3: Failed webhook replay every 15 minutes
            let replay_billing = billing.clone();
            scheduler
                .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
                    let billing = replay_billing.clone();
                    Box::pin(async move {
                        jobs::replay_failed_webhooks(&billing).await;
                    })
                })?)
                .await?;
            job_count += 1;
            info!("Scheduled: Failed webhook replay (every 15 minutes)");
        }
        Err(e) => {
            warn!(error = %e, "Failed to create billing service - running invariant sweep only");
        }
    }

    // Job 4: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;
    job_count += 1;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    scheduler.start().await?;

    info!(
        "Agency Worker started successfully with {} scheduled jobs",
        job_count
    );

    // Keep the main task alive
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
