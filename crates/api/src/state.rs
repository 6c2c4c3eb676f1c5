//! Application state

use std::sync::Arc;

use agency_billing::{BillingService, InvariantChecker};
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: BillingService,
    /// Requires Postgres; absent when running over the in-memory store
    pub invariants: Option<Arc<InvariantChecker>>,
    pub jwt_manager: JwtManager,
}

impl AppState {
    /// Production wiring: Postgres ledgers, Stripe and Resend from the environment
    pub fn new(pool: PgPool, config: &Config) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!("Stripe billing service initialized");

        Ok(Self {
            billing,
            invariants: Some(Arc::new(InvariantChecker::new(pool))),
            jwt_manager: JwtManager::new(&config.jwt_secret),
        })
    }

    /// Wire an already built billing service, e.g. one over the in-memory store
    pub fn with_billing(billing: BillingService, jwt_secret: &str) -> Self {
        Self {
            billing,
            invariants: None,
            jwt_manager: JwtManager::new(jwt_secret),
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
