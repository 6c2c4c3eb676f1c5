// API crate clippy configuration
#![allow(clippy::result_large_err)]
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Agency API Library
//!
//! HTTP surface of the billing engine: the Stripe webhook endpoint, client
//! portal billing routes and admin billing routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
