//! Bearer token authentication for portal and admin routes

pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{Claims, JwtManager, ROLE_ADMIN, ROLE_CLIENT};
pub use middleware::{require_admin, require_auth, AuthError, AuthState, AuthUser};
