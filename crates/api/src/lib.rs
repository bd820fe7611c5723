// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![allow(clippy::result_large_err)] // ApiError wraps BillingError

//! Agora API Library
//!
//! HTTP surface of the billing subsystem: bearer authentication, the
//! admission chain (tier, rate limit, usage quota), payment routes and the
//! provider webhook endpoint.

pub mod admission;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
