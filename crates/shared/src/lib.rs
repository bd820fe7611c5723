#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Agora shared types and storage
//!
//! Records, the [`BillingStore`] abstraction with its PostgreSQL and
//! in-memory backends, and the shared rate-limit window counters.

pub mod counter;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use counter::{MemoryWindowCounter, RedisWindowCounter, WindowCounter};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use postgres::{create_pool, run_migrations, PgStore};
pub use store::{
    evaluate_usage, BillingStore, ClaimOutcome, PaymentCredit, PrincipalSubscriptionSync,
    RenewalUpdate, UsageCheck, UsageOutcome, USAGE_WINDOW,
};
pub use types::*;
