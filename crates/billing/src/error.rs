//! Billing error types

use agora_shared::StoreError;
use thiserror::Error;
use time::OffsetDateTime;

use crate::provider::ProviderError;

#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Billing not configured: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Payout account error: {0}")]
    PayoutAccount(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Usage quota exceeded: {usage}/{limit}")]
    QuotaExceeded {
        usage: i64,
        limit: i64,
        reset_date: OffsetDateTime,
    },

    #[error("Rate limit exceeded: {limit} requests per window")]
    RateLimited {
        limit: u64,
        window_seconds: u64,
        retry_after_seconds: u64,
    },

    #[error("Store error: {0}")]
    Store(String),
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => BillingError::NotFound(what),
            other => BillingError::Store(other.to_string()),
        }
    }
}

impl From<ProviderError> for BillingError {
    fn from(err: ProviderError) -> Self {
        BillingError::Provider(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
