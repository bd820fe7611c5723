// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![allow(clippy::result_large_err)] // BillingError::QuotaExceeded carries the reset date

//! Agora Billing Module
//!
//! Keeps entitlement, usage and creator revenue in agreement with the
//! payment provider.
//!
//! ## Features
//!
//! - **Tier Resolution**: Effective tier read from the persisted subscription on every request
//! - **Rate Limiting**: Fixed windows per tier in a shared counter store
//! - **Usage Tracking**: Monthly free-tier quota with atomic check-and-increment
//! - **Payments**: Customers, payout accounts, destination charges and subscriptions
//! - **Webhooks**: Idempotent provider event processing feeding the ledger
//! - **Invariants**: Scheduled consistency checks over the billing tables

pub mod client;
pub mod error;
pub mod invariants;
pub mod ledger;
mod lifecycle;
pub mod payments;
pub mod provider;
pub mod rate_limit;
pub mod tier;
pub mod usage;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod mock;


// Client
pub use client::{PaymentSettings, PriceIds, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{FeeSplit, TransactionLedger};

// Payments
pub use payments::{
    EarningsSummary, OfferingEarnings, OneTimeCharge, PaymentOrchestrator, PayoutOnboarding,
    PurchaseHistory, RecurringCharge,
};

// Provider
pub use provider::{HostedSession, PaymentProvider, ProviderError, StripeProvider};

// Rate Limit
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimitSubject, RateLimiter, TierLimit};

// Tier
pub use tier::{effective_tier, TierResolver};

// Usage
pub use usage::{UsageStatus, UsageTracker};

// Webhooks
pub use webhooks::{verify_signature, WebhookEvent, WebhookOutcome, WebhookProcessor};

use std::sync::Arc;

use agora_shared::{
    BillingStore, Principal, PrincipalId, SubscriptionStatus, SubscriptionTier, WindowCounter,
    USAGE_WINDOW,
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::lifecycle::Lifecycle;

/// Default monthly call quota of the free tier
pub const DEFAULT_FREE_USAGE_LIMIT: i64 = 10;

/// Everything the billing service needs from the environment
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// `None` disables payments; entitlement and usage still work
    pub stripe: Option<StripeConfig>,
    pub settings: PaymentSettings,
    pub rate_limits: RateLimitConfig,
    pub free_usage_limit: i64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            stripe: None,
            settings: PaymentSettings::default(),
            rate_limits: RateLimitConfig::default(),
            free_usage_limit: DEFAULT_FREE_USAGE_LIMIT,
        }
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let stripe = match StripeConfig::from_env() {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(error = %e, "Stripe not configured, payments disabled");
                None
            }
        };
        let free_usage_limit = match std::env::var("FREE_TIER_USAGE_LIMIT") {
            Ok(raw) => raw.parse::<i64>().ok().filter(|v| *v >= 0).ok_or_else(|| {
                BillingError::Config(format!("FREE_TIER_USAGE_LIMIT '{}' is invalid", raw))
            })?,
            Err(_) => DEFAULT_FREE_USAGE_LIMIT,
        };

        Ok(Self {
            settings: match &stripe {
                Some(config) => config.settings.clone(),
                None => PaymentSettings::from_env()?,
            },
            stripe,
            rate_limits: RateLimitConfig::from_env()?,
            free_usage_limit,
        })
    }
}

/// Subscription state as shown to its owner
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    /// Tier currently in effect
    pub tier: SubscriptionTier,
    /// Tier recorded on the subscription
    pub subscribed_tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// Quota state as shown to its owner
#[derive(Debug, Clone, Serialize)]
pub struct UsageInfo {
    pub tier: SubscriptionTier,
    pub usage: i64,
    pub limit: i64,
    /// Whether `limit` is enforced for the current tier
    pub enforced: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_date: OffsetDateTime,
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub tiers: TierResolver,
    pub rate_limiter: RateLimiter,
    pub usage: UsageTracker,
    pub payments: PaymentOrchestrator,
    pub webhooks: WebhookProcessor,
    pub ledger: TransactionLedger,
    store: Arc<dyn BillingStore>,
    free_usage_limit: i64,
    lifecycle: Lifecycle,
}

impl BillingService {
    /// Build the service over explicit collaborators
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        counter: Arc<dyn WindowCounter>,
        provider: Option<Arc<dyn PaymentProvider>>,
    ) -> Self {
        let lifecycle = Lifecycle::new();
        let webhook_secret = config.stripe.as_ref().map(|s| s.webhook_secret.clone());

        Self {
            tiers: TierResolver::new(store.clone()),
            rate_limiter: RateLimiter::new(config.rate_limits, counter),
            usage: UsageTracker::new(store.clone()),
            payments: PaymentOrchestrator::new(
                store.clone(),
                provider,
                config.settings.clone(),
                lifecycle.clone(),
            ),
            webhooks: WebhookProcessor::new(
                store.clone(),
                webhook_secret,
                config.settings,
                lifecycle.clone(),
            ),
            ledger: TransactionLedger::new(store.clone()),
            store,
            free_usage_limit: config.free_usage_limit,
            lifecycle,
        }
    }

    /// Build the service with the Stripe provider when credentials are configured
    pub fn init(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        counter: Arc<dyn WindowCounter>,
    ) -> Self {
        let provider = config
            .stripe
            .as_ref()
            .map(|stripe| Arc::new(StripeProvider::new(stripe)) as Arc<dyn PaymentProvider>);

        tracing::info!(
            payments_enabled = provider.is_some(),
            platform_fee_percent = config.settings.platform_fee_percent,
            free_usage_limit = config.free_usage_limit,
            "Billing service initialized"
        );
        Self::new(config, store, counter, provider)
    }

    /// Stop accepting payment and webhook work. Idempotent.
    pub fn shutdown(&self) {
        if self.lifecycle.close() {
            tracing::info!("Billing service shut down");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_open()
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub fn free_usage_limit(&self) -> i64 {
        self.free_usage_limit
    }

    /// Create a principal on the free tier
    pub async fn register_principal(
        &self,
        email: &str,
        name: Option<String>,
    ) -> BillingResult<Principal> {
        let principal = Principal::new(email, name, self.free_usage_limit);
        self.store.insert_principal(&principal).await?;
        tracing::info!(principal_id = %principal.id, "Principal registered");
        Ok(principal)
    }

    pub async fn subscription_info(&self, id: PrincipalId) -> BillingResult<SubscriptionInfo> {
        let principal = self
            .store
            .get_principal(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("principal {}", id)))?;
        let sub = &principal.subscription;

        Ok(SubscriptionInfo {
            tier: effective_tier(sub, OffsetDateTime::now_utc()),
            subscribed_tier: sub.tier,
            status: sub.status,
            current_period_end: sub.current_period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
        })
    }

    pub async fn usage_info(&self, id: PrincipalId) -> BillingResult<UsageInfo> {
        let (tier, principal) = self.tiers.resolve_with_principal(id).await;
        let principal =
            principal.ok_or_else(|| BillingError::NotFound(format!("principal {}", id)))?;
        let sub = &principal.subscription;

        Ok(UsageInfo {
            tier,
            usage: sub.usage_count,
            limit: sub.usage_limit,
            enforced: tier == SubscriptionTier::Free,
            reset_date: sub.last_usage_reset + USAGE_WINDOW,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_shared::{MemoryStore, MemoryWindowCounter};

    fn service() -> BillingService {
        BillingService::init(
            BillingConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryWindowCounter::new()),
        )
    }

    #[tokio::test]
    async fn test_register_uses_configured_quota() {
        let billing = BillingService::new(
            BillingConfig {
                free_usage_limit: 25,
                ..BillingConfig::default()
            },
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryWindowCounter::new()),
            None,
        );
        let principal = billing
            .register_principal("new@example.com", None)
            .await
            .unwrap();
        assert_eq!(principal.subscription.usage_limit, 25);

        let usage = billing.usage_info(principal.id).await.unwrap();
        assert_eq!(usage.usage, 0);
        assert!(usage.enforced);
    }

    #[tokio::test]
    async fn test_payments_disabled_without_stripe() {
        let billing = service();
        assert!(!billing.payments.is_configured());

        let principal = billing
            .register_principal("a@example.com", None)
            .await
            .unwrap();
        let err = billing
            .payments
            .ensure_customer(principal.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));

        let err = billing.webhooks.handle(b"{}", "t=1,v1=00").await.unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let billing = service();
        assert!(billing.is_running());
        billing.shutdown();
        billing.shutdown();
        assert!(!billing.is_running());
    }
}
