//! Stripe configuration

use std::time::Duration;

use agora_shared::SubscriptionTier;

use crate::error::{BillingError, BillingResult};

/// Default share of each creator sale retained by the platform
pub const DEFAULT_PLATFORM_FEE_PERCENT: u8 = 30;

/// Default bound on a single outbound provider call
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;

/// Provider price ids of the paid platform tiers
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub pro: Option<String>,
    pub enterprise: Option<String>,
}

impl PriceIds {
    pub fn for_tier(&self, tier: SubscriptionTier) -> Option<&str> {
        match tier {
            SubscriptionTier::Free => None,
            SubscriptionTier::Pro => self.pro.as_deref(),
            SubscriptionTier::Enterprise => self.enterprise.as_deref(),
        }
    }

    /// Reverse lookup used when a provider payload carries no tier metadata
    pub fn tier_for_price(&self, price_id: &str) -> Option<SubscriptionTier> {
        if self.pro.as_deref() == Some(price_id) {
            Some(SubscriptionTier::Pro)
        } else if self.enterprise.as_deref() == Some(price_id) {
            Some(SubscriptionTier::Enterprise)
        } else {
            None
        }
    }
}

/// Settings shared by the payment orchestrator and the webhook processor
#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub platform_fee_percent: u8,
    pub provider_timeout: Duration,
    pub price_ids: PriceIds,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            platform_fee_percent: DEFAULT_PLATFORM_FEE_PERCENT,
            provider_timeout: Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS),
            price_ids: PriceIds::default(),
        }
    }
}

impl PaymentSettings {
    /// Read the non-secret settings. Malformed values are configuration errors.
    pub fn from_env() -> BillingResult<Self> {
        let platform_fee_percent = match std::env::var("PLATFORM_FEE_PERCENT") {
            Ok(raw) => raw
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| {
                    BillingError::Config(format!("PLATFORM_FEE_PERCENT '{}' is not 0-100", raw))
                })?,
            Err(_) => DEFAULT_PLATFORM_FEE_PERCENT,
        };

        let timeout_secs = match std::env::var("STRIPE_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                BillingError::Config(format!("STRIPE_TIMEOUT_SECS '{}' is not a number", raw))
            })?,
            Err(_) => DEFAULT_PROVIDER_TIMEOUT_SECS,
        };

        Ok(Self {
            platform_fee_percent,
            provider_timeout: Duration::from_secs(timeout_secs),
            price_ids: PriceIds {
                pro: std::env::var("STRIPE_PRICE_PRO").ok().filter(|s| !s.is_empty()),
                enterprise: std::env::var("STRIPE_PRICE_ENTERPRISE")
                    .ok()
                    .filter(|s| !s.is_empty()),
            },
        })
    }
}

/// Stripe credentials plus payment settings
#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub settings: PaymentSettings,
}

impl StripeConfig {
    /// Load from environment. Missing credentials yield `BillingError::Config`,
    /// which callers treat as "payments disabled".
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        Ok(Self {
            secret_key,
            webhook_secret,
            settings: PaymentSettings::from_env()?,
        })
    }
}

// Keep secrets out of logs
impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("test_mode", &self.secret_key.starts_with("sk_test_"))
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_lookup_both_ways() {
        let ids = PriceIds {
            pro: Some("price_pro".to_string()),
            enterprise: Some("price_ent".to_string()),
        };
        assert_eq!(ids.for_tier(SubscriptionTier::Pro), Some("price_pro"));
        assert_eq!(ids.for_tier(SubscriptionTier::Free), None);
        assert_eq!(
            ids.tier_for_price("price_ent"),
            Some(SubscriptionTier::Enterprise)
        );
        assert_eq!(ids.tier_for_price("price_other"), None);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = StripeConfig {
            secret_key: "sk_test_supersecret".to_string(),
            webhook_secret: "whsec_supersecret".to_string(),
            settings: PaymentSettings::default(),
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("supersecret"));
        assert!(rendered.contains("test_mode: true"));
    }
}
