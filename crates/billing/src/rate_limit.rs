//! Tier-based rate limiting
//!
//! Fixed windows counted in the shared counter store, keyed by subject,
//! tier and window start. A counter-store outage fails open.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use agora_shared::{MemoryWindowCounter, PrincipalId, SubscriptionTier, WindowCounter};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Request budget of one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimit {
    pub max_requests: u64,
    pub window: Duration,
}

impl TierLimit {
    pub const fn new(max_requests: u64, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }

    pub fn window_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }
}

/// Rate limit configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub free: TierLimit,
    pub pro: TierLimit,
    pub enterprise: TierLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            free: TierLimit::new(10, 60 * 60),
            pro: TierLimit::new(100, 60),
            enterprise: TierLimit::new(1000, 60),
        }
    }
}

impl RateLimitConfig {
    /// Override defaults from `RATE_LIMIT_{FREE,PRO,ENTERPRISE}_{MAX,WINDOW_SECS}`
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            free: tier_from_env("FREE", defaults.free)?,
            pro: tier_from_env("PRO", defaults.pro)?,
            enterprise: tier_from_env("ENTERPRISE", defaults.enterprise)?,
        })
    }

    pub fn for_tier(&self, tier: SubscriptionTier) -> TierLimit {
        match tier {
            SubscriptionTier::Free => self.free,
            SubscriptionTier::Pro => self.pro,
            SubscriptionTier::Enterprise => self.enterprise,
        }
    }
}

fn tier_from_env(name: &str, default: TierLimit) -> BillingResult<TierLimit> {
    let read = |suffix: &str, fallback: u64| -> BillingResult<u64> {
        let key = format!("RATE_LIMIT_{}_{}", name, suffix);
        match std::env::var(&key) {
            Ok(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|v| *v > 0)
                .ok_or_else(|| BillingError::Config(format!("{} '{}' is invalid", key, raw))),
            Err(_) => Ok(fallback),
        }
    };
    Ok(TierLimit::new(
        read("MAX", default.max_requests)?,
        read("WINDOW_SECS", default.window_secs())?,
    ))
}

/// Who a request is counted against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateLimitSubject {
    Principal(PrincipalId),
    /// Unauthenticated caller, keyed by client address
    Anonymous(String),
}

impl fmt::Display for RateLimitSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitSubject::Principal(id) => write!(f, "{}", id),
            RateLimitSubject::Anonymous(addr) => write!(f, "anon:{}", addr),
        }
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after_seconds: Option<u64>,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_at: OffsetDateTime,
}

/// Rate limiter over a shared window counter
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    counter: Arc<dyn WindowCounter>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, counter: Arc<dyn WindowCounter>) -> Self {
        Self { config, counter }
    }

    /// Limiter over a process-local counter (tests, single instance)
    pub fn new_in_memory(config: RateLimitConfig) -> Self {
        Self::new(config, Arc::new(MemoryWindowCounter::new()))
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request and report whether it fits the tier's window
    pub async fn check(&self, subject: &RateLimitSubject, tier: SubscriptionTier) -> RateLimitResult {
        self.check_at(subject, tier, OffsetDateTime::now_utc()).await
    }

    pub async fn check_at(
        &self,
        subject: &RateLimitSubject,
        tier: SubscriptionTier,
        now: OffsetDateTime,
    ) -> RateLimitResult {
        let limit = self.config.for_tier(tier);
        let window_secs = limit.window_secs();
        let now_secs = now.unix_timestamp().max(0) as u64;
        let window_start = now_secs - now_secs % window_secs;
        let reset_at = OffsetDateTime::from_unix_timestamp((window_start + window_secs) as i64)
            .unwrap_or(now);

        let key = format!("ratelimit:{}:{}:{}", subject, tier, window_start);

        let count = match self.counter.increment(&key, limit.window).await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(
                    subject = %subject,
                    tier = %tier,
                    error = %e,
                    "Rate limit counter unavailable, allowing request"
                );
                return RateLimitResult {
                    allowed: true,
                    limit: limit.max_requests,
                    remaining: limit.max_requests,
                    retry_after_seconds: None,
                    reset_at,
                };
            }
        };

        let allowed = count <= limit.max_requests;
        RateLimitResult {
            allowed,
            limit: limit.max_requests,
            remaining: limit.max_requests.saturating_sub(count),
            retry_after_seconds: (!allowed).then_some(window_secs),
            reset_at,
        }
    }

    /// Like [`check`](Self::check) but rejects with `BillingError::RateLimited`
    pub async fn enforce(
        &self,
        subject: &RateLimitSubject,
        tier: SubscriptionTier,
    ) -> BillingResult<RateLimitResult> {
        let result = self.check(subject, tier).await;
        if result.allowed {
            return Ok(result);
        }

        tracing::warn!(subject = %subject, tier = %tier, "Rate limit exceeded");
        let window_seconds = self.config.for_tier(tier).window_secs();
        Err(BillingError::RateLimited {
            limit: result.limit,
            window_seconds,
            retry_after_seconds: result.retry_after_seconds.unwrap_or(window_seconds),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_shared::{StoreError, StoreResult};
    use async_trait::async_trait;

    struct BrokenCounter;

    #[async_trait]
    impl WindowCounter for BrokenCounter {
        async fn increment(&self, _key: &str, _ttl: Duration) -> StoreResult<u64> {
            Err(StoreError::Counter("connection refused".to_string()))
        }
    }

    #[test]
    fn test_default_windows() {
        let config = RateLimitConfig::default();
        assert_eq!(config.free, TierLimit::new(10, 3600));
        assert_eq!(config.pro, TierLimit::new(100, 60));
        assert_eq!(config.enterprise, TierLimit::new(1000, 60));
    }

    #[test]
    fn test_subject_keys() {
        let id = PrincipalId::new();
        assert_eq!(RateLimitSubject::Principal(id).to_string(), id.to_string());
        assert_eq!(
            RateLimitSubject::Anonymous("10.0.0.1".to_string()).to_string(),
            "anon:10.0.0.1"
        );
    }

    #[tokio::test]
    async fn test_counter_outage_fails_open() {
        let limiter = RateLimiter::new(RateLimitConfig::default(), Arc::new(BrokenCounter));
        let subject = RateLimitSubject::Principal(PrincipalId::new());

        for _ in 0..20 {
            let result = limiter.check(&subject, SubscriptionTier::Free).await;
            assert!(result.allowed);
        }
    }

    #[tokio::test]
    async fn test_tiers_use_separate_windows() {
        let limiter = RateLimiter::new_in_memory(RateLimitConfig {
            free: TierLimit::new(1, 3600),
            pro: TierLimit::new(2, 60),
            enterprise: TierLimit::new(3, 60),
        });
        let subject = RateLimitSubject::Principal(PrincipalId::new());

        assert!(limiter.check(&subject, SubscriptionTier::Free).await.allowed);
        assert!(!limiter.check(&subject, SubscriptionTier::Free).await.allowed);
        // An upgrade starts from a fresh window
        assert!(limiter.check(&subject, SubscriptionTier::Pro).await.allowed);
    }
}
