//! Monthly usage tracking
//!
//! Every authenticated call is counted. Only the free tier is held to its
//! quota; the check, the optional 30-day reset and the increment happen in
//! one store operation.

use std::sync::Arc;

use agora_shared::{BillingStore, PrincipalId, SubscriptionTier, UsageCheck, UsageOutcome};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};

/// Usage figures returned to the caller as response headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageStatus {
    pub usage: i64,
    pub limit: i64,
}

#[derive(Clone)]
pub struct UsageTracker {
    store: Arc<dyn BillingStore>,
    window: Duration,
}

impl UsageTracker {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self {
            store,
            window: agora_shared::USAGE_WINDOW,
        }
    }

    /// Count one call by `principal`, enforcing the quota when `tier` is free.
    pub async fn track(
        &self,
        principal: PrincipalId,
        tier: SubscriptionTier,
    ) -> BillingResult<UsageStatus> {
        let check = UsageCheck {
            enforce_quota: tier == SubscriptionTier::Free,
            now: OffsetDateTime::now_utc(),
            window: self.window,
        };

        match self.store.record_usage(principal, &check).await? {
            UsageOutcome::Admitted {
                usage,
                limit,
                reset,
            } => {
                if reset {
                    tracing::info!(principal_id = %principal, "Monthly usage window reset");
                }
                Ok(UsageStatus { usage, limit })
            }
            UsageOutcome::Exceeded {
                usage,
                limit,
                last_reset,
            } => {
                tracing::warn!(
                    principal_id = %principal,
                    usage = usage,
                    limit = limit,
                    "Free tier monthly limit reached"
                );
                Err(BillingError::QuotaExceeded {
                    usage,
                    limit,
                    reset_date: last_reset + self.window,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_shared::{MemoryStore, Principal};

    async fn tracker_with(principal: &Principal) -> (UsageTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_principal(principal).await.unwrap();
        (UsageTracker::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_quota_error_carries_reset_date() {
        let mut principal = Principal::new("a@example.com", None, 10);
        let last_reset = OffsetDateTime::now_utc() - Duration::days(3);
        principal.subscription.usage_count = 10;
        principal.subscription.last_usage_reset = last_reset;
        let (tracker, _) = tracker_with(&principal).await;

        let err = tracker
            .track(principal.id, SubscriptionTier::Free)
            .await
            .unwrap_err();
        match err {
            BillingError::QuotaExceeded {
                usage,
                limit,
                reset_date,
            } => {
                assert_eq!(usage, 10);
                assert_eq!(limit, 10);
                assert_eq!(reset_date, last_reset + Duration::days(30));
            }
            other => panic!("expected QuotaExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_paid_tier_counts_without_enforcing() {
        let mut principal = Principal::new("a@example.com", None, 10);
        principal.subscription.usage_count = 10;
        let (tracker, store) = tracker_with(&principal).await;

        let status = tracker
            .track(principal.id, SubscriptionTier::Pro)
            .await
            .unwrap();
        assert_eq!(status.usage, 11);

        let stored = store.get_principal(principal.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription.usage_count, 11);
    }

    #[tokio::test]
    async fn test_unknown_principal_is_not_found() {
        let tracker = UsageTracker::new(Arc::new(MemoryStore::new()));
        let err = tracker
            .track(PrincipalId::new(), SubscriptionTier::Free)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
