//! Tier resolution
//!
//! Always reads the persisted subscription; never caches. Any failure to
//! determine the tier degrades to free.

use std::sync::Arc;

use agora_shared::{BillingStore, Principal, PrincipalId, PrincipalSubscription, SubscriptionTier};
use time::OffsetDateTime;

/// Tier a subscription entitles its holder to at `now`
pub fn effective_tier(sub: &PrincipalSubscription, now: OffsetDateTime) -> SubscriptionTier {
    let in_period = sub.current_period_end.map_or(true, |end| end > now);
    if sub.status.grants_paid_access() && in_period {
        sub.tier
    } else {
        SubscriptionTier::Free
    }
}

#[derive(Clone)]
pub struct TierResolver {
    store: Arc<dyn BillingStore>,
}

impl TierResolver {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Resolve the tier of `principal` (anonymous callers are free)
    pub async fn resolve(&self, principal: Option<PrincipalId>) -> SubscriptionTier {
        let Some(id) = principal else {
            return SubscriptionTier::Free;
        };
        self.resolve_with_principal(id).await.0
    }

    /// Resolve the tier and return the record it was read from
    pub async fn resolve_with_principal(
        &self,
        id: PrincipalId,
    ) -> (SubscriptionTier, Option<Principal>) {
        match self.store.get_principal(id).await {
            Ok(Some(principal)) if principal.is_active => {
                let tier = effective_tier(&principal.subscription, OffsetDateTime::now_utc());
                (tier, Some(principal))
            }
            Ok(Some(principal)) => {
                tracing::debug!(principal_id = %id, "Inactive principal resolved as free tier");
                (SubscriptionTier::Free, Some(principal))
            }
            Ok(None) => {
                tracing::debug!(principal_id = %id, "Unknown principal resolved as free tier");
                (SubscriptionTier::Free, None)
            }
            Err(e) => {
                tracing::error!(
                    principal_id = %id,
                    error = %e,
                    "Failed to read subscription, defaulting to free tier"
                );
                (SubscriptionTier::Free, None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_shared::{MemoryStore, SubscriptionStatus};
    use time::Duration;

    fn paid(status: SubscriptionStatus, period_end: Option<OffsetDateTime>) -> Principal {
        let mut principal = Principal::new("p@example.com", None, 10);
        principal.subscription.tier = SubscriptionTier::Pro;
        principal.subscription.status = status;
        principal.subscription.current_period_end = period_end;
        principal
    }

    #[test]
    fn test_active_in_period_keeps_tier() {
        let now = OffsetDateTime::now_utc();
        let p = paid(SubscriptionStatus::Active, Some(now + Duration::days(3)));
        assert_eq!(effective_tier(&p.subscription, now), SubscriptionTier::Pro);
    }

    #[test]
    fn test_active_without_period_end_keeps_tier() {
        let now = OffsetDateTime::now_utc();
        let p = paid(SubscriptionStatus::Active, None);
        assert_eq!(effective_tier(&p.subscription, now), SubscriptionTier::Pro);
    }

    #[test]
    fn test_expired_period_is_free() {
        let now = OffsetDateTime::now_utc();
        let p = paid(SubscriptionStatus::Active, Some(now - Duration::seconds(1)));
        assert_eq!(effective_tier(&p.subscription, now), SubscriptionTier::Free);
    }

    #[test]
    fn test_non_active_statuses_are_free() {
        let now = OffsetDateTime::now_utc();
        for status in [
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::Inactive,
        ] {
            let p = paid(status, Some(now + Duration::days(3)));
            assert_eq!(
                effective_tier(&p.subscription, now),
                SubscriptionTier::Free,
                "{:?} must not grant paid tier",
                status
            );
        }
    }

    #[test]
    fn test_canceling_keeps_tier_until_period_end() {
        let now = OffsetDateTime::now_utc();
        let p = paid(SubscriptionStatus::Canceling, Some(now + Duration::days(3)));
        assert_eq!(effective_tier(&p.subscription, now), SubscriptionTier::Pro);
    }

    #[tokio::test]
    async fn test_missing_principal_is_free() {
        let resolver = TierResolver::new(Arc::new(MemoryStore::new()));
        assert_eq!(
            resolver.resolve(Some(PrincipalId::new())).await,
            SubscriptionTier::Free
        );
        assert_eq!(resolver.resolve(None).await, SubscriptionTier::Free);
    }

    #[tokio::test]
    async fn test_resolver_reads_store_every_time() {
        let store = Arc::new(MemoryStore::new());
        let resolver = TierResolver::new(store.clone());
        let principal = paid(SubscriptionStatus::Active, None);
        store.insert_principal(&principal).await.unwrap();

        assert_eq!(
            resolver.resolve(Some(principal.id)).await,
            SubscriptionTier::Pro
        );

        store.clear_principal_subscription(principal.id).await.unwrap();
        assert_eq!(
            resolver.resolve(Some(principal.id)).await,
            SubscriptionTier::Free
        );
    }
}
