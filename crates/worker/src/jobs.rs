//! Maintenance jobs run by the scheduler

use agora_billing::webhooks::PROCESSING_TIMEOUT;
use agora_billing::{BillingResult, InvariantCheckSummary, InvariantChecker, ViolationSeverity};
use agora_shared::{BillingStore, StoreResult};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};

/// Three attempts after the first, at roughly 10ms, 100ms and 1s
fn retry_strategy() -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(10)
        .max_delay(std::time::Duration::from_secs(5))
        .map(jitter)
        .take(3)
}

/// Midnight UTC on the first day of `now`'s month
pub fn month_start(now: OffsetDateTime) -> OffsetDateTime {
    let date = now.to_offset(time::UtcOffset::UTC).date();
    date.replace_day(1).unwrap_or(date).midnight().assume_utc()
}

/// Recompute every offering's monthly earnings from the ledger.
/// Absolute, so a repeated or late run gives the same result.
pub async fn rollover_monthly_earnings(
    store: &dyn BillingStore,
    now: OffsetDateTime,
) -> StoreResult<u64> {
    let start = month_start(now);
    let updated = Retry::spawn(retry_strategy(), || store.recompute_monthly_earnings(start)).await?;
    info!(
        month_start = %start,
        offerings_updated = updated,
        "Monthly earnings recomputed from ledger"
    );
    Ok(updated)
}

/// Release webhook claims whose worker died mid-processing so the
/// provider's next delivery can claim them again
pub async fn recover_stale_claims(store: &dyn BillingStore, now: OffsetDateTime) -> StoreResult<u64> {
    let cutoff = now - PROCESSING_TIMEOUT;
    let recovered =
        Retry::spawn(retry_strategy(), || store.recover_stale_webhook_claims(cutoff)).await?;
    if recovered > 0 {
        warn!(recovered = recovered, cutoff = %cutoff, "Recovered stale webhook claims");
    }
    Ok(recovered)
}

pub async fn run_invariant_checks(checker: &InvariantChecker) -> BillingResult<InvariantCheckSummary> {
    let summary = checker.run_all_checks().await?;

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = ?violation.severity,
                affected = violation.affected_ids.len(),
                description = %violation.description,
                "Billing invariant violated"
            ),
            _ => warn!(
                invariant = %violation.invariant,
                severity = ?violation.severity,
                affected = violation.affected_ids.len(),
                description = %violation.description,
                "Billing invariant violated"
            ),
        }
    }
    info!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant checks complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_shared::{
        BillingPlan, LedgerEntry, LedgerEntryType, MemoryStore, Offering, OfferingPrice,
        PriceType, Principal, WebhookEventStatus,
    };
    use time::macros::datetime;
    use time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_month_start() {
        assert_eq!(
            month_start(datetime!(2025-03-17 13:45:10 UTC)),
            datetime!(2025-03-01 00:00 UTC)
        );
        assert_eq!(
            month_start(datetime!(2025-03-01 00:00 UTC)),
            datetime!(2025-03-01 00:00 UTC)
        );
        // Converted to UTC before truncating
        assert_eq!(
            month_start(datetime!(2025-04-01 01:00 +02:00)),
            datetime!(2025-03-01 00:00 UTC)
        );
    }

    #[tokio::test]
    async fn test_rollover_drops_last_month() {
        let store = MemoryStore::new();
        let creator = Principal::new("creator@example.com", None, 10);
        let buyer = Principal::new("buyer@example.com", None, 10);
        store.insert_principal(&creator).await.unwrap();
        store.insert_principal(&buyer).await.unwrap();

        let mut offering = Offering::new(
            creator.id,
            "Tax Helper",
            OfferingPrice {
                price_type: PriceType::Premium,
                amount: 1000,
                currency: "usd".to_string(),
                plan: BillingPlan::Monthly,
            },
        );
        offering.revenue.monthly_earnings = 5_000;
        store.insert_offering(&offering).await.unwrap();

        let now = OffsetDateTime::now_utc();
        for (event, created_at) in [
            ("evt_last_month", month_start(now) - Duration::days(3)),
            ("evt_this_month", month_start(now) + Duration::seconds(1)),
        ] {
            store
                .append_ledger_entry(&LedgerEntry {
                    id: Uuid::new_v4(),
                    entry_type: LedgerEntryType::Payment,
                    amount: 1000,
                    platform_fee: 300,
                    currency: "usd".to_string(),
                    principal_id: buyer.id,
                    offering_id: Some(offering.id),
                    provider_event_id: Some(event.to_string()),
                    description: "purchase".to_string(),
                    created_at,
                })
                .await
                .unwrap();
        }

        rollover_monthly_earnings(&store, now).await.unwrap();
        let stored = store.get_offering(offering.id).await.unwrap().unwrap();
        assert_eq!(stored.revenue.monthly_earnings, 700);

        // Running again changes nothing
        assert_eq!(rollover_monthly_earnings(&store, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recover_only_stale_claims() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();

        store
            .claim_webhook_event(
                "evt_stuck",
                "invoice.paid",
                now - Duration::minutes(45),
                PROCESSING_TIMEOUT,
            )
            .await
            .unwrap();
        store
            .claim_webhook_event(
                "evt_fresh",
                "invoice.paid",
                now - Duration::minutes(5),
                PROCESSING_TIMEOUT,
            )
            .await
            .unwrap();

        assert_eq!(recover_stale_claims(&store, now).await.unwrap(), 1);

        let stuck = store.get_webhook_event("evt_stuck").await.unwrap().unwrap();
        assert_eq!(stuck.status, WebhookEventStatus::Failed);
        let fresh = store.get_webhook_event("evt_fresh").await.unwrap().unwrap();
        assert_eq!(fresh.status, WebhookEventStatus::Processing);
    }
}
