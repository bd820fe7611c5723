//! Billing invariants
//!
//! Read-only consistency checks over the billing tables. They can be run
//! after a webhook replay or on a schedule; each violation carries enough
//! context to find the offending rows.

use agora_shared::StoreError;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::webhooks::PROCESSING_TIMEOUT;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Principals or offerings affected
    pub affected_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money was or may be credited incorrectly
    Critical,
    /// Entitlement state is inconsistent
    High,
    /// Derived counters drifted
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateEventRow {
    provider_event_id: String,
    entry_count: i64,
    principal_ids: Vec<Uuid>,
}

#[derive(Debug, sqlx::FromRow)]
struct RevenueDriftRow {
    offering_id: Uuid,
    name: String,
    total_earnings: i64,
    ledger_total: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledWithIdsRow {
    principal_id: Uuid,
    tier: String,
    provider_subscription_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateSubscriptionRow {
    principal_id: Uuid,
    offering_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CountDriftRow {
    offering_id: Uuid,
    subscription_count: i64,
    live_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StuckClaimRow {
    provider_event_id: String,
    event_type: String,
    started_at: OffsetDateTime,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_unique_ledger_events().await?);
        violations.extend(self.check_revenue_matches_ledger().await?);
        violations.extend(self.check_canceled_holds_no_provider_ids().await?);
        violations.extend(self.check_single_subscription_per_offering().await?);
        violations.extend(self.check_subscription_count_matches().await?);
        violations.extend(self.check_no_stuck_webhook_claims(now).await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one ledger entry per provider event
    ///
    /// Guarded by a unique index; a hit here means the index was dropped and
    /// a replayed event credited twice.
    async fn check_unique_ledger_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateEventRow> = sqlx::query_as(
            r#"
            SELECT provider_event_id,
                   COUNT(*) AS entry_count,
                   ARRAY_AGG(DISTINCT principal_id) AS principal_ids
            FROM ledger_entries
            WHERE provider_event_id IS NOT NULL
            GROUP BY provider_event_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unique_ledger_events".to_string(),
                affected_ids: row.principal_ids,
                description: format!(
                    "Provider event '{}' has {} ledger entries (expected 1)",
                    row.provider_event_id, row.entry_count
                ),
                context: serde_json::json!({
                    "provider_event_id": row.provider_event_id,
                    "entry_count": row.entry_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Offering revenue equals the creator share recorded in the ledger
    async fn check_revenue_matches_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RevenueDriftRow> = sqlx::query_as(
            r#"
            SELECT o.id AS offering_id,
                   o.name,
                   o.total_earnings,
                   COALESCE(SUM(l.amount - l.platform_fee), 0)::BIGINT AS ledger_total
            FROM offerings o
            LEFT JOIN ledger_entries l ON l.offering_id = o.id
            GROUP BY o.id, o.name, o.total_earnings
            HAVING o.total_earnings <> COALESCE(SUM(l.amount - l.platform_fee), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "revenue_matches_ledger".to_string(),
                affected_ids: vec![row.offering_id],
                description: format!(
                    "Offering '{}' reports {} earned but the ledger sums to {}",
                    row.name, row.total_earnings, row.ledger_total
                ),
                context: serde_json::json!({
                    "total_earnings": row.total_earnings,
                    "ledger_total": row.ledger_total,
                    "difference": row.total_earnings - row.ledger_total,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A canceled platform subscription leaves no provider link and no paid tier
    async fn check_canceled_holds_no_provider_ids(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledWithIdsRow> = sqlx::query_as(
            r#"
            SELECT id AS principal_id, tier, provider_subscription_id
            FROM principals
            WHERE subscription_status = 'canceled'
              AND (provider_subscription_id IS NOT NULL OR tier <> 'free')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_holds_no_provider_ids".to_string(),
                affected_ids: vec![row.principal_id],
                description: format!(
                    "Canceled principal still on tier '{}' with subscription {}",
                    row.tier,
                    row.provider_subscription_id.as_deref().unwrap_or("(none)")
                ),
                context: serde_json::json!({
                    "tier": row.tier,
                    "provider_subscription_id": row.provider_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// One subscription record per (principal, offering)
    async fn check_single_subscription_per_offering(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT principal_id, offering_id, COUNT(*) AS sub_count
            FROM offering_subscriptions
            GROUP BY principal_id, offering_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_subscription_per_offering".to_string(),
                affected_ids: vec![row.principal_id, row.offering_id],
                description: format!(
                    "Principal has {} subscriptions to one offering (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_subscription_count_matches(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CountDriftRow> = sqlx::query_as(
            r#"
            SELECT o.id AS offering_id,
                   o.subscription_count,
                   COUNT(s.id) FILTER (WHERE s.status IN ('active', 'trialing')) AS live_count
            FROM offerings o
            LEFT JOIN offering_subscriptions s ON s.offering_id = o.id
            GROUP BY o.id, o.subscription_count
            HAVING o.subscription_count
                <> COUNT(s.id) FILTER (WHERE s.status IN ('active', 'trialing'))
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_count_matches".to_string(),
                affected_ids: vec![row.offering_id],
                description: format!(
                    "Offering reports {} subscribers but {} are live",
                    row.subscription_count, row.live_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.subscription_count,
                    "live_count": row.live_count,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_no_stuck_webhook_claims(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StuckClaimRow> = sqlx::query_as(
            r#"
            SELECT provider_event_id, event_type, started_at
            FROM webhook_events
            WHERE status = 'processing' AND started_at < $1
            ORDER BY started_at
            "#,
        )
        .bind(now - PROCESSING_TIMEOUT)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stuck_webhook_claims".to_string(),
                affected_ids: Vec::new(),
                description: format!(
                    "Webhook event '{}' ({}) has been processing since {}",
                    row.provider_event_id, row.event_type, row.started_at
                ),
                context: serde_json::json!({
                    "provider_event_id": row.provider_event_id,
                    "event_type": row.event_type,
                }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "unique_ledger_events" => self.check_unique_ledger_events().await,
            "revenue_matches_ledger" => self.check_revenue_matches_ledger().await,
            "canceled_holds_no_provider_ids" => self.check_canceled_holds_no_provider_ids().await,
            "single_subscription_per_offering" => {
                self.check_single_subscription_per_offering().await
            }
            "subscription_count_matches" => self.check_subscription_count_matches().await,
            "no_stuck_webhook_claims" => {
                self.check_no_stuck_webhook_claims(OffsetDateTime::now_utc())
                    .await
            }
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "unique_ledger_events",
            "revenue_matches_ledger",
            "canceled_holds_no_provider_ids",
            "single_subscription_per_offering",
            "subscription_count_matches",
            "no_stuck_webhook_claims",
        ]
    }
}
