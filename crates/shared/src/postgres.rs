//! PostgreSQL billing store
//!
//! Every atomic operation of [`BillingStore`] maps to a single conditional
//! statement (`UPDATE … WHERE … RETURNING`, `INSERT … ON CONFLICT`) or, for
//! the ledger credit, one transaction.

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    BillingStore, ClaimOutcome, PaymentCredit, PrincipalSubscriptionSync, UsageCheck,
    UsageOutcome,
};
use crate::types::{
    LedgerEntry, Offering, OfferingId, OfferingPrice, OfferingSubscription,
    OfferingSubscriptionStatus, Principal, PrincipalId, PrincipalSubscription, Revenue,
    SubscriptionStatus, WebhookEventRecord, WebhookEventStatus,
};

/// Create a PostgreSQL connection pool
pub async fn create_pool(database_url: &str, max_connections: u32) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(StdDuration::from_secs(5))
        .connect(database_url)
        .await?;

    tracing::info!(max_connections, "Database pool created");
    Ok(pool)
}

/// Apply pending schema migrations
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("migration failed: {}", e)))?;
    tracing::info!("Database migrations applied");
    Ok(())
}

const PRINCIPAL_COLUMNS: &str = r#"
    id, email, name, tier, usage_count, usage_limit, last_usage_reset,
    provider_subscription_id, provider_price_id, subscription_status,
    current_period_end, cancel_at_period_end, customer_id, payout_account_id,
    is_active, created_at
"#;

const OFFERING_COLUMNS: &str = r#"
    id, creator_id, name, description, price_type, price_amount, currency,
    billing_plan, price_ref, total_earnings, monthly_earnings,
    subscription_count, is_published, created_at
"#;

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, principal_id, offering_id, provider_subscription_id, status, plan,
    amount, currency, renewal_count, next_billing_date, canceled_at,
    created_at, updated_at
"#;

const LEDGER_COLUMNS: &str = r#"
    id, entry_type, amount, platform_fee, currency, principal_id, offering_id,
    provider_event_id, description, created_at
"#;

fn principal_from_row(row: &PgRow) -> StoreResult<Principal> {
    let tier: String = row.try_get("tier")?;
    let status: String = row.try_get("subscription_status")?;
    Ok(Principal {
        id: PrincipalId(row.try_get("id")?),
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        subscription: PrincipalSubscription {
            tier: tier.parse()?,
            usage_count: row.try_get("usage_count")?,
            usage_limit: row.try_get("usage_limit")?,
            last_usage_reset: row.try_get("last_usage_reset")?,
            provider_subscription_id: row.try_get("provider_subscription_id")?,
            provider_price_id: row.try_get("provider_price_id")?,
            status: status.parse()?,
            current_period_end: row.try_get("current_period_end")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
        },
        customer_id: row.try_get("customer_id")?,
        payout_account_id: row.try_get("payout_account_id")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn offering_from_row(row: &PgRow) -> StoreResult<Offering> {
    let price_type: String = row.try_get("price_type")?;
    let plan: String = row.try_get("billing_plan")?;
    Ok(Offering {
        id: OfferingId(row.try_get("id")?),
        creator_id: PrincipalId(row.try_get("creator_id")?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        price: OfferingPrice {
            price_type: price_type.parse()?,
            amount: row.try_get("price_amount")?,
            currency: row.try_get("currency")?,
            plan: plan.parse()?,
        },
        price_ref: row.try_get("price_ref")?,
        revenue: Revenue {
            total_earnings: row.try_get("total_earnings")?,
            monthly_earnings: row.try_get("monthly_earnings")?,
            subscription_count: row.try_get("subscription_count")?,
        },
        is_published: row.try_get("is_published")?,
        created_at: row.try_get("created_at")?,
    })
}

fn subscription_from_row(row: &PgRow) -> StoreResult<OfferingSubscription> {
    let status: String = row.try_get("status")?;
    let plan: String = row.try_get("plan")?;
    Ok(OfferingSubscription {
        id: row.try_get("id")?,
        principal_id: PrincipalId(row.try_get("principal_id")?),
        offering_id: OfferingId(row.try_get("offering_id")?),
        provider_subscription_id: row.try_get("provider_subscription_id")?,
        status: status.parse()?,
        plan: plan.parse()?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        renewal_count: row.try_get("renewal_count")?,
        next_billing_date: row.try_get("next_billing_date")?,
        canceled_at: row.try_get("canceled_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ledger_from_row(row: &PgRow) -> StoreResult<LedgerEntry> {
    let entry_type: String = row.try_get("entry_type")?;
    let offering_id: Option<Uuid> = row.try_get("offering_id")?;
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        entry_type: entry_type.parse()?,
        amount: row.try_get("amount")?,
        platform_fee: row.try_get("platform_fee")?,
        currency: row.try_get("currency")?,
        principal_id: PrincipalId(row.try_get("principal_id")?),
        offering_id: offering_id.map(OfferingId),
        provider_event_id: row.try_get("provider_event_id")?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

fn webhook_event_from_row(row: &PgRow) -> StoreResult<WebhookEventRecord> {
    let status: String = row.try_get("status")?;
    Ok(WebhookEventRecord {
        provider_event_id: row.try_get("provider_event_id")?,
        event_type: row.try_get("event_type")?,
        status: status.parse()?,
        started_at: row.try_get("started_at")?,
        error_message: row.try_get("error_message")?,
    })
}

/// Billing store backed by PostgreSQL
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()> {
        let sub = &principal.subscription;
        sqlx::query(
            r#"
            INSERT INTO principals (
                id, email, name, tier, usage_count, usage_limit, last_usage_reset,
                provider_subscription_id, provider_price_id, subscription_status,
                current_period_end, cancel_at_period_end, customer_id, payout_account_id,
                is_active, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(principal.id.0)
        .bind(&principal.email)
        .bind(&principal.name)
        .bind(sub.tier.as_str())
        .bind(sub.usage_count)
        .bind(sub.usage_limit)
        .bind(sub.last_usage_reset)
        .bind(&sub.provider_subscription_id)
        .bind(&sub.provider_price_id)
        .bind(sub.status.as_str())
        .bind(sub.current_period_end)
        .bind(sub.cancel_at_period_end)
        .bind(&principal.customer_id)
        .bind(&principal.payout_account_id)
        .bind(principal.is_active)
        .bind(principal.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_principal(&self, id: PrincipalId) -> StoreResult<Option<Principal>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM principals WHERE id = $1",
            PRINCIPAL_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(principal_from_row).transpose()
    }

    async fn set_principal_active(&self, id: PrincipalId, active: bool) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE principals SET is_active = $2 WHERE id = $1")
            .bind(id.0)
            .bind(active)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_customer_id_if_absent(
        &self,
        id: PrincipalId,
        customer_id: &str,
    ) -> StoreResult<String> {
        // A no-op SET on the losing side still returns the winner's id
        let stored: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            UPDATE principals
            SET customer_id = COALESCE(customer_id, $2)
            WHERE id = $1
            RETURNING customer_id
            "#,
        )
        .bind(id.0)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        stored
            .and_then(|(c,)| c)
            .ok_or_else(|| StoreError::NotFound(format!("principal {}", id)))
    }

    async fn set_payout_account_if_absent(
        &self,
        id: PrincipalId,
        account_id: &str,
    ) -> StoreResult<String> {
        let stored: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            UPDATE principals
            SET payout_account_id = COALESCE(payout_account_id, $2)
            WHERE id = $1
            RETURNING payout_account_id
            "#,
        )
        .bind(id.0)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        stored
            .and_then(|(a,)| a)
            .ok_or_else(|| StoreError::NotFound(format!("principal {}", id)))
    }

    async fn record_usage(
        &self,
        id: PrincipalId,
        check: &UsageCheck,
    ) -> StoreResult<UsageOutcome> {
        // The row lock taken by the CTE serializes concurrent callers: the
        // verdict is computed from the value this statement overwrites.
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT id, usage_count, usage_limit, last_usage_reset
                FROM principals
                WHERE id = $1
                FOR UPDATE
            ),
            decision AS (
                SELECT id, usage_count, usage_limit, last_usage_reset,
                    CASE
                        WHEN NOT $2 OR usage_count < usage_limit THEN 'admit'
                        WHEN last_usage_reset <= $3 THEN 'reset'
                        ELSE 'exceed'
                    END AS verdict
                FROM prev
            )
            UPDATE principals p
            SET usage_count = CASE d.verdict WHEN 'reset' THEN 1 ELSE d.usage_count + 1 END,
                last_usage_reset = CASE d.verdict WHEN 'reset' THEN $4 ELSE d.last_usage_reset END
            FROM decision d
            WHERE p.id = d.id
            RETURNING d.verdict, d.usage_count AS previous_count, p.usage_count,
                      p.usage_limit, d.last_usage_reset AS previous_reset
            "#,
        )
        .bind(id.0)
        .bind(check.enforce_quota)
        .bind(check.now - check.window)
        .bind(check.now)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("principal {}", id)))?;

        let verdict: String = row.try_get("verdict")?;
        let limit: i64 = row.try_get("usage_limit")?;
        match verdict.as_str() {
            "admit" | "reset" => Ok(UsageOutcome::Admitted {
                usage: row.try_get("usage_count")?,
                limit,
                reset: verdict == "reset",
            }),
            "exceed" => Ok(UsageOutcome::Exceeded {
                usage: row.try_get("previous_count")?,
                limit,
                last_reset: row.try_get("previous_reset")?,
            }),
            other => Err(StoreError::Corrupt(format!("usage verdict '{}'", other))),
        }
    }

    async fn sync_principal_subscription(
        &self,
        id: PrincipalId,
        sync: &PrincipalSubscriptionSync,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE principals
            SET tier = COALESCE($2, tier),
                provider_subscription_id = $3,
                provider_price_id = COALESCE($4, provider_price_id),
                subscription_status = $5,
                current_period_end = $6,
                cancel_at_period_end = $7
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(sync.tier.map(|t| t.as_str()))
        .bind(&sync.provider_subscription_id)
        .bind(&sync.provider_price_id)
        .bind(sync.status.as_str())
        .bind(sync.current_period_end)
        .bind(sync.cancel_at_period_end)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_principal_subscription_status(
        &self,
        id: PrincipalId,
        status: SubscriptionStatus,
        cancel_at_period_end: bool,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE principals
            SET subscription_status = $2, cancel_at_period_end = $3
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(cancel_at_period_end)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_principal_cancel_at_period_end(
        &self,
        id: PrincipalId,
        cancel: bool,
    ) -> StoreResult<Option<SubscriptionStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE principals
            SET cancel_at_period_end = $2,
                subscription_status = CASE
                    WHEN $2 AND subscription_status = 'active' THEN 'canceling'
                    WHEN NOT $2 AND subscription_status = 'canceling' THEN 'active'
                    ELSE subscription_status
                END
            WHERE id = $1
            RETURNING subscription_status
            "#,
        )
        .bind(id.0)
        .bind(cancel)
        .fetch_optional(&self.pool)
        .await?;
        status.map(|s| s.parse()).transpose()
    }

    async fn clear_principal_subscription(&self, id: PrincipalId) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE principals
            SET tier = 'free',
                subscription_status = 'canceled',
                provider_subscription_id = NULL,
                provider_price_id = NULL,
                cancel_at_period_end = FALSE
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_principal_by_provider_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<Principal>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM principals WHERE provider_subscription_id = $1",
            PRINCIPAL_COLUMNS
        ))
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(principal_from_row).transpose()
    }

    async fn insert_offering(&self, offering: &Offering) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO offerings (
                id, creator_id, name, description, price_type, price_amount, currency,
                billing_plan, price_ref, total_earnings, monthly_earnings,
                subscription_count, is_published, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(offering.id.0)
        .bind(offering.creator_id.0)
        .bind(&offering.name)
        .bind(&offering.description)
        .bind(offering.price.price_type.as_str())
        .bind(offering.price.amount)
        .bind(&offering.price.currency)
        .bind(offering.price.plan.as_str())
        .bind(&offering.price_ref)
        .bind(offering.revenue.total_earnings)
        .bind(offering.revenue.monthly_earnings)
        .bind(offering.revenue.subscription_count)
        .bind(offering.is_published)
        .bind(offering.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_offering(&self, id: OfferingId) -> StoreResult<Option<Offering>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM offerings WHERE id = $1",
            OFFERING_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(offering_from_row).transpose()
    }

    async fn set_price_ref_if_absent(
        &self,
        id: OfferingId,
        price_ref: &str,
    ) -> StoreResult<String> {
        let stored: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            UPDATE offerings
            SET price_ref = COALESCE(price_ref, $2)
            WHERE id = $1
            RETURNING price_ref
            "#,
        )
        .bind(id.0)
        .bind(price_ref)
        .fetch_optional(&self.pool)
        .await?;

        stored
            .and_then(|(p,)| p)
            .ok_or_else(|| StoreError::NotFound(format!("offering {}", id)))
    }

    async fn list_offerings_by_creator(&self, creator: PrincipalId) -> StoreResult<Vec<Offering>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM offerings WHERE creator_id = $1 ORDER BY created_at",
            OFFERING_COLUMNS
        ))
        .bind(creator.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(offering_from_row).collect()
    }

    async fn upsert_offering_subscription(
        &self,
        subscription: &OfferingSubscription,
    ) -> StoreResult<OfferingSubscription> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO offering_subscriptions (
                id, principal_id, offering_id, provider_subscription_id, status, plan,
                amount, currency, renewal_count, next_billing_date, canceled_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (principal_id, offering_id) DO UPDATE SET
                provider_subscription_id = EXCLUDED.provider_subscription_id,
                status = EXCLUDED.status,
                plan = EXCLUDED.plan,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                next_billing_date = EXCLUDED.next_billing_date,
                canceled_at = EXCLUDED.canceled_at,
                updated_at = EXCLUDED.updated_at
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(subscription.id)
        .bind(subscription.principal_id.0)
        .bind(subscription.offering_id.0)
        .bind(&subscription.provider_subscription_id)
        .bind(subscription.status.as_str())
        .bind(subscription.plan.as_str())
        .bind(subscription.amount)
        .bind(&subscription.currency)
        .bind(subscription.renewal_count)
        .bind(subscription.next_billing_date)
        .bind(subscription.canceled_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .fetch_one(&self.pool)
        .await?;
        subscription_from_row(&row)
    }

    async fn set_offering_subscription_status(
        &self,
        provider_subscription_id: &str,
        status: OfferingSubscriptionStatus,
        at: OffsetDateTime,
    ) -> StoreResult<Option<OfferingSubscription>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE offering_subscriptions
            SET status = $2,
                updated_at = $3,
                canceled_at = CASE WHEN $2 = 'canceled' THEN $3 ELSE canceled_at END
            WHERE provider_subscription_id = $1
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        ))
        .bind(provider_subscription_id)
        .bind(status.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn get_offering_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<OfferingSubscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM offering_subscriptions WHERE provider_subscription_id = $1",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn list_offering_subscriptions(
        &self,
        principal: PrincipalId,
    ) -> StoreResult<Vec<OfferingSubscription>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM offering_subscriptions WHERE principal_id = $1 ORDER BY created_at",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(principal.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn refresh_subscription_count(&self, offering: OfferingId) -> StoreResult<i64> {
        let count: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE offerings
            SET subscription_count = (
                SELECT COUNT(*) FROM offering_subscriptions
                WHERE offering_id = $1 AND status IN ('active', 'trialing')
            )
            WHERE id = $1
            RETURNING subscription_count
            "#,
        )
        .bind(offering.0)
        .fetch_optional(&self.pool)
        .await?;

        count
            .map(|(c,)| c)
            .ok_or_else(|| StoreError::NotFound(format!("offering {}", offering)))
    }

    async fn credit_payment(&self, credit: &PaymentCredit) -> StoreResult<bool> {
        let entry = &credit.entry;
        let mut tx = self.pool.begin().await?;

        // The unique event id is the guard: a duplicate inserts nothing
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO ledger_entries (
                id, entry_type, amount, platform_fee, currency, principal_id,
                offering_id, provider_event_id, description, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (provider_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(entry.id)
        .bind(entry.entry_type.as_str())
        .bind(entry.amount)
        .bind(entry.platform_fee)
        .bind(&entry.currency)
        .bind(entry.principal_id.0)
        .bind(entry.offering_id.map(|o| o.0))
        .bind(&entry.provider_event_id)
        .bind(&entry.description)
        .bind(entry.created_at)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(offering_id) = entry.offering_id {
            let updated = sqlx::query(
                r#"
                UPDATE offerings
                SET total_earnings = total_earnings + $2,
                    monthly_earnings = monthly_earnings + $2
                WHERE id = $1
                "#,
            )
            .bind(offering_id.0)
            .bind(entry.creator_share())
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(StoreError::NotFound(format!("offering {}", offering_id)));
            }
        }

        if let Some(renewal) = &credit.renewal {
            sqlx::query(
                r#"
                UPDATE offering_subscriptions
                SET renewal_count = renewal_count + CASE WHEN $4 THEN 1 ELSE 0 END,
                    next_billing_date = COALESCE($2, next_billing_date),
                    updated_at = $3
                WHERE provider_subscription_id = $1
                "#,
            )
            .bind(&renewal.provider_subscription_id)
            .bind(renewal.next_billing_date)
            .bind(entry.created_at)
            .bind(renewal.is_renewal)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn append_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id, entry_type, amount, platform_fee, currency, principal_id,
                offering_id, provider_event_id, description, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (provider_event_id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.entry_type.as_str())
        .bind(entry.amount)
        .bind(entry.platform_fee)
        .bind(&entry.currency)
        .bind(entry.principal_id.0)
        .bind(entry.offering_id.map(|o| o.0))
        .bind(&entry.provider_event_id)
        .bind(&entry.description)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ledger_entry_for_event(
        &self,
        provider_event_id: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE provider_event_id = $1",
            LEDGER_COLUMNS
        ))
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ledger_from_row).transpose()
    }

    async fn list_ledger_entries(&self, principal: PrincipalId) -> StoreResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ledger_entries WHERE principal_id = $1 ORDER BY created_at DESC",
            LEDGER_COLUMNS
        ))
        .bind(principal.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_from_row).collect()
    }

    async fn recompute_monthly_earnings(&self, month_start: OffsetDateTime) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE offerings o
            SET monthly_earnings = COALESCE(t.share, 0)
            FROM offerings src
            LEFT JOIN (
                SELECT offering_id, SUM(amount - platform_fee)::BIGINT AS share
                FROM ledger_entries
                WHERE created_at >= $1 AND offering_id IS NOT NULL
                GROUP BY offering_id
            ) t ON t.offering_id = src.id
            WHERE o.id = src.id
              AND o.monthly_earnings IS DISTINCT FROM COALESCE(t.share, 0)
            "#,
        )
        .bind(month_start)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn claim_webhook_event(
        &self,
        provider_event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
        stale_after: Duration,
    ) -> StoreResult<ClaimOutcome> {
        // Only a failed or stuck claim can be taken over
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (provider_event_id, event_type, status, started_at)
            VALUES ($1, $2, 'processing', $3)
            ON CONFLICT (provider_event_id) DO UPDATE SET
                status = 'processing',
                started_at = EXCLUDED.started_at,
                error_message = NULL
            WHERE webhook_events.status = 'failed'
               OR (webhook_events.status = 'processing' AND webhook_events.started_at < $4)
            RETURNING provider_event_id
            "#,
        )
        .bind(provider_event_id)
        .bind(event_type)
        .bind(now)
        .bind(now - stale_after)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM webhook_events WHERE provider_event_id = $1")
                .bind(provider_event_id)
                .fetch_optional(&self.pool)
                .await?;

        match status {
            Some((s,)) if s == WebhookEventStatus::Processed.as_str() => {
                Ok(ClaimOutcome::AlreadyProcessed)
            }
            _ => Ok(ClaimOutcome::InFlight),
        }
    }

    async fn complete_webhook_event(&self, provider_event_id: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'processed', completed_at = NOW(), error_message = NULL
            WHERE provider_event_id = $1
            "#,
        )
        .bind(provider_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_webhook_event(
        &self,
        provider_event_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed', error_message = $2
            WHERE provider_event_id = $1
            "#,
        )
        .bind(provider_event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_webhook_event(
        &self,
        provider_event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        let row = sqlx::query(
            r#"
            SELECT provider_event_id, event_type, status, started_at, error_message
            FROM webhook_events
            WHERE provider_event_id = $1
            "#,
        )
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(webhook_event_from_row).transpose()
    }

    async fn recover_stale_webhook_claims(&self, cutoff: OffsetDateTime) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET status = 'failed',
                error_message = CONCAT('Claim expired at ', NOW()::TEXT)
            WHERE status = 'processing' AND started_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
