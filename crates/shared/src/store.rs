//! Abstract billing store
//!
//! Everything that must be atomic under concurrent request handlers is a
//! single method here: the usage counter update, the conditional identity
//! writes, the ledger credit and the webhook claim. Backends must implement
//! each one as one conditional update (or one transaction).

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

use crate::error::StoreResult;
use crate::types::{
    LedgerEntry, Offering, OfferingId, OfferingSubscription, OfferingSubscriptionStatus, Principal,
    PrincipalId, SubscriptionStatus, SubscriptionTier, WebhookEventRecord,
};

/// Length of a free-tier quota window
pub const USAGE_WINDOW: Duration = Duration::days(30);

/// Parameters of one usage-recording call
#[derive(Debug, Clone, Copy)]
pub struct UsageCheck {
    /// Enforce `usage_count < usage_limit` (free tier only)
    pub enforce_quota: bool,
    pub now: OffsetDateTime,
    /// Minimum age of `last_usage_reset` before an exhausted quota resets
    pub window: Duration,
}

impl UsageCheck {
    pub fn new(enforce_quota: bool, now: OffsetDateTime) -> Self {
        Self {
            enforce_quota,
            now,
            window: USAGE_WINDOW,
        }
    }
}

/// Result of one usage-recording call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageOutcome {
    /// The call was admitted. `usage` is the counter after this call.
    Admitted {
        usage: i64,
        limit: i64,
        reset: bool,
    },
    /// The quota is exhausted. `usage` is the counter before this call;
    /// the call is still counted.
    Exceeded {
        usage: i64,
        limit: i64,
        last_reset: OffsetDateTime,
    },
}

/// Absolute subscription state taken from a provider payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrincipalSubscriptionSync {
    /// `None` keeps the stored tier
    pub tier: Option<SubscriptionTier>,
    pub provider_subscription_id: String,
    pub provider_price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// Renewal bookkeeping applied together with a recurring payment credit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewalUpdate {
    pub provider_subscription_id: String,
    pub next_billing_date: Option<OffsetDateTime>,
    /// False for the invoice that opened the subscription
    pub is_renewal: bool,
}

/// A confirmed payment to credit: one ledger entry plus the creator's
/// revenue increment, applied atomically and at most once per event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentCredit {
    pub entry: LedgerEntry,
    pub renewal: Option<RenewalUpdate>,
}

/// Result of claiming an inbound provider event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller owns processing of the event
    Claimed,
    /// The event was processed before
    AlreadyProcessed,
    /// Another worker holds a fresh claim
    InFlight,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Principals

    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()>;

    async fn get_principal(&self, id: PrincipalId) -> StoreResult<Option<Principal>>;

    async fn set_principal_active(&self, id: PrincipalId, active: bool) -> StoreResult<bool>;

    /// Persist `customer_id` unless one is already set. Returns the stored id.
    async fn set_customer_id_if_absent(
        &self,
        id: PrincipalId,
        customer_id: &str,
    ) -> StoreResult<String>;

    /// Persist `payout_account_id` unless one is already set. Returns the stored id.
    async fn set_payout_account_if_absent(
        &self,
        id: PrincipalId,
        account_id: &str,
    ) -> StoreResult<String>;

    // Usage

    /// Count one call and apply the quota check and reset as a single
    /// atomic conditional update.
    async fn record_usage(&self, id: PrincipalId, check: &UsageCheck)
        -> StoreResult<UsageOutcome>;

    // Platform subscription

    async fn sync_principal_subscription(
        &self,
        id: PrincipalId,
        sync: &PrincipalSubscriptionSync,
    ) -> StoreResult<bool>;

    async fn set_principal_subscription_status(
        &self,
        id: PrincipalId,
        status: SubscriptionStatus,
        cancel_at_period_end: bool,
    ) -> StoreResult<bool>;

    /// Set the cancel-at-period-end flag, moving `active` to `canceling` on
    /// cancel and `canceling` back to `active` on resume. Any other status
    /// is left for the provider's webhooks. Returns the resulting status,
    /// or None for an unknown principal.
    async fn set_principal_cancel_at_period_end(
        &self,
        id: PrincipalId,
        cancel: bool,
    ) -> StoreResult<Option<SubscriptionStatus>>;

    /// Drop provider ids, mark canceled and fall back to the free tier.
    async fn clear_principal_subscription(&self, id: PrincipalId) -> StoreResult<bool>;

    async fn find_principal_by_provider_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<Principal>>;

    // Offerings

    async fn insert_offering(&self, offering: &Offering) -> StoreResult<()>;

    async fn get_offering(&self, id: OfferingId) -> StoreResult<Option<Offering>>;

    /// Persist `price_ref` unless one is already set. Returns the stored ref.
    async fn set_price_ref_if_absent(&self, id: OfferingId, price_ref: &str)
        -> StoreResult<String>;

    async fn list_offerings_by_creator(&self, creator: PrincipalId) -> StoreResult<Vec<Offering>>;

    // Offering subscriptions

    /// Insert or overwrite the single record for (principal, offering).
    /// `id`, `created_at` and `renewal_count` of an existing record are kept.
    async fn upsert_offering_subscription(
        &self,
        subscription: &OfferingSubscription,
    ) -> StoreResult<OfferingSubscription>;

    async fn set_offering_subscription_status(
        &self,
        provider_subscription_id: &str,
        status: OfferingSubscriptionStatus,
        at: OffsetDateTime,
    ) -> StoreResult<Option<OfferingSubscription>>;

    async fn get_offering_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<OfferingSubscription>>;

    async fn list_offering_subscriptions(
        &self,
        principal: PrincipalId,
    ) -> StoreResult<Vec<OfferingSubscription>>;

    /// Recompute `revenue.subscription_count` from live subscriptions.
    async fn refresh_subscription_count(&self, offering: OfferingId) -> StoreResult<i64>;

    // Ledger

    /// Append the entry and credit the offering's revenue with the creator
    /// share, in one transaction. Returns false when the event id was
    /// already credited; nothing is written then.
    async fn credit_payment(&self, credit: &PaymentCredit) -> StoreResult<bool>;

    /// Append an entry with no revenue side effect. Returns false on a
    /// duplicate provider event id.
    async fn append_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<bool>;

    async fn ledger_entry_for_event(&self, provider_event_id: &str)
        -> StoreResult<Option<LedgerEntry>>;

    async fn list_ledger_entries(&self, principal: PrincipalId) -> StoreResult<Vec<LedgerEntry>>;

    /// Set every offering's `monthly_earnings` to the creator share credited
    /// since `month_start`. Returns the number of offerings updated.
    async fn recompute_monthly_earnings(&self, month_start: OffsetDateTime) -> StoreResult<u64>;

    // Webhook claims

    async fn claim_webhook_event(
        &self,
        provider_event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
        stale_after: Duration,
    ) -> StoreResult<ClaimOutcome>;

    async fn complete_webhook_event(&self, provider_event_id: &str) -> StoreResult<()>;

    /// Mark a claim failed so a redelivery can reclaim it.
    async fn release_webhook_event(&self, provider_event_id: &str, error: &str)
        -> StoreResult<()>;

    async fn get_webhook_event(
        &self,
        provider_event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>>;

    /// Fail every claim that has been processing since before `cutoff`.
    async fn recover_stale_webhook_claims(&self, cutoff: OffsetDateTime) -> StoreResult<u64>;
}

/// Decide a usage call against the current counter. Shared by the
/// backends so both apply the same rule.
pub fn evaluate_usage(
    usage_count: i64,
    usage_limit: i64,
    last_reset: OffsetDateTime,
    check: &UsageCheck,
) -> UsageOutcome {
    if !check.enforce_quota || usage_count < usage_limit {
        return UsageOutcome::Admitted {
            usage: usage_count + 1,
            limit: usage_limit,
            reset: false,
        };
    }

    // Whole days only: 29.9 days is still inside the window
    let elapsed_days = (check.now - last_reset).whole_days();
    if elapsed_days >= check.window.whole_days() {
        UsageOutcome::Admitted {
            usage: 1,
            limit: usage_limit,
            reset: true,
        }
    } else {
        UsageOutcome::Exceeded {
            usage: usage_count,
            limit: usage_limit,
            last_reset,
        }
    }
}
