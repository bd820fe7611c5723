//! Common types used across Agora
//!
//! Every persisted entity is an explicit record. Optional fields are `Option`s,
//! enum-valued fields round-trip through `as_str`/`FromStr` so they can live in
//! TEXT columns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::StoreError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Principal (user) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(pub Uuid);

impl PrincipalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PrincipalId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for PrincipalId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PrincipalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Monetized offering (agent) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfferingId(pub Uuid);

impl OfferingId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OfferingId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OfferingId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for OfferingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for OfferingId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as TEXT.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::Corrupt(format!(
                        "unknown {} value '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// =============================================================================
// Enums
// =============================================================================

/// Service tier governing rate limits and quota enforcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

text_enum!(SubscriptionTier {
    Free => "free",
    Pro => "pro",
    Enterprise => "enterprise",
});

impl SubscriptionTier {
    pub fn is_paid(&self) -> bool {
        !matches!(self, SubscriptionTier::Free)
    }
}

/// Status of a principal's platform subscription
///
/// `Canceling` is local-only: the provider still reports `active` with
/// `cancel_at_period_end` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    Inactive,
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Canceling,
    Canceled,
    Unpaid,
}

text_enum!(SubscriptionStatus {
    Inactive => "inactive",
    Incomplete => "incomplete",
    Trialing => "trialing",
    Active => "active",
    PastDue => "past_due",
    Canceling => "canceling",
    Canceled => "canceled",
    Unpaid => "unpaid",
});

impl SubscriptionStatus {
    /// Map a provider-reported status onto the local state machine.
    pub fn from_provider(status: &str, cancel_at_period_end: bool) -> Self {
        match status {
            "active" if cancel_at_period_end => SubscriptionStatus::Canceling,
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "unpaid" | "paused" => SubscriptionStatus::Unpaid,
            "incomplete" | "incomplete_expired" => SubscriptionStatus::Incomplete,
            _ => SubscriptionStatus::Inactive,
        }
    }

    /// Local transition for a user cancel (`true`) or resume (`false`)
    /// request. Only `active` and `canceling` move; every other status
    /// changes through provider events.
    pub fn after_cancel_request(self, cancel: bool) -> Self {
        match (self, cancel) {
            (SubscriptionStatus::Active, true) => SubscriptionStatus::Canceling,
            (SubscriptionStatus::Canceling, false) => SubscriptionStatus::Active,
            (status, _) => status,
        }
    }

    /// Whether the provider still considers the subscription paid-up.
    pub fn grants_paid_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Canceling
        )
    }
}

/// Status of a principal's subscription to a single offering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferingSubscriptionStatus {
    Trialing,
    #[default]
    Active,
    PastDue,
    Canceled,
    Unpaid,
}

text_enum!(OfferingSubscriptionStatus {
    Trialing => "trialing",
    Active => "active",
    PastDue => "past_due",
    Canceled => "canceled",
    Unpaid => "unpaid",
});

impl OfferingSubscriptionStatus {
    /// Map a provider-reported status. Statuses with no local counterpart
    /// (`incomplete`, `paused`) count as unpaid.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "trialing" => OfferingSubscriptionStatus::Trialing,
            "active" => OfferingSubscriptionStatus::Active,
            "past_due" => OfferingSubscriptionStatus::PastDue,
            "canceled" | "incomplete_expired" => OfferingSubscriptionStatus::Canceled,
            _ => OfferingSubscriptionStatus::Unpaid,
        }
    }

    /// Counted towards an offering's `subscription_count`
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            OfferingSubscriptionStatus::Trialing | OfferingSubscriptionStatus::Active
        )
    }
}

/// How an offering is monetized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceType {
    #[default]
    Free,
    Premium,
    Subscription,
}

text_enum!(PriceType {
    Free => "free",
    Premium => "premium",
    Subscription => "subscription",
});

/// Recurring plan of a subscription-priced offering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPlan {
    #[default]
    Monthly,
    Yearly,
}

text_enum!(BillingPlan {
    Monthly => "monthly",
    Yearly => "yearly",
});

impl BillingPlan {
    /// Provider recurring interval name
    pub fn interval(&self) -> &'static str {
        match self {
            BillingPlan::Monthly => "month",
            BillingPlan::Yearly => "year",
        }
    }

    pub fn from_interval(interval: &str) -> Self {
        match interval {
            "year" => BillingPlan::Yearly,
            _ => BillingPlan::Monthly,
        }
    }
}

/// Kind of money-relevant event recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    ApiCall,
    Subscription,
    Payment,
    Payout,
}

text_enum!(LedgerEntryType {
    ApiCall => "api_call",
    Subscription => "subscription",
    Payment => "payment",
    Payout => "payout",
});

// =============================================================================
// Records
// =============================================================================

/// Subscription sub-record of a principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalSubscription {
    pub tier: SubscriptionTier,
    pub usage_count: i64,
    pub usage_limit: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_usage_reset: OffsetDateTime,
    pub provider_subscription_id: Option<String>,
    pub provider_price_id: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// A platform user: consumer, creator, or both
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub email: String,
    pub name: Option<String>,
    pub subscription: PrincipalSubscription,
    /// Payment-provider customer identity
    pub customer_id: Option<String>,
    /// Creator payout identity
    pub payout_account_id: Option<String>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Principal {
    /// A freshly signed-up principal on the free tier.
    pub fn new(email: impl Into<String>, name: Option<String>, usage_limit: i64) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: PrincipalId::new(),
            email: email.into(),
            name,
            subscription: PrincipalSubscription {
                tier: SubscriptionTier::Free,
                usage_count: 0,
                usage_limit,
                last_usage_reset: now,
                provider_subscription_id: None,
                provider_price_id: None,
                status: SubscriptionStatus::Inactive,
                current_period_end: None,
                cancel_at_period_end: false,
            },
            customer_id: None,
            payout_account_id: None,
            is_active: true,
            created_at: now,
        }
    }
}

/// Price of an offering in minor currency units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferingPrice {
    #[serde(rename = "type")]
    pub price_type: PriceType,
    pub amount: i64,
    pub currency: String,
    pub plan: BillingPlan,
}

impl OfferingPrice {
    pub fn free() -> Self {
        Self {
            price_type: PriceType::Free,
            amount: 0,
            currency: "usd".to_string(),
            plan: BillingPlan::Monthly,
        }
    }
}

/// Revenue counters of an offering, credited from confirmed payments only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Revenue {
    pub total_earnings: i64,
    pub monthly_earnings: i64,
    pub subscription_count: i64,
}

/// A creator-authored agent that may be sold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    pub id: OfferingId,
    pub creator_id: PrincipalId,
    pub name: String,
    pub description: Option<String>,
    pub price: OfferingPrice,
    /// Provider price identity, created lazily on first monetization
    pub price_ref: Option<String>,
    pub revenue: Revenue,
    pub is_published: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Offering {
    pub fn new(creator_id: PrincipalId, name: impl Into<String>, price: OfferingPrice) -> Self {
        Self {
            id: OfferingId::new(),
            creator_id,
            name: name.into(),
            description: None,
            price,
            price_ref: None,
            revenue: Revenue::default(),
            is_published: true,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Link between a principal and a subscription-priced offering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferingSubscription {
    pub id: Uuid,
    pub principal_id: PrincipalId,
    pub offering_id: OfferingId,
    pub provider_subscription_id: String,
    pub status: OfferingSubscriptionStatus,
    pub plan: BillingPlan,
    pub amount: i64,
    pub currency: String,
    pub renewal_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_billing_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Immutable record of a money-relevant event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub entry_type: LedgerEntryType,
    /// Gross amount in minor units (negative for outflows)
    pub amount: i64,
    /// Platform share of `amount`; the creator received the remainder
    pub platform_fee: i64,
    pub currency: String,
    pub principal_id: PrincipalId,
    pub offering_id: Option<OfferingId>,
    /// Idempotence key: at most one entry per provider event
    pub provider_event_id: Option<String>,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl LedgerEntry {
    /// Creator's net share of this entry
    pub fn creator_share(&self) -> i64 {
        self.amount - self.platform_fee
    }
}

/// Processing state of an inbound provider event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Processing,
    Processed,
    Failed,
}

text_enum!(WebhookEventStatus {
    Processing => "processing",
    Processed => "processed",
    Failed => "failed",
});

/// Durable claim record for an inbound provider event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub provider_event_id: String,
    pub event_type: String,
    pub status: WebhookEventStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_round_trips_through_text() {
        for tier in [
            SubscriptionTier::Free,
            SubscriptionTier::Pro,
            SubscriptionTier::Enterprise,
        ] {
            assert_eq!(tier.as_str().parse::<SubscriptionTier>().ok(), Some(tier));
        }
        assert!("platinum".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_provider_status_mapping() {
        assert_eq!(
            SubscriptionStatus::from_provider("active", false),
            SubscriptionStatus::Active
        );
        assert_eq!(
            SubscriptionStatus::from_provider("active", true),
            SubscriptionStatus::Canceling
        );
        assert_eq!(
            SubscriptionStatus::from_provider("past_due", false),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            SubscriptionStatus::from_provider("something_new", false),
            SubscriptionStatus::Inactive
        );
        assert_eq!(
            OfferingSubscriptionStatus::from_provider("incomplete"),
            OfferingSubscriptionStatus::Unpaid
        );
    }

    #[test]
    fn test_cancel_request_only_moves_active_and_canceling() {
        use SubscriptionStatus::*;
        assert_eq!(Active.after_cancel_request(true), Canceling);
        assert_eq!(Canceling.after_cancel_request(false), Active);
        assert_eq!(Canceling.after_cancel_request(true), Canceling);
        for status in [PastDue, Unpaid, Incomplete, Canceled, Inactive] {
            assert_eq!(status.after_cancel_request(true), status);
            assert_eq!(status.after_cancel_request(false), status);
        }
    }

    #[test]
    fn test_new_principal_starts_on_free_tier() {
        let principal = Principal::new("a@example.com", None, 10);
        assert_eq!(principal.subscription.tier, SubscriptionTier::Free);
        assert_eq!(principal.subscription.status, SubscriptionStatus::Inactive);
        assert_eq!(principal.subscription.usage_count, 0);
        assert_eq!(principal.subscription.usage_limit, 10);
        assert!(principal.customer_id.is_none());
    }

    #[test]
    fn test_offering_price_serializes_type_field() {
        let price = OfferingPrice {
            price_type: PriceType::Premium,
            amount: 999,
            currency: "usd".to_string(),
            plan: BillingPlan::Monthly,
        };
        let json = serde_json::to_value(&price).unwrap();
        assert_eq!(json["type"], "premium");
        assert_eq!(json["amount"], 999);
    }

    #[test]
    fn test_ledger_creator_share() {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            entry_type: LedgerEntryType::Payment,
            amount: 999,
            platform_fee: 300,
            currency: "usd".to_string(),
            principal_id: PrincipalId::new(),
            offering_id: Some(OfferingId::new()),
            provider_event_id: Some("evt_1".to_string()),
            description: "purchase".to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        assert_eq!(entry.creator_share(), 699);
    }
}
