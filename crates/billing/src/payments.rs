//! Payment orchestration
//!
//! Requests money movement from the provider. Nothing here touches revenue
//! or the ledger: a charge only counts once its confirmation arrives through
//! the webhook path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use agora_shared::{
    BillingStore, LedgerEntry, LedgerEntryType, Offering, OfferingId, OfferingSubscription,
    PriceType, Principal, PrincipalId, SubscriptionStatus, SubscriptionTier,
};
use serde::Serialize;

use crate::client::PaymentSettings;
use crate::error::{BillingError, BillingResult};
use crate::ledger::FeeSplit;
use crate::lifecycle::Lifecycle;
use crate::provider::{
    CheckoutRequest, DestinationCharge, DestinationSubscription, HostedSession, NewCustomer,
    NewPayoutAccount, NewPrice, PaymentProvider, ProviderError, ProviderResult,
};

/// Metadata keys attached to provider objects and read back by webhooks
pub mod metadata_keys {
    pub const PRINCIPAL_ID: &str = "principal_id";
    pub const OFFERING_ID: &str = "offering_id";
    pub const CREATOR_ID: &str = "creator_id";
    pub const TIER: &str = "tier";
    pub const PAYMENT_TYPE: &str = "payment_type";
}

const MISSING_PAYOUT_SETUP: &str = "creator has not completed payout setup";

/// Payout onboarding result
#[derive(Debug, Clone, Serialize)]
pub struct PayoutOnboarding {
    pub account_id: String,
    pub onboarding_url: String,
}

/// Client-side handle of a one-time charge
#[derive(Debug, Clone, Serialize)]
pub struct OneTimeCharge {
    pub payment_intent_id: String,
    pub client_secret: Option<String>,
    pub amount: i64,
    pub platform_fee: i64,
    pub currency: String,
}

/// Client-side handle of a recurring charge
#[derive(Debug, Clone, Serialize)]
pub struct RecurringCharge {
    pub subscription_id: String,
    pub status: String,
    pub client_secret: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub application_fee_percent: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfferingEarnings {
    pub offering_id: OfferingId,
    pub name: String,
    pub total_earnings: i64,
    pub monthly_earnings: i64,
    pub subscription_count: i64,
}

/// Creator earnings summed over their offerings
#[derive(Debug, Clone, Serialize)]
pub struct EarningsSummary {
    pub payout_account_connected: bool,
    pub total_earnings: i64,
    pub monthly_earnings: i64,
    pub subscription_count: i64,
    pub offerings: Vec<OfferingEarnings>,
}

/// What a principal has bought
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseHistory {
    pub payments: Vec<LedgerEntry>,
    pub subscriptions: Vec<OfferingSubscription>,
}

pub struct PaymentOrchestrator {
    store: Arc<dyn BillingStore>,
    provider: Option<Arc<dyn PaymentProvider>>,
    settings: PaymentSettings,
    lifecycle: Lifecycle,
}

impl PaymentOrchestrator {
    pub(crate) fn new(
        store: Arc<dyn BillingStore>,
        provider: Option<Arc<dyn PaymentProvider>>,
        settings: PaymentSettings,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
            lifecycle,
        }
    }

    pub fn settings(&self) -> &PaymentSettings {
        &self.settings
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }

    fn provider(&self) -> BillingResult<&dyn PaymentProvider> {
        self.lifecycle.ensure_open()?;
        self.provider
            .as_deref()
            .ok_or_else(|| BillingError::Config("payment provider not configured".to_string()))
    }

    /// Run one provider call under the configured timeout
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> ProviderResult<T>
    where
        F: Future<Output = ProviderResult<T>>,
    {
        match tokio::time::timeout(self.settings.provider_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    operation = operation,
                    timeout_secs = self.settings.provider_timeout.as_secs(),
                    "Payment provider call timed out"
                );
                Err(ProviderError::Timeout)
            }
        }
    }

    async fn load_principal(&self, id: PrincipalId) -> BillingResult<Principal> {
        self.store
            .get_principal(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("principal {}", id)))
    }

    async fn load_offering(&self, id: OfferingId) -> BillingResult<Offering> {
        self.store
            .get_offering(id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("offering {}", id)))
    }

    /// Payout account of the offering's creator, required before any split charge
    async fn creator_destination(&self, offering: &Offering) -> BillingResult<String> {
        let creator = self.load_principal(offering.creator_id).await?;
        creator.payout_account_id.ok_or_else(|| {
            tracing::warn!(
                offering_id = %offering.id,
                creator_id = %offering.creator_id,
                "Charge refused: creator has no payout account"
            );
            BillingError::PayoutAccount(MISSING_PAYOUT_SETUP.to_string())
        })
    }

    /// Return the principal's provider customer id, creating it on first use.
    /// Concurrent callers converge on whichever id was persisted first.
    pub async fn ensure_customer(&self, principal_id: PrincipalId) -> BillingResult<String> {
        let principal = self.load_principal(principal_id).await?;
        if let Some(customer_id) = principal.customer_id {
            return Ok(customer_id);
        }

        let provider = self.provider()?;
        let request = NewCustomer {
            principal_id,
            email: principal.email.clone(),
            name: principal.name.clone(),
        };
        let created = self
            .call("create_customer", provider.create_customer(&request))
            .await?;

        let stored = self
            .store
            .set_customer_id_if_absent(principal_id, &created)
            .await?;
        if stored != created {
            tracing::warn!(
                principal_id = %principal_id,
                orphaned_customer = %created,
                customer_id = %stored,
                "Concurrent customer creation, adopting existing customer"
            );
        } else {
            tracing::info!(principal_id = %principal_id, customer_id = %stored, "Created customer");
        }
        Ok(stored)
    }

    /// Create the creator's payout account if needed and return an onboarding link
    pub async fn ensure_payout_account(
        &self,
        creator_id: PrincipalId,
        return_url: &str,
        refresh_url: &str,
    ) -> BillingResult<PayoutOnboarding> {
        let creator = self.load_principal(creator_id).await?;
        let provider = self.provider()?;

        let account_id = match creator.payout_account_id {
            Some(id) => id,
            None => {
                let request = NewPayoutAccount {
                    principal_id: creator_id,
                    email: creator.email.clone(),
                };
                let created = self
                    .call(
                        "create_payout_account",
                        provider.create_payout_account(&request),
                    )
                    .await
                    .map_err(|e| match e {
                        ProviderError::Rejected(msg) => BillingError::PayoutAccount(msg),
                        other => other.into(),
                    })?;

                let stored = self
                    .store
                    .set_payout_account_if_absent(creator_id, &created)
                    .await?;
                tracing::info!(
                    creator_id = %creator_id,
                    account_id = %stored,
                    "Payout account created"
                );
                stored
            }
        };

        let onboarding_url = self
            .call(
                "create_onboarding_link",
                provider.create_onboarding_link(&account_id, return_url, refresh_url),
            )
            .await
            .map_err(|e| match e {
                ProviderError::Rejected(msg) => BillingError::PayoutAccount(msg),
                other => other.into(),
            })?;

        Ok(PayoutOnboarding {
            account_id,
            onboarding_url,
        })
    }

    /// Return the offering's provider price, creating it on first monetization
    pub async fn ensure_price_ref(&self, offering_id: OfferingId) -> BillingResult<String> {
        let offering = self.load_offering(offering_id).await?;
        if let Some(price_ref) = offering.price_ref {
            return Ok(price_ref);
        }
        if offering.price.price_type == PriceType::Free {
            return Err(BillingError::Validation(
                "free offerings have no price".to_string(),
            ));
        }

        let provider = self.provider()?;
        let request = NewPrice {
            offering_id,
            name: offering.name.clone(),
            amount: offering.price.amount,
            currency: offering.price.currency.clone(),
            interval: (offering.price.price_type == PriceType::Subscription)
                .then_some(offering.price.plan),
        };
        let created = self
            .call("create_price", provider.create_price(&request))
            .await?;

        let stored = self
            .store
            .set_price_ref_if_absent(offering_id, &created)
            .await?;
        tracing::info!(offering_id = %offering_id, price_ref = %stored, "Price reference cached");
        Ok(stored)
    }

    fn charge_metadata(
        &self,
        principal_id: PrincipalId,
        offering: &Offering,
    ) -> HashMap<String, String> {
        HashMap::from([
            (
                metadata_keys::PRINCIPAL_ID.to_string(),
                principal_id.to_string(),
            ),
            (
                metadata_keys::OFFERING_ID.to_string(),
                offering.id.to_string(),
            ),
            (
                metadata_keys::CREATOR_ID.to_string(),
                offering.creator_id.to_string(),
            ),
            (
                metadata_keys::PAYMENT_TYPE.to_string(),
                offering.price.price_type.to_string(),
            ),
        ])
    }

    /// Start a one-time purchase of a premium offering
    pub async fn create_one_time_charge(
        &self,
        principal_id: PrincipalId,
        offering_id: OfferingId,
    ) -> BillingResult<OneTimeCharge> {
        let offering = self.load_offering(offering_id).await?;
        if offering.price.price_type != PriceType::Premium {
            return Err(BillingError::Validation(format!(
                "offering is priced as '{}', not a one-time purchase",
                offering.price.price_type
            )));
        }
        if offering.price.amount <= 0 {
            return Err(BillingError::Validation(
                "offering has no chargeable amount".to_string(),
            ));
        }
        let destination = self.creator_destination(&offering).await?;
        let provider = self.provider()?;

        let customer_id = self.ensure_customer(principal_id).await?;
        let split = FeeSplit::compute(offering.price.amount, self.settings.platform_fee_percent);

        let request = DestinationCharge {
            customer_id,
            amount: offering.price.amount,
            currency: offering.price.currency.clone(),
            application_fee_amount: split.platform_fee,
            destination,
            metadata: self.charge_metadata(principal_id, &offering),
        };
        let handle = self
            .call(
                "create_destination_charge",
                provider.create_destination_charge(&request),
            )
            .await?;

        tracing::info!(
            principal_id = %principal_id,
            offering_id = %offering_id,
            payment_intent_id = %handle.id,
            amount = offering.price.amount,
            platform_fee = split.platform_fee,
            "One-time charge created"
        );

        Ok(OneTimeCharge {
            payment_intent_id: handle.id,
            client_secret: handle.client_secret,
            amount: offering.price.amount,
            platform_fee: split.platform_fee,
            currency: offering.price.currency,
        })
    }

    /// Start a recurring subscription to a subscription-priced offering
    pub async fn create_recurring_charge(
        &self,
        principal_id: PrincipalId,
        offering_id: OfferingId,
    ) -> BillingResult<RecurringCharge> {
        let offering = self.load_offering(offering_id).await?;
        if offering.price.price_type != PriceType::Subscription {
            return Err(BillingError::Validation(format!(
                "offering is priced as '{}', not a subscription",
                offering.price.price_type
            )));
        }
        let destination = self.creator_destination(&offering).await?;
        let provider = self.provider()?;

        let customer_id = self.ensure_customer(principal_id).await?;
        let price_ref = self.ensure_price_ref(offering_id).await?;

        let request = DestinationSubscription {
            customer_id,
            price_ref,
            application_fee_percent: self.settings.platform_fee_percent,
            destination,
            metadata: self.charge_metadata(principal_id, &offering),
        };
        let handle = self
            .call(
                "create_destination_subscription",
                provider.create_destination_subscription(&request),
            )
            .await?;

        tracing::info!(
            principal_id = %principal_id,
            offering_id = %offering_id,
            subscription_id = %handle.id,
            "Recurring charge created"
        );

        Ok(RecurringCharge {
            subscription_id: handle.id,
            status: handle.status,
            client_secret: handle.client_secret,
            amount: offering.price.amount,
            currency: offering.price.currency,
            application_fee_percent: self.settings.platform_fee_percent,
        })
    }

    async fn set_cancel_at_period_end(
        &self,
        principal_id: PrincipalId,
        cancel: bool,
    ) -> BillingResult<SubscriptionStatus> {
        let principal = self.load_principal(principal_id).await?;
        let subscription_id = principal
            .subscription
            .provider_subscription_id
            .ok_or_else(|| BillingError::NotFound("no active subscription".to_string()))?;
        let provider = self.provider()?;

        self.call(
            "set_cancel_at_period_end",
            provider.set_cancel_at_period_end(&subscription_id, cancel),
        )
        .await?;

        let status = self
            .store
            .set_principal_cancel_at_period_end(principal_id, cancel)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("principal {}", principal_id)))?;

        tracing::info!(
            principal_id = %principal_id,
            subscription_id = %subscription_id,
            status = %status,
            "Subscription cancel-at-period-end updated"
        );
        Ok(status)
    }

    /// Cancel the platform subscription at the end of the current period
    pub async fn cancel_subscription(
        &self,
        principal_id: PrincipalId,
    ) -> BillingResult<SubscriptionStatus> {
        self.set_cancel_at_period_end(principal_id, true).await
    }

    /// Undo a pending cancellation
    pub async fn resume_subscription(
        &self,
        principal_id: PrincipalId,
    ) -> BillingResult<SubscriptionStatus> {
        let principal = self.load_principal(principal_id).await?;
        if !principal.subscription.cancel_at_period_end {
            return Err(BillingError::Validation(
                "subscription is not scheduled for cancellation".to_string(),
            ));
        }
        self.set_cancel_at_period_end(principal_id, false).await
    }

    /// Hosted checkout for a paid platform tier
    pub async fn create_checkout_session(
        &self,
        principal_id: PrincipalId,
        tier: SubscriptionTier,
        success_url: &str,
        cancel_url: &str,
    ) -> BillingResult<HostedSession> {
        if tier == SubscriptionTier::Free {
            return Err(BillingError::Validation(
                "the free tier needs no checkout".to_string(),
            ));
        }
        let price_id = self
            .settings
            .price_ids
            .for_tier(tier)
            .ok_or_else(|| BillingError::Config(format!("no price configured for tier {}", tier)))?
            .to_string();
        let provider = self.provider()?;

        let customer_id = self.ensure_customer(principal_id).await?;
        let request = CheckoutRequest {
            customer_id,
            price_id,
            success_url: success_url.to_string(),
            cancel_url: cancel_url.to_string(),
            metadata: HashMap::from([
                (
                    metadata_keys::PRINCIPAL_ID.to_string(),
                    principal_id.to_string(),
                ),
                (metadata_keys::TIER.to_string(), tier.to_string()),
            ]),
        };
        let session = self
            .call(
                "create_checkout_session",
                provider.create_checkout_session(&request),
            )
            .await?;

        tracing::info!(
            principal_id = %principal_id,
            tier = %tier,
            session_id = %session.id,
            "Checkout session created"
        );
        Ok(session)
    }

    /// Provider-hosted billing portal
    pub async fn create_portal_session(
        &self,
        principal_id: PrincipalId,
        return_url: &str,
    ) -> BillingResult<HostedSession> {
        let principal = self.load_principal(principal_id).await?;
        let customer_id = principal
            .customer_id
            .ok_or_else(|| BillingError::NotFound("no billing account".to_string()))?;
        let provider = self.provider()?;

        let session = self
            .call(
                "create_portal_session",
                provider.create_portal_session(&customer_id, return_url),
            )
            .await?;
        Ok(session)
    }

    pub async fn creator_earnings(&self, creator_id: PrincipalId) -> BillingResult<EarningsSummary> {
        let creator = self.load_principal(creator_id).await?;
        let offerings = self.store.list_offerings_by_creator(creator_id).await?;

        let offerings: Vec<OfferingEarnings> = offerings
            .into_iter()
            .map(|o| OfferingEarnings {
                offering_id: o.id,
                name: o.name,
                total_earnings: o.revenue.total_earnings,
                monthly_earnings: o.revenue.monthly_earnings,
                subscription_count: o.revenue.subscription_count,
            })
            .collect();

        Ok(EarningsSummary {
            payout_account_connected: creator.payout_account_id.is_some(),
            total_earnings: offerings.iter().map(|o| o.total_earnings).sum(),
            monthly_earnings: offerings.iter().map(|o| o.monthly_earnings).sum(),
            subscription_count: offerings.iter().map(|o| o.subscription_count).sum(),
            offerings,
        })
    }

    pub async fn purchases(&self, principal_id: PrincipalId) -> BillingResult<PurchaseHistory> {
        let payments = self
            .store
            .list_ledger_entries(principal_id)
            .await?
            .into_iter()
            .filter(|entry| entry.entry_type != LedgerEntryType::ApiCall)
            .collect();
        let subscriptions = self.store.list_offering_subscriptions(principal_id).await?;
        Ok(PurchaseHistory {
            payments,
            subscriptions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProvider, ProviderCall};
    use agora_shared::{BillingPlan, MemoryStore, OfferingPrice};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        provider: Arc<MockProvider>,
        payments: PaymentOrchestrator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        let payments = PaymentOrchestrator::new(
            store.clone(),
            Some(provider.clone()),
            PaymentSettings::default(),
            Lifecycle::new(),
        );
        Fixture {
            store,
            provider,
            payments,
        }
    }

    async fn principal(store: &MemoryStore, email: &str) -> Principal {
        let p = Principal::new(email, None, 10);
        store.insert_principal(&p).await.unwrap();
        p
    }

    #[tokio::test]
    async fn test_ensure_customer_creates_once() {
        let f = fixture();
        let buyer = principal(&f.store, "buyer@example.com").await;

        let first = f.payments.ensure_customer(buyer.id).await.unwrap();
        let second = f.payments.ensure_customer(buyer.id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.provider.count_of("create_customer"), 1);
    }

    #[tokio::test]
    async fn test_payout_rejection_is_payout_error() {
        let f = fixture();
        let creator = principal(&f.store, "creator@example.com").await;
        f.provider.fail(
            "create_payout_account",
            ProviderError::Rejected("country is required".to_string()),
        );

        let err = f
            .payments
            .ensure_payout_account(creator.id, "https://r", "https://f")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PayoutAccount(_)));

        let stored = f.store.get_principal(creator.id).await.unwrap().unwrap();
        assert!(stored.payout_account_id.is_none());
    }

    #[tokio::test]
    async fn test_recurring_charge_uses_cached_price() {
        let f = fixture();
        let buyer = principal(&f.store, "buyer@example.com").await;
        let creator = principal(&f.store, "creator@example.com").await;
        f.store
            .set_payout_account_if_absent(creator.id, "acct_1")
            .await
            .unwrap();
        let offering = Offering::new(
            creator.id,
            "Coach",
            OfferingPrice {
                price_type: PriceType::Subscription,
                amount: 1500,
                currency: "usd".to_string(),
                plan: BillingPlan::Yearly,
            },
        );
        f.store.insert_offering(&offering).await.unwrap();

        let charge = f
            .payments
            .create_recurring_charge(buyer.id, offering.id)
            .await
            .unwrap();
        f.payments
            .create_recurring_charge(buyer.id, offering.id)
            .await
            .unwrap();

        assert_eq!(charge.application_fee_percent, 30);
        assert_eq!(f.provider.count_of("create_price"), 1);
        let price_call = f
            .provider
            .calls()
            .into_iter()
            .find_map(|c| match c {
                ProviderCall::CreatePrice(p) => Some(p),
                _ => None,
            })
            .unwrap();
        assert_eq!(price_call.interval, Some(BillingPlan::Yearly));

        // Nothing is credited until the provider confirms payment
        let stored = f.store.get_offering(offering.id).await.unwrap().unwrap();
        assert_eq!(stored.revenue.total_earnings, 0);
        assert!(f.store.list_ledger_entries(buyer.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_timeout_persists_nothing() {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(MockProvider::new());
        provider.set_delay(Duration::from_millis(200));
        let payments = PaymentOrchestrator::new(
            store.clone(),
            Some(provider.clone()),
            PaymentSettings {
                provider_timeout: Duration::from_millis(20),
                ..PaymentSettings::default()
            },
            Lifecycle::new(),
        );
        let buyer = principal(&store, "buyer@example.com").await;

        let err = payments.ensure_customer(buyer.id).await.unwrap_err();
        assert!(matches!(err, BillingError::Provider(_)));

        let stored = store.get_principal(buyer.id).await.unwrap().unwrap();
        assert!(stored.customer_id.is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_provider_is_config_error() {
        let store = Arc::new(MemoryStore::new());
        let payments = PaymentOrchestrator::new(
            store.clone(),
            None,
            PaymentSettings::default(),
            Lifecycle::new(),
        );
        let buyer = principal(&store, "buyer@example.com").await;

        let err = payments.ensure_customer(buyer.id).await.unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancel_then_resume() {
        let f = fixture();
        let mut p = Principal::new("pro@example.com", None, 10);
        p.subscription.tier = SubscriptionTier::Pro;
        p.subscription.status = SubscriptionStatus::Active;
        p.subscription.provider_subscription_id = Some("sub_1".to_string());
        f.store.insert_principal(&p).await.unwrap();

        let status = f.payments.cancel_subscription(p.id).await.unwrap();
        assert_eq!(status, SubscriptionStatus::Canceling);
        let stored = f.store.get_principal(p.id).await.unwrap().unwrap();
        assert!(stored.subscription.cancel_at_period_end);

        let status = f.payments.resume_subscription(p.id).await.unwrap();
        assert_eq!(status, SubscriptionStatus::Active);

        assert_eq!(
            f.provider.calls(),
            vec![
                ProviderCall::SetCancelAtPeriodEnd {
                    subscription_id: "sub_1".to_string(),
                    cancel: true
                },
                ProviderCall::SetCancelAtPeriodEnd {
                    subscription_id: "sub_1".to_string(),
                    cancel: false
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_and_resume_leave_past_due_alone() {
        let f = fixture();
        let mut p = Principal::new("late@example.com", None, 10);
        p.subscription.tier = SubscriptionTier::Pro;
        p.subscription.status = SubscriptionStatus::PastDue;
        p.subscription.provider_subscription_id = Some("sub_late".to_string());
        p.subscription.current_period_end =
            Some(time::OffsetDateTime::now_utc() + time::Duration::days(10));
        f.store.insert_principal(&p).await.unwrap();
        let now = time::OffsetDateTime::now_utc();

        let status = f.payments.cancel_subscription(p.id).await.unwrap();
        assert_eq!(status, SubscriptionStatus::PastDue);
        let stored = f.store.get_principal(p.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription.status, SubscriptionStatus::PastDue);
        assert!(stored.subscription.cancel_at_period_end);
        assert_eq!(
            crate::tier::effective_tier(&stored.subscription, now),
            SubscriptionTier::Free
        );

        let status = f.payments.resume_subscription(p.id).await.unwrap();
        assert_eq!(status, SubscriptionStatus::PastDue);
        let stored = f.store.get_principal(p.id).await.unwrap().unwrap();
        assert_eq!(stored.subscription.status, SubscriptionStatus::PastDue);
        assert!(!stored.subscription.cancel_at_period_end);
        assert_eq!(
            crate::tier::effective_tier(&stored.subscription, now),
            SubscriptionTier::Free
        );
        assert_eq!(f.provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_without_subscription_is_not_found() {
        let f = fixture();
        let p = principal(&f.store, "free@example.com").await;
        let err = f.payments.cancel_subscription(p.id).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        assert_eq!(f.provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_checkout_requires_configured_price() {
        let f = fixture();
        let p = principal(&f.store, "buyer@example.com").await;
        let err = f
            .payments
            .create_checkout_session(p.id, SubscriptionTier::Pro, "https://ok", "https://no")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[tokio::test]
    async fn test_creator_earnings_sums_offerings() {
        let f = fixture();
        let creator = principal(&f.store, "creator@example.com").await;
        for (name, total) in [("A", 700), ("B", 300)] {
            let mut o = Offering::new(creator.id, name, OfferingPrice::free());
            o.revenue.total_earnings = total;
            o.revenue.subscription_count = 1;
            f.store.insert_offering(&o).await.unwrap();
        }

        let summary = f.payments.creator_earnings(creator.id).await.unwrap();
        assert_eq!(summary.total_earnings, 1000);
        assert_eq!(summary.subscription_count, 2);
        assert_eq!(summary.offerings.len(), 2);
        assert!(!summary.payout_account_connected);
    }
}
