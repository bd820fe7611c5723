//! In-memory billing store
//!
//! Used by tests and local development. A single mutex serializes every
//! operation, which gives each trait method the same atomicity the
//! PostgreSQL backend gets from conditional updates.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::store::{
    evaluate_usage, BillingStore, ClaimOutcome, PaymentCredit, PrincipalSubscriptionSync,
    UsageCheck, UsageOutcome,
};
use crate::types::{
    LedgerEntry, Offering, OfferingId, OfferingSubscription, OfferingSubscriptionStatus, Principal,
    PrincipalId, SubscriptionStatus, SubscriptionTier, WebhookEventRecord, WebhookEventStatus,
};

#[derive(Default)]
struct State {
    principals: HashMap<PrincipalId, Principal>,
    offerings: HashMap<OfferingId, Offering>,
    subscriptions: HashMap<(PrincipalId, OfferingId), OfferingSubscription>,
    ledger: Vec<LedgerEntry>,
    webhook_events: HashMap<String, WebhookEventRecord>,
}

impl State {
    fn principal_mut(&mut self, id: PrincipalId) -> StoreResult<&mut Principal> {
        self.principals
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("principal {}", id)))
    }

    fn offering_mut(&mut self, id: OfferingId) -> StoreResult<&mut Offering> {
        self.offerings
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("offering {}", id)))
    }

    fn has_event(&self, provider_event_id: &Option<String>) -> bool {
        match provider_event_id {
            Some(event_id) => self
                .ledger
                .iter()
                .any(|e| e.provider_event_id.as_deref() == Some(event_id.as_str())),
            None => false,
        }
    }

    fn live_subscription_count(&self, offering: OfferingId) -> i64 {
        self.subscriptions
            .values()
            .filter(|s| s.offering_id == offering && s.status.is_live())
            .count() as i64
    }
}

/// Billing store kept entirely in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn insert_principal(&self, principal: &Principal) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.principals.contains_key(&principal.id) {
            return Err(StoreError::Conflict(format!(
                "principal {} already exists",
                principal.id
            )));
        }
        state.principals.insert(principal.id, principal.clone());
        Ok(())
    }

    async fn get_principal(&self, id: PrincipalId) -> StoreResult<Option<Principal>> {
        Ok(self.state.lock().await.principals.get(&id).cloned())
    }

    async fn set_principal_active(&self, id: PrincipalId, active: bool) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.principals.get_mut(&id) {
            Some(principal) => {
                principal.is_active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_customer_id_if_absent(
        &self,
        id: PrincipalId,
        customer_id: &str,
    ) -> StoreResult<String> {
        let mut state = self.state.lock().await;
        let principal = state.principal_mut(id)?;
        Ok(principal
            .customer_id
            .get_or_insert_with(|| customer_id.to_string())
            .clone())
    }

    async fn set_payout_account_if_absent(
        &self,
        id: PrincipalId,
        account_id: &str,
    ) -> StoreResult<String> {
        let mut state = self.state.lock().await;
        let principal = state.principal_mut(id)?;
        Ok(principal
            .payout_account_id
            .get_or_insert_with(|| account_id.to_string())
            .clone())
    }

    async fn record_usage(
        &self,
        id: PrincipalId,
        check: &UsageCheck,
    ) -> StoreResult<UsageOutcome> {
        let mut state = self.state.lock().await;
        let sub = &mut state.principal_mut(id)?.subscription;
        let outcome = evaluate_usage(sub.usage_count, sub.usage_limit, sub.last_usage_reset, check);
        match outcome {
            UsageOutcome::Admitted { usage, reset, .. } => {
                sub.usage_count = usage;
                if reset {
                    sub.last_usage_reset = check.now;
                }
            }
            UsageOutcome::Exceeded { .. } => sub.usage_count += 1,
        }
        Ok(outcome)
    }

    async fn sync_principal_subscription(
        &self,
        id: PrincipalId,
        sync: &PrincipalSubscriptionSync,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(principal) = state.principals.get_mut(&id) else {
            return Ok(false);
        };
        let sub = &mut principal.subscription;
        if let Some(tier) = sync.tier {
            sub.tier = tier;
        }
        sub.provider_subscription_id = Some(sync.provider_subscription_id.clone());
        if sync.provider_price_id.is_some() {
            sub.provider_price_id = sync.provider_price_id.clone();
        }
        sub.status = sync.status;
        sub.current_period_end = sync.current_period_end;
        sub.cancel_at_period_end = sync.cancel_at_period_end;
        Ok(true)
    }

    async fn set_principal_subscription_status(
        &self,
        id: PrincipalId,
        status: SubscriptionStatus,
        cancel_at_period_end: bool,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(principal) = state.principals.get_mut(&id) else {
            return Ok(false);
        };
        principal.subscription.status = status;
        principal.subscription.cancel_at_period_end = cancel_at_period_end;
        Ok(true)
    }

    async fn set_principal_cancel_at_period_end(
        &self,
        id: PrincipalId,
        cancel: bool,
    ) -> StoreResult<Option<SubscriptionStatus>> {
        let mut state = self.state.lock().await;
        let Some(principal) = state.principals.get_mut(&id) else {
            return Ok(None);
        };
        let sub = &mut principal.subscription;
        sub.status = sub.status.after_cancel_request(cancel);
        sub.cancel_at_period_end = cancel;
        Ok(Some(sub.status))
    }

    async fn clear_principal_subscription(&self, id: PrincipalId) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let Some(principal) = state.principals.get_mut(&id) else {
            return Ok(false);
        };
        let sub = &mut principal.subscription;
        sub.tier = SubscriptionTier::Free;
        sub.status = SubscriptionStatus::Canceled;
        sub.provider_subscription_id = None;
        sub.provider_price_id = None;
        sub.cancel_at_period_end = false;
        Ok(true)
    }

    async fn find_principal_by_provider_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<Principal>> {
        let state = self.state.lock().await;
        Ok(state
            .principals
            .values()
            .find(|p| {
                p.subscription.provider_subscription_id.as_deref()
                    == Some(provider_subscription_id)
            })
            .cloned())
    }

    async fn insert_offering(&self, offering: &Offering) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state.offerings.contains_key(&offering.id) {
            return Err(StoreError::Conflict(format!(
                "offering {} already exists",
                offering.id
            )));
        }
        state.offerings.insert(offering.id, offering.clone());
        Ok(())
    }

    async fn get_offering(&self, id: OfferingId) -> StoreResult<Option<Offering>> {
        Ok(self.state.lock().await.offerings.get(&id).cloned())
    }

    async fn set_price_ref_if_absent(
        &self,
        id: OfferingId,
        price_ref: &str,
    ) -> StoreResult<String> {
        let mut state = self.state.lock().await;
        let offering = state.offering_mut(id)?;
        Ok(offering
            .price_ref
            .get_or_insert_with(|| price_ref.to_string())
            .clone())
    }

    async fn list_offerings_by_creator(&self, creator: PrincipalId) -> StoreResult<Vec<Offering>> {
        let state = self.state.lock().await;
        let mut offerings: Vec<Offering> = state
            .offerings
            .values()
            .filter(|o| o.creator_id == creator)
            .cloned()
            .collect();
        offerings.sort_by_key(|o| o.created_at);
        Ok(offerings)
    }

    async fn upsert_offering_subscription(
        &self,
        subscription: &OfferingSubscription,
    ) -> StoreResult<OfferingSubscription> {
        let mut state = self.state.lock().await;
        let key = (subscription.principal_id, subscription.offering_id);
        let stored = match state.subscriptions.get(&key) {
            Some(existing) => OfferingSubscription {
                id: existing.id,
                created_at: existing.created_at,
                renewal_count: existing.renewal_count,
                ..subscription.clone()
            },
            None => subscription.clone(),
        };
        state.subscriptions.insert(key, stored.clone());
        Ok(stored)
    }

    async fn set_offering_subscription_status(
        &self,
        provider_subscription_id: &str,
        status: OfferingSubscriptionStatus,
        at: OffsetDateTime,
    ) -> StoreResult<Option<OfferingSubscription>> {
        let mut state = self.state.lock().await;
        let Some(sub) = state
            .subscriptions
            .values_mut()
            .find(|s| s.provider_subscription_id == provider_subscription_id)
        else {
            return Ok(None);
        };
        sub.status = status;
        sub.updated_at = at;
        if status == OfferingSubscriptionStatus::Canceled {
            sub.canceled_at = Some(at);
        }
        Ok(Some(sub.clone()))
    }

    async fn get_offering_subscription_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<OfferingSubscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.provider_subscription_id == provider_subscription_id)
            .cloned())
    }

    async fn list_offering_subscriptions(
        &self,
        principal: PrincipalId,
    ) -> StoreResult<Vec<OfferingSubscription>> {
        let state = self.state.lock().await;
        let mut subs: Vec<OfferingSubscription> = state
            .subscriptions
            .values()
            .filter(|s| s.principal_id == principal)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        Ok(subs)
    }

    async fn refresh_subscription_count(&self, offering: OfferingId) -> StoreResult<i64> {
        let mut state = self.state.lock().await;
        let count = state.live_subscription_count(offering);
        state.offering_mut(offering)?.revenue.subscription_count = count;
        Ok(count)
    }

    async fn credit_payment(&self, credit: &PaymentCredit) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.has_event(&credit.entry.provider_event_id) {
            return Ok(false);
        }

        // Validate every target before mutating anything
        if let Some(offering_id) = credit.entry.offering_id {
            state.offering_mut(offering_id)?;
        }

        let share = credit.entry.creator_share();
        if let Some(offering_id) = credit.entry.offering_id {
            let revenue = &mut state.offering_mut(offering_id)?.revenue;
            revenue.total_earnings += share;
            revenue.monthly_earnings += share;
        }
        if let Some(renewal) = &credit.renewal {
            if let Some(sub) = state
                .subscriptions
                .values_mut()
                .find(|s| s.provider_subscription_id == renewal.provider_subscription_id)
            {
                if renewal.is_renewal {
                    sub.renewal_count += 1;
                }
                sub.updated_at = credit.entry.created_at;
                if renewal.next_billing_date.is_some() {
                    sub.next_billing_date = renewal.next_billing_date;
                }
            }
        }
        state.ledger.push(credit.entry.clone());
        Ok(true)
    }

    async fn append_ledger_entry(&self, entry: &LedgerEntry) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.has_event(&entry.provider_event_id) {
            return Ok(false);
        }
        state.ledger.push(entry.clone());
        Ok(true)
    }

    async fn ledger_entry_for_event(
        &self,
        provider_event_id: &str,
    ) -> StoreResult<Option<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .find(|e| e.provider_event_id.as_deref() == Some(provider_event_id))
            .cloned())
    }

    async fn list_ledger_entries(&self, principal: PrincipalId) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|e| e.principal_id == principal)
            .cloned()
            .collect())
    }

    async fn recompute_monthly_earnings(&self, month_start: OffsetDateTime) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut totals: HashMap<OfferingId, i64> = HashMap::new();
        for entry in state.ledger.iter().filter(|e| e.created_at >= month_start) {
            if let Some(offering_id) = entry.offering_id {
                *totals.entry(offering_id).or_default() += entry.creator_share();
            }
        }
        let mut updated = 0;
        for offering in state.offerings.values_mut() {
            let monthly = totals.get(&offering.id).copied().unwrap_or(0);
            if offering.revenue.monthly_earnings != monthly {
                offering.revenue.monthly_earnings = monthly;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn claim_webhook_event(
        &self,
        provider_event_id: &str,
        event_type: &str,
        now: OffsetDateTime,
        stale_after: Duration,
    ) -> StoreResult<ClaimOutcome> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.webhook_events.get_mut(provider_event_id) {
            match record.status {
                WebhookEventStatus::Processed => return Ok(ClaimOutcome::AlreadyProcessed),
                WebhookEventStatus::Processing if record.started_at > now - stale_after => {
                    return Ok(ClaimOutcome::InFlight)
                }
                WebhookEventStatus::Processing | WebhookEventStatus::Failed => {
                    record.status = WebhookEventStatus::Processing;
                    record.started_at = now;
                    return Ok(ClaimOutcome::Claimed);
                }
            }
        }
        state.webhook_events.insert(
            provider_event_id.to_string(),
            WebhookEventRecord {
                provider_event_id: provider_event_id.to_string(),
                event_type: event_type.to_string(),
                status: WebhookEventStatus::Processing,
                started_at: now,
                error_message: None,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete_webhook_event(&self, provider_event_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.webhook_events.get_mut(provider_event_id) {
            record.status = WebhookEventStatus::Processed;
            record.error_message = None;
        }
        Ok(())
    }

    async fn release_webhook_event(
        &self,
        provider_event_id: &str,
        error: &str,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.webhook_events.get_mut(provider_event_id) {
            record.status = WebhookEventStatus::Failed;
            record.error_message = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_webhook_event(
        &self,
        provider_event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .webhook_events
            .get(provider_event_id)
            .cloned())
    }

    async fn recover_stale_webhook_claims(&self, cutoff: OffsetDateTime) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut recovered = 0;
        for record in state.webhook_events.values_mut() {
            if record.status == WebhookEventStatus::Processing && record.started_at < cutoff {
                record.status = WebhookEventStatus::Failed;
                record.error_message = Some("claim expired".to_string());
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
