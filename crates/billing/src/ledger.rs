//! Transaction ledger
//!
//! Append-only record of money-relevant events. Revenue totals on offerings
//! are derived from it and only move together with a new entry.

use std::sync::Arc;

use agora_shared::{BillingStore, LedgerEntry, LedgerEntryType, PaymentCredit, PrincipalId};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Platform/creator split of a gross amount in minor units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub platform_fee: i64,
    pub creator_share: i64,
}

impl FeeSplit {
    /// Split `amount` with the platform keeping `fee_percent`, rounded half-up.
    pub fn compute(amount: i64, fee_percent: u8) -> Self {
        let pct = i64::from(fee_percent.min(100));
        let platform_fee = if amount >= 0 {
            (amount * pct + 50) / 100
        } else {
            -((-amount * pct + 50) / 100)
        };
        Self {
            platform_fee,
            creator_share: amount - platform_fee,
        }
    }

    /// Split using a fee the provider already reported
    pub fn with_fee(amount: i64, platform_fee: i64) -> Self {
        let platform_fee = platform_fee.clamp(0, amount.max(0));
        Self {
            platform_fee,
            creator_share: amount - platform_fee,
        }
    }
}

/// Append-only ledger service
#[derive(Clone)]
pub struct TransactionLedger {
    store: Arc<dyn BillingStore>,
}

impl TransactionLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Record a confirmed payment and credit the creator. Returns false if
    /// this provider event was already credited.
    pub async fn record_payment(&self, credit: &PaymentCredit) -> BillingResult<bool> {
        let credited = self.store.credit_payment(credit).await?;
        if credited {
            tracing::info!(
                principal_id = %credit.entry.principal_id,
                offering_id = ?credit.entry.offering_id,
                event_id = ?credit.entry.provider_event_id,
                amount = credit.entry.amount,
                platform_fee = credit.entry.platform_fee,
                "Ledger entry recorded"
            );
        } else {
            tracing::info!(
                event_id = ?credit.entry.provider_event_id,
                "Ledger entry already exists for event, skipping"
            );
        }
        Ok(credited)
    }

    /// Append an entry that moves no offering revenue
    pub async fn append(&self, entry: &LedgerEntry) -> BillingResult<bool> {
        Ok(self.store.append_ledger_entry(entry).await?)
    }

    /// Record a served API call. Carries no amount and no event id.
    pub async fn record_api_call(
        &self,
        principal: PrincipalId,
        description: impl Into<String>,
    ) -> BillingResult<()> {
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            entry_type: LedgerEntryType::ApiCall,
            amount: 0,
            platform_fee: 0,
            currency: "usd".to_string(),
            principal_id: principal,
            offering_id: None,
            provider_event_id: None,
            description: description.into(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.append(&entry).await?;
        Ok(())
    }

    pub async fn has_event(&self, provider_event_id: &str) -> BillingResult<bool> {
        Ok(self
            .store
            .ledger_entry_for_event(provider_event_id)
            .await?
            .is_some())
    }

    pub async fn entries_for(&self, principal: PrincipalId) -> BillingResult<Vec<LedgerEntry>> {
        Ok(self.store.list_ledger_entries(principal).await?)
    }
}
