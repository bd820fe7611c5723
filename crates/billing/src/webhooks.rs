//! Payment provider webhook handling
//!
//! Verifies the signature, claims the event exactly once, then applies the
//! absolute state carried by the payload. Handlers are upserts: replaying an
//! event after a crash converges on the same records.

use std::collections::HashMap;
use std::sync::Arc;

use agora_shared::{
    BillingPlan, BillingStore, ClaimOutcome, LedgerEntry, LedgerEntryType, OfferingId,
    OfferingSubscription, OfferingSubscriptionStatus, PaymentCredit, Principal, PrincipalId,
    PrincipalSubscriptionSync, RenewalUpdate, SubscriptionStatus, SubscriptionTier,
};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::client::PaymentSettings;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{FeeSplit, TransactionLedger};
use crate::lifecycle::Lifecycle;
use crate::payments::metadata_keys;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed timestamp
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A claim still processing after this long is considered abandoned
pub const PROCESSING_TIMEOUT: Duration = Duration::minutes(30);

/// Verify a `t=…,v1=…` signature header against the raw payload.
///
/// Any one matching `v1` entry is accepted, so secrets can be rolled.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => {
                if let Ok(sig) = hex::decode(value) {
                    signatures.push(sig);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in webhook signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let within_tolerance = now
        .checked_sub(timestamp)
        .map(i64::unsigned_abs)
        .is_some_and(|skew| skew <= SIGNATURE_TOLERANCE_SECS.unsigned_abs());
    if !within_tolerance {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = compute_signature(payload, secret, timestamp)?;
    let matched = signatures
        .iter()
        .any(|sig| bool::from(expected.as_slice().ct_eq(sig.as_slice())));
    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

fn compute_signature(payload: &[u8], secret: &str, timestamp: i64) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a signature header the way the provider does
#[cfg(any(test, feature = "testing"))]
pub fn signature_header(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let sig = compute_signature(payload, secret, timestamp).unwrap_or_default();
    format!("t={},v1={}", timestamp, hex::encode(sig))
}

// =============================================================================
// Payload views
// =============================================================================

/// Provider event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    fn object<T: DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::MalformedPayload(format!("{} object: {}", self.event_type, e))
        })
    }

    fn occurred_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    current_period_end: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    items: ListObject<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct ListObject<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

impl<T> Default for ListObject<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    price: PriceObject,
}

#[derive(Debug, Deserialize)]
struct PriceObject {
    id: String,
    unit_amount: Option<i64>,
    currency: Option<String>,
    recurring: Option<Recurring>,
}

#[derive(Debug, Deserialize)]
struct Recurring {
    interval: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default = "default_currency")]
    currency: String,
    subscription: Option<String>,
    application_fee_amount: Option<i64>,
    billing_reason: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    subscription_details: Option<SubscriptionDetails>,
    #[serde(default)]
    lines: ListObject<InvoiceLine>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionDetails {
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLine {
    period: Option<Period>,
}

#[derive(Debug, Deserialize)]
struct Period {
    end: i64,
}

impl InvoiceObject {
    /// Metadata of the subscription this invoice bills, falling back to the invoice's own
    fn metadata(&self) -> &HashMap<String, String> {
        match &self.subscription_details {
            Some(details) if !details.metadata.is_empty() => &details.metadata,
            _ => &self.metadata,
        }
    }

    fn period_end(&self) -> Option<OffsetDateTime> {
        self.lines
            .data
            .iter()
            .filter_map(|line| line.period.as_ref())
            .map(|p| p.end)
            .max()
            .and_then(|end| OffsetDateTime::from_unix_timestamp(end).ok())
    }
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    amount: i64,
    amount_received: Option<i64>,
    #[serde(default = "default_currency")]
    currency: String,
    application_fee_amount: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    last_payment_error: Option<serde_json::Value>,
}

fn default_currency() -> String {
    "usd".to_string()
}

fn metadata_principal(metadata: &HashMap<String, String>) -> BillingResult<Option<PrincipalId>> {
    metadata
        .get(metadata_keys::PRINCIPAL_ID)
        .map(|raw| {
            raw.parse::<PrincipalId>().map_err(|_| {
                BillingError::MalformedPayload(format!("invalid principal_id '{}'", raw))
            })
        })
        .transpose()
}

fn metadata_offering(metadata: &HashMap<String, String>) -> BillingResult<Option<OfferingId>> {
    metadata
        .get(metadata_keys::OFFERING_ID)
        .map(|raw| {
            raw.parse::<OfferingId>().map_err(|_| {
                BillingError::MalformedPayload(format!("invalid offering_id '{}'", raw))
            })
        })
        .transpose()
}

fn from_unix(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

// =============================================================================
// Processor
// =============================================================================

/// Result of handling one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// State was applied
    Processed,
    /// Seen before or being handled elsewhere
    Duplicate,
    /// Verified but not relevant to any local record
    Ignored,
    /// Verified but unparseable; acknowledged so it is not redelivered
    Dropped,
}

pub struct WebhookProcessor {
    store: Arc<dyn BillingStore>,
    ledger: TransactionLedger,
    webhook_secret: Option<String>,
    settings: PaymentSettings,
    lifecycle: Lifecycle,
}

impl WebhookProcessor {
    pub(crate) fn new(
        store: Arc<dyn BillingStore>,
        webhook_secret: Option<String>,
        settings: PaymentSettings,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            ledger: TransactionLedger::new(store.clone()),
            store,
            webhook_secret,
            settings,
            lifecycle,
        }
    }

    /// Verify and process one delivery
    pub async fn handle(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        self.handle_at(payload, signature, OffsetDateTime::now_utc())
            .await
    }

    pub async fn handle_at(
        &self,
        payload: &[u8],
        signature: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        self.lifecycle.ensure_open()?;
        let secret = self
            .webhook_secret
            .as_deref()
            .ok_or_else(|| BillingError::Config("webhook secret not configured".to_string()))?;

        verify_signature(payload, signature, secret, now.unix_timestamp())?;

        let event: WebhookEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "Dropping unparseable webhook payload");
                return Ok(WebhookOutcome::Dropped);
            }
        };

        self.process(event, now).await
    }

    /// Claim and dispatch a verified event
    pub async fn process(
        &self,
        event: WebhookEvent,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        if self.ledger.has_event(&event.id).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, ledger entry exists"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        match self
            .store
            .claim_webhook_event(&event.id, &event.event_type, now, PROCESSING_TIMEOUT)
            .await?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event, already processed"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
            ClaimOutcome::InFlight => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Duplicate webhook event, currently being processed by another worker"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        match self.dispatch(&event).await {
            Ok(outcome) => {
                self.store.complete_webhook_event(&event.id).await?;
                Ok(outcome)
            }
            Err(BillingError::MalformedPayload(reason)) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    reason = %reason,
                    "Dropping malformed webhook event"
                );
                self.store.complete_webhook_event(&event.id).await?;
                Ok(WebhookOutcome::Dropped)
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handler failed, releasing claim for redelivery"
                );
                if let Err(release_err) = self
                    .store
                    .release_webhook_event(&event.id, &e.to_string())
                    .await
                {
                    tracing::error!(
                        event_id = %event.id,
                        error = %release_err,
                        "Failed to release webhook claim; it will be recovered after timeout"
                    );
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        match event.event_type.as_str() {
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.handle_subscription_upsert(event).await
            }
            "customer.subscription.deleted" => self.handle_subscription_deleted(event).await,
            "invoice.payment_succeeded" => self.handle_invoice_payment_succeeded(event).await,
            "invoice.paid" => self.handle_invoice_paid(event).await,
            "invoice.payment_failed" => self.handle_invoice_payment_failed(event).await,
            "payment_intent.succeeded" => self.handle_payment_intent_succeeded(event).await,
            "payment_intent.payment_failed" => self.handle_payment_intent_failed(event),
            other => {
                tracing::info!(
                    event_type = %other,
                    event_id = %event.id,
                    "Received unhandled webhook event type"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Principal a platform subscription belongs to: metadata first, then the stored link
    async fn platform_principal(
        &self,
        metadata: &HashMap<String, String>,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Principal>> {
        if let Some(id) = metadata_principal(metadata)? {
            if let Some(principal) = self.store.get_principal(id).await? {
                return Ok(Some(principal));
            }
        }
        Ok(self
            .store
            .find_principal_by_provider_subscription(provider_subscription_id)
            .await?)
    }

    async fn handle_subscription_upsert(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let subscription: SubscriptionObject = event.object()?;

        if let Some(offering_id) = metadata_offering(&subscription.metadata)? {
            return self
                .upsert_offering_subscription(event, &subscription, offering_id)
                .await;
        }

        let Some(principal) = self
            .platform_principal(&subscription.metadata, &subscription.id)
            .await?
        else {
            tracing::warn!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                "Subscription event for unknown principal"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let price_id = subscription.items.data.first().map(|item| item.price.id.clone());
        let tier = subscription
            .metadata
            .get(metadata_keys::TIER)
            .and_then(|raw| raw.parse::<SubscriptionTier>().ok())
            .or_else(|| {
                price_id
                    .as_deref()
                    .and_then(|p| self.settings.price_ids.tier_for_price(p))
            });

        let status =
            SubscriptionStatus::from_provider(&subscription.status, subscription.cancel_at_period_end);
        let sync = PrincipalSubscriptionSync {
            tier,
            provider_subscription_id: subscription.id.clone(),
            provider_price_id: price_id,
            status,
            current_period_end: from_unix(subscription.current_period_end),
            cancel_at_period_end: subscription.cancel_at_period_end,
        };
        self.store
            .sync_principal_subscription(principal.id, &sync)
            .await?;

        tracing::info!(
            principal_id = %principal.id,
            subscription_id = %subscription.id,
            tier = ?tier,
            status = %status,
            "Platform subscription synced"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn upsert_offering_subscription(
        &self,
        event: &WebhookEvent,
        subscription: &SubscriptionObject,
        offering_id: OfferingId,
    ) -> BillingResult<WebhookOutcome> {
        let Some(principal_id) = metadata_principal(&subscription.metadata)? else {
            return Err(BillingError::MalformedPayload(format!(
                "offering subscription {} carries no principal_id",
                subscription.id
            )));
        };
        let Some(offering) = self.store.get_offering(offering_id).await? else {
            tracing::warn!(
                event_id = %event.id,
                offering_id = %offering_id,
                "Subscription event for unknown offering"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let at = event.occurred_at();
        let price = subscription.items.data.first().map(|item| &item.price);
        let status = OfferingSubscriptionStatus::from_provider(&subscription.status);
        let record = OfferingSubscription {
            id: Uuid::new_v4(),
            principal_id,
            offering_id,
            provider_subscription_id: subscription.id.clone(),
            status,
            plan: price
                .and_then(|p| p.recurring.as_ref())
                .map(|r| BillingPlan::from_interval(&r.interval))
                .unwrap_or(offering.price.plan),
            amount: price
                .and_then(|p| p.unit_amount)
                .unwrap_or(offering.price.amount),
            currency: price
                .and_then(|p| p.currency.clone())
                .unwrap_or_else(|| offering.price.currency.clone()),
            renewal_count: 0,
            next_billing_date: from_unix(subscription.current_period_end),
            canceled_at: (status == OfferingSubscriptionStatus::Canceled).then_some(at),
            created_at: at,
            updated_at: at,
        };

        let stored = self.store.upsert_offering_subscription(&record).await?;
        let count = self.store.refresh_subscription_count(offering_id).await?;

        tracing::info!(
            principal_id = %principal_id,
            offering_id = %offering_id,
            subscription_id = %stored.provider_subscription_id,
            status = %stored.status,
            subscription_count = count,
            "Offering subscription synced"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_subscription_deleted(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let subscription: SubscriptionObject = event.object()?;

        if let Some(canceled) = self
            .store
            .set_offering_subscription_status(
                &subscription.id,
                OfferingSubscriptionStatus::Canceled,
                event.occurred_at(),
            )
            .await?
        {
            let count = self
                .store
                .refresh_subscription_count(canceled.offering_id)
                .await?;
            tracing::info!(
                principal_id = %canceled.principal_id,
                offering_id = %canceled.offering_id,
                subscription_id = %subscription.id,
                subscription_count = count,
                "Offering subscription canceled"
            );
            return Ok(WebhookOutcome::Processed);
        }

        let Some(principal) = self
            .platform_principal(&subscription.metadata, &subscription.id)
            .await?
        else {
            tracing::warn!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                "Deleted subscription matches no local record"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        // Deletion always wins, whichever subscription id is stored locally
        self.store.clear_principal_subscription(principal.id).await?;
        tracing::info!(
            principal_id = %principal.id,
            subscription_id = %subscription.id,
            "Platform subscription canceled, principal downgraded to free"
        );
        Ok(WebhookOutcome::Processed)
    }

    async fn handle_invoice_payment_succeeded(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookOutcome> {
        let invoice: InvoiceObject = event.object()?;
        let Some(subscription_id) = invoice.subscription.clone() else {
            tracing::info!(invoice_id = %invoice.id, "Invoice without subscription, nothing to credit");
            return Ok(WebhookOutcome::Ignored);
        };

        self.mark_paid(&subscription_id).await?;

        if invoice.amount_paid <= 0 {
            tracing::info!(
                invoice_id = %invoice.id,
                subscription_id = %subscription_id,
                "Zero-amount invoice, nothing to credit"
            );
            return Ok(WebhookOutcome::Processed);
        }

        // Offering subscription: credit the creator
        let offering_link = match self
            .store
            .get_offering_subscription_by_provider_id(&subscription_id)
            .await?
        {
            Some(sub) => Some((sub.principal_id, sub.offering_id)),
            None => match (
                metadata_principal(invoice.metadata())?,
                metadata_offering(invoice.metadata())?,
            ) {
                (Some(principal), Some(offering)) => Some((principal, offering)),
                _ => None,
            },
        };

        if let Some((principal_id, offering_id)) = offering_link {
            if self.store.get_offering(offering_id).await?.is_none() {
                tracing::warn!(
                    invoice_id = %invoice.id,
                    offering_id = %offering_id,
                    "Invoice for unknown offering, not credited"
                );
                return Ok(WebhookOutcome::Ignored);
            }
            let split = self.split(invoice.amount_paid, invoice.application_fee_amount);
            let credit = PaymentCredit {
                entry: LedgerEntry {
                    id: Uuid::new_v4(),
                    entry_type: LedgerEntryType::Subscription,
                    amount: invoice.amount_paid,
                    platform_fee: split.platform_fee,
                    currency: invoice.currency.clone(),
                    principal_id,
                    offering_id: Some(offering_id),
                    provider_event_id: Some(event.id.clone()),
                    description: format!("Subscription invoice {}", invoice.id),
                    created_at: event.occurred_at(),
                },
                renewal: Some(RenewalUpdate {
                    provider_subscription_id: subscription_id,
                    next_billing_date: invoice.period_end(),
                    is_renewal: invoice.billing_reason.as_deref() != Some("subscription_create"),
                }),
            };
            self.ledger.record_payment(&credit).await?;
            return Ok(WebhookOutcome::Processed);
        }

        // Platform subscription: the platform keeps the whole amount
        let Some(principal) = self
            .platform_principal(invoice.metadata(), &subscription_id)
            .await?
        else {
            tracing::warn!(
                invoice_id = %invoice.id,
                subscription_id = %subscription_id,
                "Paid invoice matches no local subscription"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            entry_type: LedgerEntryType::Subscription,
            amount: invoice.amount_paid,
            platform_fee: invoice.amount_paid,
            currency: invoice.currency.clone(),
            principal_id: principal.id,
            offering_id: None,
            provider_event_id: Some(event.id.clone()),
            description: format!("Platform subscription invoice {}", invoice.id),
            created_at: event.occurred_at(),
        };
        self.ledger.append(&entry).await?;
        tracing::info!(
            principal_id = %principal.id,
            invoice_id = %invoice.id,
            amount = invoice.amount_paid,
            "Platform subscription payment recorded"
        );
        Ok(WebhookOutcome::Processed)
    }

    /// `invoice.paid` accompanies `invoice.payment_succeeded`; only the
    /// latter credits, this one only restores status.
    async fn handle_invoice_paid(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let invoice: InvoiceObject = event.object()?;
        match invoice.subscription {
            Some(subscription_id) => {
                if self.mark_paid(&subscription_id).await? {
                    Ok(WebhookOutcome::Processed)
                } else {
                    Ok(WebhookOutcome::Ignored)
                }
            }
            None => Ok(WebhookOutcome::Ignored),
        }
    }

    /// Move a past-due subscription back to active. Returns whether a local
    /// record matched.
    async fn mark_paid(&self, subscription_id: &str) -> BillingResult<bool> {
        if let Some(sub) = self
            .store
            .get_offering_subscription_by_provider_id(subscription_id)
            .await?
        {
            if matches!(
                sub.status,
                OfferingSubscriptionStatus::PastDue | OfferingSubscriptionStatus::Unpaid
            ) {
                self.store
                    .set_offering_subscription_status(
                        subscription_id,
                        OfferingSubscriptionStatus::Active,
                        OffsetDateTime::now_utc(),
                    )
                    .await?;
                self.store.refresh_subscription_count(sub.offering_id).await?;
                tracing::info!(
                    subscription_id = %subscription_id,
                    offering_id = %sub.offering_id,
                    "Offering subscription recovered to active"
                );
            }
            return Ok(true);
        }

        if let Some(principal) = self
            .store
            .find_principal_by_provider_subscription(subscription_id)
            .await?
        {
            if matches!(
                principal.subscription.status,
                SubscriptionStatus::PastDue | SubscriptionStatus::Unpaid
            ) {
                self.store
                    .set_principal_subscription_status(
                        principal.id,
                        SubscriptionStatus::Active,
                        principal.subscription.cancel_at_period_end,
                    )
                    .await?;
                tracing::info!(
                    principal_id = %principal.id,
                    subscription_id = %subscription_id,
                    "Platform subscription recovered to active"
                );
            }
            return Ok(true);
        }

        Ok(false)
    }

    async fn handle_invoice_payment_failed(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookOutcome> {
        let invoice: InvoiceObject = event.object()?;
        let Some(subscription_id) = invoice.subscription else {
            return Ok(WebhookOutcome::Ignored);
        };

        if let Some(sub) = self
            .store
            .set_offering_subscription_status(
                &subscription_id,
                OfferingSubscriptionStatus::PastDue,
                event.occurred_at(),
            )
            .await?
        {
            self.store.refresh_subscription_count(sub.offering_id).await?;
            tracing::warn!(
                principal_id = %sub.principal_id,
                offering_id = %sub.offering_id,
                invoice_id = %invoice.id,
                "Offering subscription payment failed, marked past due"
            );
            return Ok(WebhookOutcome::Processed);
        }

        if let Some(principal) = self
            .store
            .find_principal_by_provider_subscription(&subscription_id)
            .await?
        {
            self.store
                .set_principal_subscription_status(
                    principal.id,
                    SubscriptionStatus::PastDue,
                    principal.subscription.cancel_at_period_end,
                )
                .await?;
            tracing::warn!(
                principal_id = %principal.id,
                invoice_id = %invoice.id,
                "Platform subscription payment failed, marked past due"
            );
            return Ok(WebhookOutcome::Processed);
        }

        tracing::info!(
            invoice_id = %invoice.id,
            subscription_id = %subscription_id,
            "Failed invoice matches no local subscription"
        );
        Ok(WebhookOutcome::Ignored)
    }

    async fn handle_payment_intent_succeeded(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookOutcome> {
        let intent: PaymentIntentObject = event.object()?;

        // Intents created for subscription invoices carry no offering metadata
        // and are credited through the invoice instead.
        let Some(offering_id) = metadata_offering(&intent.metadata)? else {
            tracing::debug!(payment_intent_id = %intent.id, "Payment intent without offering, skipping");
            return Ok(WebhookOutcome::Ignored);
        };
        let Some(principal_id) = metadata_principal(&intent.metadata)? else {
            return Err(BillingError::MalformedPayload(format!(
                "payment intent {} carries no principal_id",
                intent.id
            )));
        };
        if self.store.get_offering(offering_id).await?.is_none() {
            tracing::warn!(
                payment_intent_id = %intent.id,
                offering_id = %offering_id,
                "Payment for unknown offering, not credited"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let amount = intent.amount_received.unwrap_or(intent.amount);
        let split = self.split(amount, intent.application_fee_amount);
        let credit = PaymentCredit {
            entry: LedgerEntry {
                id: Uuid::new_v4(),
                entry_type: LedgerEntryType::Payment,
                amount,
                platform_fee: split.platform_fee,
                currency: intent.currency,
                principal_id,
                offering_id: Some(offering_id),
                provider_event_id: Some(event.id.clone()),
                description: format!("Purchase {}", intent.id),
                created_at: event.occurred_at(),
            },
            renewal: None,
        };
        self.ledger.record_payment(&credit).await?;
        Ok(WebhookOutcome::Processed)
    }

    fn handle_payment_intent_failed(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let intent: PaymentIntentObject = event.object()?;
        let principal = metadata_principal(&intent.metadata).ok().flatten();
        let offering = metadata_offering(&intent.metadata).ok().flatten();

        match (principal, offering) {
            (Some(principal_id), Some(offering_id)) => {
                tracing::warn!(
                    principal_id = %principal_id,
                    offering_id = %offering_id,
                    payment_intent_id = %intent.id,
                    reason = ?intent.last_payment_error.as_ref().and_then(|e| e.get("message")),
                    "Offering purchase payment failed"
                );
                Ok(WebhookOutcome::Processed)
            }
            _ => {
                tracing::info!(
                    payment_intent_id = %intent.id,
                    "Failed payment intent without offering metadata"
                );
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Fee reported by the provider, else the configured percentage
    fn split(&self, amount: i64, reported_fee: Option<i64>) -> FeeSplit {
        match reported_fee {
            Some(fee) => FeeSplit::with_fee(amount, fee),
            None => FeeSplit::compute(amount, self.settings.platform_fee_percent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn test_valid_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = signature_header(payload, SECRET, now);
        assert!(verify_signature(payload, &header, SECRET, now + 10).is_ok());
    }

    #[test]
    fn test_signature_uses_full_secret() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let stripped = signature_header(payload, "test_secret", now);
        assert!(verify_signature(payload, &stripped, SECRET, now).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_700_000_000;
        let header = signature_header(br#"{"amount":100}"#, SECRET, now);
        let err = verify_signature(br#"{"amount":999}"#, &header, SECRET, now).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = b"{}";
        let then = 1_700_000_000;
        let header = signature_header(payload, SECRET, then);
        assert!(verify_signature(payload, &header, SECRET, then + 301).is_err());
        assert!(verify_signature(payload, &header, SECRET, then + 300).is_ok());
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        let payload = b"{}";
        let now = 1_700_000_000;
        for t in [i64::MIN, i64::MAX] {
            let header = format!("t={},v1={}", t, "00".repeat(32));
            let err = verify_signature(payload, &header, SECRET, now).unwrap_err();
            assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        }
        let header = format!("t={},v1=00", i64::MIN);
        assert!(verify_signature(payload, &header, SECRET, i64::MAX).is_err());
    }

    #[test]
    fn test_any_matching_v1_accepted() {
        let payload = b"{}";
        let now = 1_700_000_000;
        let good = signature_header(payload, SECRET, now);
        let good_sig = good.split("v1=").nth(1).unwrap();
        let header = format!("t={},v1={},v1={}", now, "00".repeat(32), good_sig);
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_header_without_parts_rejected() {
        assert!(verify_signature(b"{}", "garbage", SECRET, 0).is_err());
        assert!(verify_signature(b"{}", "t=0", SECRET, 0).is_err());
        assert!(verify_signature(b"{}", "v1=abcd", SECRET, 0).is_err());
    }

    #[test]
    fn test_invoice_prefers_subscription_metadata() {
        let invoice: InvoiceObject = serde_json::from_value(serde_json::json!({
            "id": "in_1",
            "amount_paid": 500,
            "currency": "usd",
            "subscription": "sub_1",
            "metadata": {"principal_id": "stale"},
            "subscription_details": {"metadata": {"principal_id": "fresh"}},
            "lines": {"data": [{"period": {"end": 1_700_000_000}}, {"period": {"end": 1_700_086_400}}]}
        }))
        .unwrap();
        assert_eq!(invoice.metadata()["principal_id"], "fresh");
        assert_eq!(
            invoice.period_end(),
            OffsetDateTime::from_unix_timestamp(1_700_086_400).ok()
        );
    }
}
