//! In-process payment provider for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::provider::{
    ChargeHandle, CheckoutRequest, DestinationCharge, DestinationSubscription, HostedSession,
    NewCustomer, NewPayoutAccount, NewPrice, PaymentProvider, ProviderError, ProviderResult,
    SubscriptionHandle,
};

/// A call received by [`MockProvider`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    CreateCustomer(NewCustomer),
    CreatePayoutAccount(NewPayoutAccount),
    CreateOnboardingLink { account_id: String },
    CreatePrice(NewPrice),
    CreateDestinationCharge(DestinationCharge),
    CreateDestinationSubscription(DestinationSubscription),
    SetCancelAtPeriodEnd { subscription_id: String, cancel: bool },
    CreateCheckoutSession(CheckoutRequest),
    CreatePortalSession { customer_id: String },
}

impl ProviderCall {
    fn operation(&self) -> &'static str {
        match self {
            ProviderCall::CreateCustomer(_) => "create_customer",
            ProviderCall::CreatePayoutAccount(_) => "create_payout_account",
            ProviderCall::CreateOnboardingLink { .. } => "create_onboarding_link",
            ProviderCall::CreatePrice(_) => "create_price",
            ProviderCall::CreateDestinationCharge(_) => "create_destination_charge",
            ProviderCall::CreateDestinationSubscription(_) => "create_destination_subscription",
            ProviderCall::SetCancelAtPeriodEnd { .. } => "set_cancel_at_period_end",
            ProviderCall::CreateCheckoutSession(_) => "create_checkout_session",
            ProviderCall::CreatePortalSession { .. } => "create_portal_session",
        }
    }
}

/// Records every call and answers with deterministic ids.
/// Failures and latency can be injected per operation name.
#[derive(Default)]
pub struct MockProvider {
    calls: Mutex<Vec<ProviderCall>>,
    failures: Mutex<HashMap<&'static str, ProviderError>>,
    delay: Mutex<Option<Duration>>,
    next_id: AtomicU64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `operation` fail with `error`
    pub fn fail(&self, operation: &'static str, error: ProviderError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation, error);
    }

    /// Delay every call by `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn count_of(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    async fn record(&self, call: ProviderCall) -> ProviderResult<u64> {
        let operation = call.operation();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(operation)
            .cloned();
        match failure {
            Some(err) => Err(err),
            None => Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1),
        }
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn create_customer(&self, request: &NewCustomer) -> ProviderResult<String> {
        let n = self
            .record(ProviderCall::CreateCustomer(request.clone()))
            .await?;
        Ok(format!("cus_mock_{}", n))
    }

    async fn create_payout_account(&self, request: &NewPayoutAccount) -> ProviderResult<String> {
        let n = self
            .record(ProviderCall::CreatePayoutAccount(request.clone()))
            .await?;
        Ok(format!("acct_mock_{}", n))
    }

    async fn create_onboarding_link(
        &self,
        account_id: &str,
        _return_url: &str,
        _refresh_url: &str,
    ) -> ProviderResult<String> {
        self.record(ProviderCall::CreateOnboardingLink {
            account_id: account_id.to_string(),
        })
        .await?;
        Ok(format!("https://connect.example.test/onboarding/{}", account_id))
    }

    async fn create_price(&self, request: &NewPrice) -> ProviderResult<String> {
        let n = self.record(ProviderCall::CreatePrice(request.clone())).await?;
        Ok(format!("price_mock_{}", n))
    }

    async fn create_destination_charge(
        &self,
        request: &DestinationCharge,
    ) -> ProviderResult<ChargeHandle> {
        let n = self
            .record(ProviderCall::CreateDestinationCharge(request.clone()))
            .await?;
        Ok(ChargeHandle {
            id: format!("pi_mock_{}", n),
            client_secret: Some(format!("pi_mock_{}_secret", n)),
        })
    }

    async fn create_destination_subscription(
        &self,
        request: &DestinationSubscription,
    ) -> ProviderResult<SubscriptionHandle> {
        let n = self
            .record(ProviderCall::CreateDestinationSubscription(request.clone()))
            .await?;
        Ok(SubscriptionHandle {
            id: format!("sub_mock_{}", n),
            status: "incomplete".to_string(),
            client_secret: Some(format!("pi_mock_{}_secret", n)),
        })
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> ProviderResult<()> {
        self.record(ProviderCall::SetCancelAtPeriodEnd {
            subscription_id: subscription_id.to_string(),
            cancel,
        })
        .await?;
        Ok(())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> ProviderResult<HostedSession> {
        let n = self
            .record(ProviderCall::CreateCheckoutSession(request.clone()))
            .await?;
        Ok(HostedSession {
            id: format!("cs_mock_{}", n),
            url: format!("https://checkout.example.test/cs_mock_{}", n),
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        _return_url: &str,
    ) -> ProviderResult<HostedSession> {
        let n = self
            .record(ProviderCall::CreatePortalSession {
                customer_id: customer_id.to_string(),
            })
            .await?;
        Ok(HostedSession {
            id: format!("bps_mock_{}", n),
            url: format!("https://billing.example.test/bps_mock_{}", n),
        })
    }
}
