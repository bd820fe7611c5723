//! Payment provider seam
//!
//! The orchestrator talks to the provider only through [`PaymentProvider`].
//! [`StripeProvider`] is the production implementation; all async-stripe
//! types stay inside this module.

use std::collections::HashMap;

use agora_shared::{BillingPlan, OfferingId, PrincipalId};
use async_trait::async_trait;
use thiserror::Error;

use crate::client::StripeConfig;

/// Failure of a single provider call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider refused the request (4xx): retrying won't help
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Transport failure or provider-side error (429/5xx)
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("request timed out")]
    Timeout,

    /// The provider answered without a field we depend on
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCustomer {
    pub principal_id: PrincipalId,
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayoutAccount {
    pub principal_id: PrincipalId,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPrice {
    pub offering_id: OfferingId,
    pub name: String,
    pub amount: i64,
    pub currency: String,
    /// `Some` for recurring prices
    pub interval: Option<BillingPlan>,
}

/// One-time charge settled to a connected account minus the platform fee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationCharge {
    pub customer_id: String,
    pub amount: i64,
    pub currency: String,
    pub application_fee_amount: i64,
    pub destination: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeHandle {
    pub id: String,
    pub client_secret: Option<String>,
}

/// Recurring charge whose invoices settle to a connected account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationSubscription {
    pub customer_id: String,
    pub price_ref: String,
    pub application_fee_percent: u8,
    pub destination: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: String,
    pub status: String,
    /// Secret of the first invoice's payment, when it needs confirmation
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: HashMap<String, String>,
}

/// A provider-hosted page the client is redirected to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedSession {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_customer(&self, request: &NewCustomer) -> ProviderResult<String>;

    async fn create_payout_account(&self, request: &NewPayoutAccount) -> ProviderResult<String>;

    async fn create_onboarding_link(
        &self,
        account_id: &str,
        return_url: &str,
        refresh_url: &str,
    ) -> ProviderResult<String>;

    async fn create_price(&self, request: &NewPrice) -> ProviderResult<String>;

    async fn create_destination_charge(
        &self,
        request: &DestinationCharge,
    ) -> ProviderResult<ChargeHandle>;

    async fn create_destination_subscription(
        &self,
        request: &DestinationSubscription,
    ) -> ProviderResult<SubscriptionHandle>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> ProviderResult<()>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> ProviderResult<HostedSession>;

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> ProviderResult<HostedSession>;
}

/// Map a Stripe error onto the provider taxonomy
fn map_stripe_error(error: stripe::StripeError, operation: &str) -> ProviderError {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());

            tracing::warn!(
                operation = operation,
                http_status = status,
                error = %message,
                "Stripe request failed"
            );

            if status == 429 || status >= 500 {
                ProviderError::Upstream(message)
            } else {
                ProviderError::Rejected(message)
            }
        }
        stripe::StripeError::Timeout => ProviderError::Timeout,
        other => {
            tracing::error!(operation = operation, error = %other, "Stripe client error");
            ProviderError::Upstream(other.to_string())
        }
    }
}

fn parse_currency(currency: &str) -> ProviderResult<stripe::Currency> {
    currency
        .to_lowercase()
        .parse::<stripe::Currency>()
        .map_err(|_| ProviderError::Rejected(format!("unsupported currency '{}'", currency)))
}

fn parse_customer_id(id: &str) -> ProviderResult<stripe::CustomerId> {
    id.parse()
        .map_err(|_| ProviderError::Rejected(format!("invalid customer id '{}'", id)))
}

/// async-stripe backed provider
#[derive(Clone)]
pub struct StripeProvider {
    client: stripe::Client,
}

impl StripeProvider {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: stripe::Client::new(config.secret_key.clone()),
        }
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    async fn create_customer(&self, request: &NewCustomer) -> ProviderResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("principal_id".to_string(), request.principal_id.to_string());

        let mut params = stripe::CreateCustomer::new();
        params.email = Some(&request.email);
        params.name = request.name.as_deref();
        params.metadata = Some(metadata);

        let customer = stripe::Customer::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error(e, "create_customer"))?;

        Ok(customer.id.to_string())
    }

    async fn create_payout_account(&self, request: &NewPayoutAccount) -> ProviderResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("principal_id".to_string(), request.principal_id.to_string());

        let mut params = stripe::CreateAccount::new();
        params.type_ = Some(stripe::AccountType::Express);
        params.email = Some(&request.email);
        params.metadata = Some(metadata);
        params.capabilities = Some(stripe::CreateAccountCapabilities {
            card_payments: Some(stripe::CreateAccountCapabilitiesCardPayments {
                requested: Some(true),
            }),
            transfers: Some(stripe::CreateAccountCapabilitiesTransfers {
                requested: Some(true),
            }),
            ..Default::default()
        });

        let account = stripe::Account::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error(e, "create_payout_account"))?;

        Ok(account.id.to_string())
    }

    async fn create_onboarding_link(
        &self,
        account_id: &str,
        return_url: &str,
        refresh_url: &str,
    ) -> ProviderResult<String> {
        let account: stripe::AccountId = account_id
            .parse()
            .map_err(|_| ProviderError::Rejected(format!("invalid account id '{}'", account_id)))?;

        let mut params =
            stripe::CreateAccountLink::new(account, stripe::AccountLinkType::AccountOnboarding);
        params.return_url = Some(return_url);
        params.refresh_url = Some(refresh_url);

        let link = stripe::AccountLink::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error(e, "create_onboarding_link"))?;

        Ok(link.url)
    }

    async fn create_price(&self, request: &NewPrice) -> ProviderResult<String> {
        let mut product_metadata = HashMap::new();
        product_metadata.insert("offering_id".to_string(), request.offering_id.to_string());

        let mut params = stripe::CreatePrice::new(parse_currency(&request.currency)?);
        params.unit_amount = Some(request.amount);
        params.product_data = Some(stripe::CreatePriceProductData {
            name: request.name.clone(),
            metadata: Some(product_metadata),
            ..Default::default()
        });
        params.recurring = request.interval.map(|plan| stripe::CreatePriceRecurring {
            aggregate_usage: None,
            interval: match plan {
                BillingPlan::Monthly => stripe::CreatePriceRecurringInterval::Month,
                BillingPlan::Yearly => stripe::CreatePriceRecurringInterval::Year,
            },
            interval_count: None,
            trial_period_days: None,
            usage_type: None,
        });

        let price = stripe::Price::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error(e, "create_price"))?;

        Ok(price.id.to_string())
    }

    async fn create_destination_charge(
        &self,
        request: &DestinationCharge,
    ) -> ProviderResult<ChargeHandle> {
        let mut params =
            stripe::CreatePaymentIntent::new(request.amount, parse_currency(&request.currency)?);
        params.customer = Some(parse_customer_id(&request.customer_id)?);
        params.application_fee_amount = Some(request.application_fee_amount);
        params.transfer_data = Some(stripe::CreatePaymentIntentTransferData {
            amount: None,
            destination: request.destination.clone(),
        });
        params.automatic_payment_methods =
            Some(stripe::CreatePaymentIntentAutomaticPaymentMethods {
                allow_redirects: None,
                enabled: true,
            });
        params.metadata = Some(request.metadata.clone());

        let intent = stripe::PaymentIntent::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error(e, "create_destination_charge"))?;

        Ok(ChargeHandle {
            id: intent.id.to_string(),
            client_secret: intent.client_secret,
        })
    }

    async fn create_destination_subscription(
        &self,
        request: &DestinationSubscription,
    ) -> ProviderResult<SubscriptionHandle> {
        let mut params = stripe::CreateSubscription::new(parse_customer_id(&request.customer_id)?);
        params.items = Some(vec![stripe::CreateSubscriptionItems {
            price: Some(request.price_ref.clone()),
            ..Default::default()
        }]);
        params.application_fee_percent = Some(f64::from(request.application_fee_percent));
        params.transfer_data = Some(stripe::CreateSubscriptionTransferData {
            amount_percent: None,
            destination: request.destination.clone(),
        });
        params.payment_behavior = Some(stripe::SubscriptionPaymentBehavior::DefaultIncomplete);
        params.metadata = Some(request.metadata.clone());
        params.expand = &["latest_invoice.payment_intent"];

        let subscription = stripe::Subscription::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error(e, "create_destination_subscription"))?;

        let client_secret = subscription
            .latest_invoice
            .as_ref()
            .and_then(|invoice| invoice.as_object())
            .and_then(|invoice| invoice.payment_intent.as_ref())
            .and_then(|intent| intent.as_object())
            .and_then(|intent| intent.client_secret.clone());

        Ok(SubscriptionHandle {
            id: subscription.id.to_string(),
            status: subscription.status.as_str().to_string(),
            client_secret,
        })
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> ProviderResult<()> {
        let sub_id: stripe::SubscriptionId = subscription_id.parse().map_err(|_| {
            ProviderError::Rejected(format!("invalid subscription id '{}'", subscription_id))
        })?;

        let mut params = stripe::UpdateSubscription::new();
        params.cancel_at_period_end = Some(cancel);

        stripe::Subscription::update(&self.client, &sub_id, params)
            .await
            .map_err(|e| map_stripe_error(e, "set_cancel_at_period_end"))?;

        Ok(())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> ProviderResult<HostedSession> {
        let mut params = stripe::CreateCheckoutSession::new();
        params.customer = Some(parse_customer_id(&request.customer_id)?);
        params.mode = Some(stripe::CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(request.metadata.clone());
        // Subscription events carry the subscription's metadata, not the session's
        params.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
            metadata: Some(request.metadata.clone()),
            ..Default::default()
        });

        let session = stripe::CheckoutSession::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error(e, "create_checkout_session"))?;

        let url = session.url.ok_or_else(|| {
            ProviderError::UnexpectedResponse("checkout session without url".to_string())
        })?;

        Ok(HostedSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> ProviderResult<HostedSession> {
        let mut params = stripe::CreateBillingPortalSession::new(parse_customer_id(customer_id)?);
        params.return_url = Some(return_url);

        let session = stripe::BillingPortalSession::create(&self.client, params)
            .await
            .map_err(|e| map_stripe_error(e, "create_portal_session"))?;

        Ok(HostedSession {
            id: session.id.to_string(),
            url: session.url,
        })
    }
}
