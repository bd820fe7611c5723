//! Payment, subscription and usage routes

use agora_billing::{
    EarningsSummary, OneTimeCharge, PayoutOnboarding, PurchaseHistory, RecurringCharge,
    SubscriptionInfo, UsageInfo, WebhookOutcome,
};
use agora_shared::{OfferingId, SubscriptionStatus, SubscriptionTier};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

/// Provider event delivery. The raw body is needed for signature verification.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(agora_billing::BillingError::WebhookSignatureInvalid)?;

    let outcome = state.billing.webhooks.handle(&body, signature).await?;
    Ok(Json(WebhookResponse {
        received: true,
        outcome,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConnectSetupRequest {
    pub return_url: String,
    pub refresh_url: String,
}

pub async fn connect_setup(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ConnectSetupRequest>,
) -> ApiResult<Json<PayoutOnboarding>> {
    require_url("return_url", &req.return_url)?;
    require_url("refresh_url", &req.refresh_url)?;

    let onboarding = state
        .billing
        .payments
        .ensure_payout_account(user.principal_id, &req.return_url, &req.refresh_url)
        .await?;
    Ok(Json(onboarding))
}

pub async fn purchase(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(offering_id): Path<Uuid>,
) -> ApiResult<Json<OneTimeCharge>> {
    let charge = state
        .billing
        .payments
        .create_one_time_charge(user.principal_id, OfferingId(offering_id))
        .await?;
    Ok(Json(charge))
}

pub async fn subscribe(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(offering_id): Path<Uuid>,
) -> ApiResult<Json<RecurringCharge>> {
    let charge = state
        .billing
        .payments
        .create_recurring_charge(user.principal_id, OfferingId(offering_id))
        .await?;
    Ok(Json(charge))
}

pub async fn creator_earnings(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<EarningsSummary>> {
    Ok(Json(
        state
            .billing
            .payments
            .creator_earnings(user.principal_id)
            .await?,
    ))
}

pub async fn my_purchases(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<PurchaseHistory>> {
    Ok(Json(state.billing.payments.purchases(user.principal_id).await?))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionStatusResponse {
    pub status: SubscriptionStatus,
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionStatusResponse>> {
    let status = state
        .billing
        .payments
        .cancel_subscription(user.principal_id)
        .await?;
    Ok(Json(SubscriptionStatusResponse { status }))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionStatusResponse>> {
    let status = state
        .billing
        .payments
        .resume_subscription(user.principal_id)
        .await?;
    Ok(Json(SubscriptionStatusResponse { status }))
}

pub async fn subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionInfo>> {
    Ok(Json(state.billing.subscription_info(user.principal_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub tier: SubscriptionTier,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub url: String,
}

pub async fn checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<SessionResponse>> {
    require_url("success_url", &req.success_url)?;
    require_url("cancel_url", &req.cancel_url)?;

    let session = state
        .billing
        .payments
        .create_checkout_session(user.principal_id, req.tier, &req.success_url, &req.cancel_url)
        .await?;
    Ok(Json(SessionResponse {
        session_id: session.id,
        url: session.url,
    }))
}

#[derive(Debug, Deserialize)]
pub struct PortalRequest {
    pub return_url: String,
}

pub async fn portal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<SessionResponse>> {
    require_url("return_url", &req.return_url)?;

    let session = state
        .billing
        .payments
        .create_portal_session(user.principal_id, &req.return_url)
        .await?;
    Ok(Json(SessionResponse {
        session_id: session.id,
        url: session.url,
    }))
}

pub async fn usage(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<UsageInfo>> {
    Ok(Json(state.billing.usage_info(user.principal_id).await?))
}

#[derive(Debug, Serialize)]
pub struct PlanInfo {
    pub tier: SubscriptionTier,
    pub requests_per_window: u64,
    pub window_seconds: u64,
    /// Monthly call quota; `None` when the tier is not metered
    pub monthly_quota: Option<i64>,
    pub checkout_available: bool,
}

/// Public list of tiers and their limits
pub async fn plans(State(state): State<AppState>) -> Json<Vec<PlanInfo>> {
    let billing = &state.billing;
    let limits = billing.rate_limiter.config();
    let price_ids = &billing.payments.settings().price_ids;

    let plans = [
        SubscriptionTier::Free,
        SubscriptionTier::Pro,
        SubscriptionTier::Enterprise,
    ]
    .into_iter()
    .map(|tier| {
        let limit = limits.for_tier(tier);
        PlanInfo {
            tier,
            requests_per_window: limit.max_requests,
            window_seconds: limit.window_secs(),
            monthly_quota: (tier == SubscriptionTier::Free).then(|| billing.free_usage_limit()),
            checkout_available: billing.payments.is_configured()
                && price_ids.for_tier(tier).is_some(),
        }
    })
    .collect();

    Json(plans)
}

fn require_url(field: &str, value: &str) -> Result<(), ApiError> {
    if value.starts_with("https://") || value.starts_with("http://") {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("{} must be an http(s) URL", field)))
    }
}
