//! Admission control for metered routes
//!
//! Runs after authentication: resolve the effective tier, count the request
//! against the tier's rate window, then against the monthly quota. An
//! authenticated call is counted toward its monthly usage even when the rate
//! limiter turns it away. Anonymous callers are rate limited by client
//! address and never metered. Successful authenticated calls are recorded in
//! the ledger as `api_call` entries.

use agora_billing::RateLimitSubject;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth::{client_address, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

pub const USAGE_COUNT_HEADER: &str = "x-usage-count";
pub const USAGE_LIMIT_HEADER: &str = "x-usage-limit";
pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

pub async fn admission(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let principal = request.extensions().get::<AuthUser>().map(|u| u.principal_id);
    let billing = &state.billing;

    let tier = billing.tiers.resolve(principal).await;

    let subject = match principal {
        Some(id) => RateLimitSubject::Principal(id),
        None => RateLimitSubject::Anonymous(
            client_address(&request).unwrap_or_else(|| "unknown".to_string()),
        ),
    };
    let rate = billing.rate_limiter.enforce(&subject, tier).await;

    // Counted whatever the rate verdict
    let usage = match principal {
        Some(id) => Some(billing.usage.track(id, tier).await),
        None => None,
    };

    let rate = match rate {
        Ok(rate) => rate,
        Err(e) => return ApiError::from(e).into_response(),
    };
    let usage = match usage.transpose() {
        Ok(usage) => usage,
        Err(e) => return ApiError::from(e).into_response(),
    };

    let call = format!("{} {}", request.method(), request.uri().path());
    let mut response = next.run(request).await;

    if let Some(id) = principal.filter(|_| response.status().is_success()) {
        if let Err(e) = billing.ledger.record_api_call(id, call).await {
            tracing::warn!(principal_id = %id, error = %e, "Failed to record API call");
        }
    }

    let headers = response.headers_mut();
    set_header(headers, RATE_LIMIT_LIMIT_HEADER, rate.limit.into());
    set_header(headers, RATE_LIMIT_REMAINING_HEADER, rate.remaining.into());
    if let Some(usage) = usage {
        set_header(headers, USAGE_COUNT_HEADER, usage.usage.into());
        set_header(headers, USAGE_LIMIT_HEADER, usage.limit.into());
    }
    response
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: HeaderValue) {
    headers.insert(HeaderName::from_static(name), value);
}
