//! HTTP translation of billing errors

use agora_billing::BillingError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;
use time::format_description::well_known::Rfc3339;

use crate::auth::AuthError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(err) => billing_status(err),
            ApiError::Auth(err) => err.status(),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable code for clients
    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::Billing(err) => match err {
                BillingError::Config(_) => "billing_unavailable",
                BillingError::NotFound(_) => "not_found",
                BillingError::Validation(_) => "validation_failed",
                BillingError::PayoutAccount(_) => "payout_account_required",
                BillingError::WebhookSignatureInvalid => "invalid_signature",
                BillingError::MalformedPayload(_) => "malformed_payload",
                BillingError::Provider(_) => "payment_provider_error",
                BillingError::QuotaExceeded { .. } => "usage_limit_exceeded",
                BillingError::RateLimited { .. } => "rate_limited",
                BillingError::Store(_) => "store_unavailable",
            },
            ApiError::Auth(_) => "unauthorized",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::Config(_) | BillingError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::NotFound(_) => StatusCode::NOT_FOUND,
        BillingError::Validation(_)
        | BillingError::WebhookSignatureInvalid
        | BillingError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        BillingError::PayoutAccount(_) => StatusCode::CONFLICT,
        BillingError::Provider(_) => StatusCode::BAD_GATEWAY,
        BillingError::QuotaExceeded { .. } | BillingError::RateLimited { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.error_code();

        let mut body = match &self {
            ApiError::Billing(BillingError::Provider(detail)) => {
                tracing::error!(error = %detail, "Payment provider request failed");
                json!({ "error": "Payment provider request failed" })
            }
            ApiError::Billing(BillingError::Store(detail)) => {
                tracing::error!(error = %detail, "Store unavailable");
                json!({ "error": "Service temporarily unavailable" })
            }
            ApiError::Billing(BillingError::QuotaExceeded {
                usage,
                limit,
                reset_date,
            }) => json!({
                "error": "Free tier monthly limit reached. Please upgrade to continue.",
                "usage": usage,
                "limit": limit,
                "resetDate": reset_date.format(&Rfc3339).unwrap_or_default(),
            }),
            ApiError::Billing(BillingError::RateLimited {
                limit,
                window_seconds,
                retry_after_seconds,
            }) => json!({
                "error": format!("Rate limit exceeded: {} requests per {} seconds", limit, window_seconds),
                "retryAfter": retry_after_seconds,
            }),
            other => json!({ "error": other.to_string() }),
        };
        if let Value::Object(map) = &mut body {
            map.insert("code".to_string(), json!(code));
        }

        let mut response = (status, Json(body)).into_response();
        if let ApiError::Billing(BillingError::RateLimited {
            retry_after_seconds,
            ..
        }) = &self
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
