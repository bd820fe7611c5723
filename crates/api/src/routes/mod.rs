//! API routes

pub mod payments;

#[cfg(test)]
mod router_tests;

use axum::{
    extract::{FromRef, State},
    middleware::from_fn_with_state,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::admission::admission;
use crate::auth::{optional_auth, require_auth, AuthState};
use crate::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let auth_state = AuthState::from_ref(&state);

    // Layers run bottom-up: authentication first, then admission
    let authenticated = Router::new()
        .route("/connect/setup", post(payments::connect_setup))
        .route("/purchase/{offering_id}", post(payments::purchase))
        .route("/subscribe/{offering_id}", post(payments::subscribe))
        .route("/creator/earnings", get(payments::creator_earnings))
        .route("/my/purchases", get(payments::my_purchases))
        .route("/subscription", get(payments::subscription))
        .route("/subscription/cancel", post(payments::cancel_subscription))
        .route("/subscription/resume", post(payments::resume_subscription))
        .route("/checkout", post(payments::checkout))
        .route("/portal", post(payments::portal))
        .route("/usage", get(payments::usage))
        .layer(from_fn_with_state(state.clone(), admission))
        .layer(from_fn_with_state(auth_state.clone(), require_auth));

    let public = Router::new()
        .route("/plans", get(payments::plans))
        .layer(from_fn_with_state(state.clone(), admission))
        .layer(from_fn_with_state(auth_state, optional_auth));

    // The provider authenticates by signature, not by token
    let provider = Router::new().route("/webhook", post(payments::webhook));

    Router::new()
        .route("/health", get(health))
        .nest("/payments", authenticated.merge(public).merge(provider))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let running = state.billing.is_running();
    Json(json!({
        "status": if running { "healthy" } else { "shutting_down" },
        "version": env!("CARGO_PKG_VERSION"),
        "payments_enabled": state.billing.payments.is_configured(),
    }))
}
