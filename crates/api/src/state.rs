//! Application state

use std::sync::Arc;

use agora_billing::BillingService;
use axum::extract::FromRef;

use crate::auth::{AuthState, JwtManager};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub jwt_manager: JwtManager,
}

impl AppState {
    pub fn new(billing: Arc<BillingService>, jwt_secret: &str) -> Self {
        Self {
            billing,
            jwt_manager: JwtManager::new(jwt_secret),
        }
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        AuthState {
            jwt_manager: state.jwt_manager.clone(),
        }
    }
}
