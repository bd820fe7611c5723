//! Authentication module for the Agora API

pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{Claims, JwtManager};
pub use middleware::{client_address, optional_auth, require_auth, AuthError, AuthState, AuthUser};
