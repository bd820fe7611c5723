//! Bearer token verification
//!
//! Tokens are issued by the platform's identity service and signed with the
//! shared HS256 secret. This crate only verifies them; [`JwtManager::issue`]
//! exists for tooling and tests.

use agora_shared::PrincipalId;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id
    pub sub: Uuid,
    pub email: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn principal_id(&self) -> PrincipalId {
        PrincipalId(self.sub)
    }
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 30;

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &self.validation).map(|data| data.claims)
    }

    /// Sign a token for `principal` valid for `ttl`
    pub fn issue(
        &self,
        principal: PrincipalId,
        email: Option<String>,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: principal.0,
            email,
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-that-is-at-least-32-bytes-long";

    #[test]
    fn test_issued_token_validates() {
        let manager = JwtManager::new(SECRET);
        let principal = PrincipalId::new();
        let token = manager
            .issue(principal, Some("a@example.com".into()), Duration::hours(1))
            .unwrap();

        let claims = manager.validate_access_token(&token).unwrap();
        assert_eq!(claims.principal_id(), principal);
        assert_eq!(claims.email.as_deref(), Some("a@example.com"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let manager = JwtManager::new(SECRET);
        let token = manager
            .issue(PrincipalId::new(), None, Duration::hours(-2))
            .unwrap();
        assert!(manager.validate_access_token(&token).is_err());
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let token = JwtManager::new("another-secret-that-is-also-32-bytes-long")
            .issue(PrincipalId::new(), None, Duration::hours(1))
            .unwrap();
        assert!(JwtManager::new(SECRET)
            .validate_access_token(&token)
            .is_err());
    }
}
