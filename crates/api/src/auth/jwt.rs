//! Bearer token validation (HS256)

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

pub const ROLE_CLIENT: &str = "client";
pub const ROLE_ADMIN: &str = "admin";

/// Claims carried by portal and admin tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: Uuid,
    pub email: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
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
        validation.leeway = 60;
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, JwtError> {
        Ok(decode::<Claims>(token, &self.decoding_key, &self.validation)?.claims)
    }

    /// Sign a token. Tokens are normally issued by the identity provider;
    /// this exists for tooling and tests.
    pub fn issue(
        &self,
        user_id: Uuid,
        email: &str,
        role: &str,
        ttl: time::Duration,
    ) -> Result<String, JwtError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            role: role.to_string(),
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-jwt-secret-key-for-testing-only";

    #[test]
    fn test_issue_then_validate() {
        let jwt = JwtManager::new(TEST_SECRET);
        let user = Uuid::new_v4();
        let token = jwt
            .issue(user, "a@x.com", ROLE_CLIENT, time::Duration::hours(1))
            .unwrap();

        let claims = jwt.validate(&token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.role, ROLE_CLIENT);
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtManager::new(TEST_SECRET);
        let token = jwt
            .issue(Uuid::new_v4(), "a@x.com", ROLE_CLIENT, time::Duration::hours(-2))
            .unwrap();
        assert!(jwt.validate(&token).is_err());
    }

    #[test]
    fn test_token_from_other_secret_rejected() {
        let other = JwtManager::new("another-secret-another-secret-123");
        let token = other
            .issue(Uuid::new_v4(), "a@x.com", ROLE_ADMIN, time::Duration::hours(1))
            .unwrap();
        assert!(JwtManager::new(TEST_SECRET).validate(&token).is_err());
    }
}
