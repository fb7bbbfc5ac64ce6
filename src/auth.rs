//! Login and per-request session validation.
//!
//! `/api/login` checks the configured credentials and issues a short-lived
//! HS256 token; every data route then validates the bearer token on each
//! request instead of relying on shared server-side session state.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const SESSION_TTL: Duration = Duration::from_secs(8 * 60 * 60);

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid user id or password")]
    BadCredentials,
    #[error("missing or malformed Authorization header")]
    MissingToken,
    #[error("session token is invalid or expired")]
    InvalidToken,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: u64,
    exp: u64,
}

/// Credential checker and token issuer.
#[derive(Clone)]
pub struct AuthService {
    user_id: String,
    password: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthService {
    pub fn new(user_id: String, password: String, secret: &str) -> Self {
        Self {
            user_id,
            password,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Literal credential check; a match issues a session token.
    pub fn login(&self, user_id: &str, password: &str) -> Result<String, AuthError> {
        if user_id != self.user_id || password != self.password {
            return Err(AuthError::BadCredentials);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.as_secs(),
            exp: (now + SESSION_TTL).as_secs(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| AuthError::BadCredentials)
    }

    /// Validate a `Authorization: Bearer <token>` header value. Returns the
    /// authenticated user id.
    pub fn verify_bearer(&self, header: Option<&str>) -> Result<String, AuthError> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingToken)?;

        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|_| AuthError::InvalidToken)?;
        Ok(data.claims.sub)
    }
}
