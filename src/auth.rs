//! Bearer tokens for HTTP and WebSocket callers.
//!
//! A token is `b64(user_id ":" expires_at_unix) "." b64(hmac_sha256(payload))`, both parts
//! base64url without padding. Issuing tokens belongs to the account service; this module only
//! needs the shared secret to verify them.

use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use crate::domain::UserId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid signing key")]
    InvalidKey,
}

#[derive(Clone)]
pub struct TokenValidator {
    secret: Vec<u8>,
    ttl: Duration,
}

impl TokenValidator {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::InvalidKey)
    }

    pub fn issue(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<String, AuthError> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let expires_at = now.timestamp().saturating_add(ttl);
        let payload = format!("{}:{}", user_id, expires_at);
        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<UserId, AuthError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;

        let mut mac = self.mac()?;
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload = String::from_utf8(payload).map_err(|_| AuthError::Malformed)?;
        let (user, expires_at) = payload.rsplit_once(':').ok_or(AuthError::Malformed)?;
        let expires_at: i64 = expires_at.parse().map_err(|_| AuthError::Malformed)?;
        if now.timestamp() >= expires_at {
            return Err(AuthError::Expired);
        }
        UserId::parse(user).map_err(|_| AuthError::Malformed)
    }
}
