use crate::db;
use crate::errors::{Error, Result};
use crate::model::Device;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::debug;

/// Distinguishes device tokens from human-user tokens minted with the same
/// signing material. A device token must never authorize a query endpoint
/// and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Device,
    User,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    kind: TokenKind,
    exp: i64,
}

/// Signs and verifies the short-lived bearer tokens used by both transports.
///
/// Owned by the process and injected into the adapters; token verification
/// is a pure cryptographic check and never touches storage.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, algorithm: Algorithm, ttl_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            algorithm,
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    /// Issues a device token with `sub` set to the device id. Always
    /// succeeds for a valid id; the caller is responsible for having
    /// authenticated the device first.
    pub fn mint_device_token(&self, device_id: i64) -> Result<String> {
        self.mint(device_id.to_string(), TokenKind::Device)
    }

    pub fn mint_user_token(&self, user_id: i64) -> Result<String> {
        self.mint(user_id.to_string(), TokenKind::User)
    }

    fn mint(&self, sub: String, kind: TokenKind) -> Result<String> {
        let claims = Claims {
            sub,
            kind,
            exp: (Utc::now() + self.ttl).timestamp(),
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|_| Error::InvalidToken)
    }

    /// Validates signature, expiry and token kind, returning the embedded
    /// device id. Does not check that the device still exists; the
    /// ingestion path re-fetches it.
    pub fn verify_device_token(&self, token: &str) -> Result<i64> {
        self.verify(token, TokenKind::Device)
    }

    /// Same check for human-user tokens, used by the query endpoints.
    pub fn verify_user_token(&self, token: &str) -> Result<i64> {
        self.verify(token, TokenKind::User)
    }

    fn verify(&self, token: &str, expected: TokenKind) -> Result<i64> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;

        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            debug!("Token rejected: {}", e);
            Error::InvalidToken
        })?;

        if data.claims.kind != expected {
            return Err(Error::InvalidToken);
        }

        data.claims.sub.parse().map_err(|_| Error::InvalidToken)
    }
}

/// Hashes a device key for storage. Provisioning tooling calls this when
/// registering or rotating a key; the hub itself only ever verifies.
#[allow(dead_code)]
pub fn hash_device_key(key: &str) -> Result<String> {
    Ok(bcrypt::hash(key, bcrypt::DEFAULT_COST)?)
}

/// Checks a device's long-lived key against the stored bcrypt hash.
///
/// The slow hash only runs here, at token-mint time; per-reading auth is
/// the cheap signature check in [`TokenSigner::verify_device_token`]. The
/// bcrypt comparison runs on the blocking pool so it never stalls the
/// request executor.
pub async fn authenticate_device(
    pool: &PgPool,
    device_id: i64,
    device_key: &str,
) -> Result<Device> {
    let device = db::get_device(pool, device_id)
        .await?
        .ok_or(Error::NotFound)?;

    let hashed = device.hashed_device_key.clone();
    let key = device_key.to_string();
    let matches = tokio::task::spawn_blocking(move || bcrypt::verify(key, &hashed)).await??;

    if !matches {
        return Err(Error::InvalidCredential);
    }

    if !device.is_active {
        return Err(Error::Inactive);
    }

    Ok(device)
}

/// Human-user login check. Missing user and wrong password collapse into
/// the same error so the response does not leak which accounts exist.
pub async fn authenticate_user(pool: &PgPool, username: &str, password: &str) -> Result<i64> {
    let user = db::get_user_by_username(pool, username)
        .await?
        .ok_or(Error::InvalidCredential)?;

    let hashed = user.hashed_password.clone();
    let password = password.to_string();
    let matches = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hashed)).await??;

    if !matches {
        return Err(Error::InvalidCredential);
    }

    Ok(user.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new("test-secret", Algorithm::HS256, 15)
    }

    #[test]
    fn test_mint_verify_roundtrip() {
        let signer = signer();
        let token = signer.mint_device_token(7).unwrap();
        assert_eq!(signer.verify_device_token(&token).unwrap(), 7);
    }

    #[test]
    fn test_expired_token_rejected() {
        let signer = TokenSigner::new("test-secret", Algorithm::HS256, -1);
        let token = signer.mint_device_token(7).unwrap();
        assert!(matches!(
            signer.verify_device_token(&token),
            Err(Error::InvalidToken)
        ));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = signer().mint_device_token(7).unwrap();
        let other = TokenSigner::new("other-secret", Algorithm::HS256, 15);
        assert!(other.verify_device_token(&token).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        assert!(signer().verify_device_token("not.a.jwt").is_err());
        assert!(signer().verify_device_token("").is_err());
    }

    #[test]
    fn test_user_token_is_not_a_device_token() {
        let signer = signer();
        let token = signer.mint_user_token(3).unwrap();
        assert!(signer.verify_device_token(&token).is_err());
        assert_eq!(signer.verify_user_token(&token).unwrap(), 3);
    }

    #[test]
    fn test_device_token_is_not_a_user_token() {
        let signer = signer();
        let token = signer.mint_device_token(7).unwrap();
        assert!(signer.verify_user_token(&token).is_err());
    }

    #[test]
    fn test_hash_device_key_verifies() {
        let hashed = hash_device_key("abc").unwrap();
        assert_ne!(hashed, "abc");
        assert!(bcrypt::verify("abc", &hashed).unwrap());
        assert!(!bcrypt::verify("wrong", &hashed).unwrap());
    }
}
