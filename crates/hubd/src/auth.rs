//! Bearer-token verification.
//!
//! The hub consumes a single contract: given the token from the upgrade
//! URL, either produce the token's claims or a rejection reason. The
//! production implementation verifies RS256 JWTs against the public key
//! published by the auth server; the key is cached and refreshed when a
//! token fails to verify, so an auth-server key rotation does not strand
//! clients for longer than one round trip.

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

const KEY_CACHE_TTL: Duration = Duration::from_secs(60);
const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a token was rejected.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The token's `exp` is in the past.
    #[error("token expired")]
    Expired,
    /// Signature, structure, or claim validation failed.
    #[error("token invalid: {0}")]
    Invalid(String),
    /// The verification key could not be fetched or parsed.
    #[error("verification key unavailable: {0}")]
    KeyUnavailable(String),
}

/// Claims the hub reads from a verified token. Unknown claims are
/// ignored for forward compatibility.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Token subject; used for logging only.
    pub sub: String,
    /// Expiry as a unix timestamp. Checked during verification.
    pub exp: u64,
}

/// The token-verification contract consumed by the connection handler.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token, producing its claims or a rejection.
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

#[derive(Deserialize)]
struct PublicKeyResponse {
    public_key: String,
}

struct CachedKey {
    pem: String,
    key: DecodingKey,
    fetched_at: Instant,
}

/// RS256 JWT verifier backed by the auth server's published public key.
pub struct JwtVerifier {
    http: Client,
    key_url: String,
    cache: Mutex<Option<CachedKey>>,
}

/// Only http/https with a host component are accepted.
fn validate_auth_url(url: &str) -> anyhow::Result<()> {
    let parsed = url.parse::<reqwest::Url>()?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        anyhow::bail!("auth URL scheme must be http or https, got: {}", scheme);
    }

    if parsed.host_str().is_none() {
        anyhow::bail!("auth URL must have a host");
    }

    Ok(())
}

fn decode_claims(token: &str, key: &DecodingKey) -> Result<Claims, AuthError> {
    let validation = Validation::new(Algorithm::RS256);
    match decode::<Claims>(token, key, &validation) {
        Ok(data) => Ok(data.claims),
        Err(e) => match e.kind() {
            ErrorKind::ExpiredSignature => Err(AuthError::Expired),
            _ => Err(AuthError::Invalid(e.to_string())),
        },
    }
}

impl JwtVerifier {
    /// # Errors
    ///
    /// Returns an error if `auth_url` is not a usable http(s) URL or the
    /// HTTP client cannot be constructed.
    pub fn new(auth_url: &str) -> anyhow::Result<Self> {
        validate_auth_url(auth_url)?;
        let http = Client::builder().timeout(KEY_FETCH_TIMEOUT).build()?;
        Ok(Self {
            http,
            key_url: format!("{}/public_key", auth_url.trim_end_matches('/')),
            cache: Mutex::new(None),
        })
    }

    /// Return the cached decoding key, fetching from the auth server when
    /// the cache is cold, stale, or a forced refresh is requested.
    async fn public_key(&self, force_refresh: bool) -> Result<(String, DecodingKey), AuthError> {
        if !force_refresh {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < KEY_CACHE_TTL {
                    return Ok((cached.pem.clone(), cached.key.clone()));
                }
            }
        }

        let resp = self
            .http
            .get(&self.key_url)
            .send()
            .await
            .map_err(|e| AuthError::KeyUnavailable(e.to_string()))?;
        let body: PublicKeyResponse = resp
            .error_for_status()
            .map_err(|e| AuthError::KeyUnavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| AuthError::KeyUnavailable(e.to_string()))?;

        let key = DecodingKey::from_rsa_pem(body.public_key.as_bytes())
            .map_err(|e| AuthError::KeyUnavailable(format!("bad public key pem: {e}")))?;

        let mut cache = self.cache.lock().await;
        *cache = Some(CachedKey {
            pem: body.public_key.clone(),
            key: key.clone(),
            fetched_at: Instant::now(),
        });
        Ok((body.public_key, key))
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let (pem, key) = self.public_key(false).await?;
        match decode_claims(token, &key) {
            Ok(claims) => Ok(claims),
            Err(AuthError::Expired) => Err(AuthError::Expired),
            Err(first_err) => {
                // The auth server may have rotated its key; refresh once
                // and retry only if the key actually changed.
                let (new_pem, new_key) = self.public_key(true).await?;
                if new_pem == pem {
                    return Err(first_err);
                }
                decode_claims(token, &new_key)
            }
        }
    }
}
