//! JWKS caching for RS256-family ID token signatures.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;

use crate::error::AuthError;
use crate::oauth::{ensure_success, transport_error};

/// A JWK as published by the provider. Only RSA signing keys are kept.
#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kty: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(rename = "use", default)]
    use_: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwkSet {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone)]
struct RsaComponents {
    n: String,
    e: String,
}

struct CacheState {
    keys: HashMap<String, RsaComponents>,
    fetched_at: Option<Instant>,
}

/// Signing keys fetched from the provider's JWKS endpoint.
///
/// Keys are fetched lazily, and re-fetched when the TTL elapses or an unknown `kid`
/// shows up (key rotation).
pub struct JwksCache {
    http: reqwest::Client,
    uri: Url,
    ttl: Duration,
    timeout: Duration,
    state: RwLock<CacheState>,
}

impl JwksCache {
    #[must_use]
    pub fn new(http: reqwest::Client, uri: Url, ttl: Duration, timeout: Duration) -> Self {
        Self {
            http,
            uri,
            ttl,
            timeout,
            state: RwLock::new(CacheState {
                keys: HashMap::new(),
                fetched_at: None,
            }),
        }
    }

    /// Get the decoding key for `kid`, refreshing the cache if it is stale or missing the key.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenValidation`] if no key matches. Fetch failures are reported as
    /// [`AuthError::Timeout`] or [`AuthError::TokenExchange`].
    pub async fn get(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        let fresh = {
            let state = self.state.read().await;
            let fresh = state
                .fetched_at
                .is_some_and(|at| at.elapsed() < self.ttl);
            if fresh {
                if let Some(key) = lookup(&state.keys, kid) {
                    return to_decoding_key(&key);
                }
            }
            fresh
        };

        if !fresh || kid.is_some() {
            self.fetch_and_store().await?;
        }

        let state = self.state.read().await;
        match lookup(&state.keys, kid) {
            Some(key) => to_decoding_key(&key),
            None => Err(AuthError::TokenValidation(format!(
                "no signing key for kid {}",
                kid.unwrap_or("<none>")
            ))),
        }
    }

    async fn fetch_and_store(&self) -> Result<(), AuthError> {
        const OPERATION: &str = "JWKS fetch";
        let response = self
            .http
            .get(self.uri.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, OPERATION, self.timeout))?;
        let response = ensure_success(response, OPERATION).await?;
        let set: JwkSet = response
            .json()
            .await
            .map_err(|e| transport_error(e, OPERATION, self.timeout))?;

        let keys: HashMap<String, RsaComponents> = set
            .keys
            .into_iter()
            .filter(|k| k.kty == "RSA" && k.use_.as_deref().is_none_or(|u| u == "sig"))
            .filter_map(|k| match (k.n, k.e) {
                (Some(n), Some(e)) => Some((k.kid.unwrap_or_default(), RsaComponents { n, e })),
                _ => None,
            })
            .collect();

        tracing::debug!(uri = %self.uri, keys = keys.len(), "JWKS refreshed");

        let mut state = self.state.write().await;
        state.keys = keys;
        state.fetched_at = Some(Instant::now());
        Ok(())
    }
}

/// Without a `kid`, a single published key is unambiguous.
fn lookup(keys: &HashMap<String, RsaComponents>, kid: Option<&str>) -> Option<RsaComponents> {
    match kid {
        Some(kid) => keys.get(kid).cloned(),
        None if keys.len() == 1 => keys.values().next().cloned(),
        None => None,
    }
}

fn to_decoding_key(key: &RsaComponents) -> Result<DecodingKey, AuthError> {
    DecodingKey::from_rsa_components(&key.n, &key.e)
        .map_err(|e| AuthError::TokenValidation(format!("invalid JWK: {e}")))
}
