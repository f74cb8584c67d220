use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::jwks::JwksCache;

/// Where ID token signing keys come from.
pub enum KeySource {
    /// Provider JWKS endpoint (RSA keys, `RS*`/`PS*` algorithms).
    Jwks(JwksCache),
    /// A fixed key and algorithm, e.g. a shared secret for HS256.
    Static {
        key: DecodingKey,
        algorithm: Algorithm,
    },
}

/// `aud` may be a single string or an array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RequiredClaims {
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    aud: Option<Audience>,
    #[serde(default)]
    azp: Option<String>,
}

/// Claims of a validated ID token.
#[derive(Debug, Clone)]
pub struct IdTokenClaims {
    inner: serde_json::Map<String, JsonValue>,
}

impl IdTokenClaims {
    /// Gets a claim value by key.
    #[must_use]
    pub fn get_claim(&self, key: &str) -> Option<&JsonValue> {
        self.inner.get(key)
    }

    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.inner.get("sub").and_then(JsonValue::as_str)
    }

    #[must_use]
    pub fn as_map(&self) -> &serde_json::Map<String, JsonValue> {
        &self.inner
    }

    #[must_use]
    pub fn into_map(self) -> serde_json::Map<String, JsonValue> {
        self.inner
    }
}

/// Validates ID token signature and the `iss`, `aud`, `exp` and `nonce` claims.
pub struct IdTokenValidator {
    issuer: String,
    client_id: String,
    leeway_secs: u64,
    keys: KeySource,
}

impl IdTokenValidator {
    #[must_use]
    pub fn new(config: &AuthConfig, keys: KeySource) -> Self {
        Self {
            issuer: config.endpoints.issuer.clone(),
            client_id: config.client_id.clone(),
            leeway_secs: config.clock_tolerance.as_secs(),
            keys,
        }
    }

    /// Verifies `token` and returns its claims.
    ///
    /// `expected_nonce` is checked when present (authorization code flow); refreshed
    /// ID tokens carry no nonce.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenValidation`] on a bad signature, wrong issuer or audience,
    /// expiry, or nonce mismatch.
    pub async fn validate(
        &self,
        token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<IdTokenClaims, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::TokenValidation(format!("malformed header: {e}")))?;

        let (key, algorithm) = match &self.keys {
            KeySource::Static { key, algorithm } => {
                if header.alg != *algorithm {
                    return Err(AuthError::TokenValidation(format!(
                        "unexpected algorithm {:?}",
                        header.alg
                    )));
                }
                (key.clone(), *algorithm)
            }
            KeySource::Jwks(cache) => {
                if !is_rsa(header.alg) {
                    return Err(AuthError::TokenValidation(format!(
                        "unsupported algorithm {:?}",
                        header.alg
                    )));
                }
                (cache.get(header.kid.as_deref()).await?, header.alg)
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.client_id.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = self.leeway_secs;

        let data = jsonwebtoken::decode::<serde_json::Map<String, JsonValue>>(
            token,
            &key,
            &validation,
        )
        .map_err(|e| AuthError::TokenValidation(e.to_string()))?;

        let required: RequiredClaims = serde_json::from_value(JsonValue::Object(data.claims.clone()))
            .map_err(|e| AuthError::TokenValidation(e.to_string()))?;

        // With several audiences, `azp` must name this client (OIDC Core 3.1.3.7).
        if let Some(Audience::Many(auds)) = &required.aud {
            if auds.len() > 1 && required.azp.as_deref() != Some(self.client_id.as_str()) {
                return Err(AuthError::TokenValidation("azp does not match client".into()));
            }
        }

        if let Some(expected) = expected_nonce {
            match required.nonce.as_deref() {
                Some(actual) if actual == expected => {}
                Some(_) => return Err(AuthError::TokenValidation("nonce mismatch".into())),
                None => return Err(AuthError::TokenValidation("missing claim: nonce".into())),
            }
        }

        Ok(IdTokenClaims { inner: data.claims })
    }
}

fn is_rsa(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
    )
}

/// Reads ID token claims without verifying the signature.
///
/// Only for tokens that were validated when they were stored.
///
/// # Errors
///
/// Returns [`AuthError::TokenValidation`] if the token is not a decodable JWT.
pub fn decode_unverified(token: &str) -> Result<IdTokenClaims, AuthError> {
    let header = jsonwebtoken::decode_header(token)
        .map_err(|e| AuthError::TokenValidation(format!("malformed header: {e}")))?;
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<serde_json::Map<String, JsonValue>>(
        token,
        &DecodingKey::from_secret(&[]),
        &validation,
    )
    .map(|data| IdTokenClaims { inner: data.claims })
    .map_err(|e| AuthError::TokenValidation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    use super::*;

    const SECRET: &[u8] = b"unit-test-secret";

    fn test_config() -> AuthConfig {
        AuthConfig::new(
            "test-client",
            "https://idp.example.com".parse().unwrap(),
            "https://app.example.com/".parse().unwrap(),
        )
        .unwrap()
    }

    fn validator() -> IdTokenValidator {
        IdTokenValidator::new(
            &test_config(),
            KeySource::Static {
                key: DecodingKey::from_secret(SECRET),
                algorithm: Algorithm::HS256,
            },
        )
    }

    fn now() -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp()
    }

    fn sign(claims: &JsonValue) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn good_claims() -> JsonValue {
        json!({
            "iss": "https://idp.example.com/oauth2/token",
            "aud": "test-client",
            "sub": "user-1",
            "exp": now() + 3600,
            "iat": now(),
            "nonce": "n-1",
            "username": "jane",
        })
    }

    #[tokio::test]
    async fn accepts_valid_token() {
        let claims = validator()
            .validate(&sign(&good_claims()), Some("n-1"))
            .await
            .unwrap();
        assert_eq!(claims.subject(), Some("user-1"));
        assert_eq!(claims.get_claim("username"), Some(&json!("jane")));
    }

    #[tokio::test]
    async fn rejects_nonce_mismatch() {
        let err = validator()
            .validate(&sign(&good_claims()), Some("other"))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::TokenValidation("nonce mismatch".into()));
    }

    #[tokio::test]
    async fn refreshed_token_needs_no_nonce() {
        let mut claims = good_claims();
        claims.as_object_mut().unwrap().remove("nonce");
        assert!(validator().validate(&sign(&claims), None).await.is_ok());
        assert!(validator().validate(&sign(&claims), Some("n-1")).await.is_err());
    }

    #[tokio::test]
    async fn rejects_wrong_issuer_and_audience() {
        let mut claims = good_claims();
        claims["iss"] = json!("https://evil.example.com");
        assert!(validator().validate(&sign(&claims), Some("n-1")).await.is_err());

        let mut claims = good_claims();
        claims["aud"] = json!("someone-else");
        assert!(validator().validate(&sign(&claims), Some("n-1")).await.is_err());
    }

    #[tokio::test]
    async fn rejects_expired_token_beyond_leeway() {
        let mut claims = good_claims();
        claims["exp"] = json!(now() - 3600);
        assert!(matches!(
            validator().validate(&sign(&claims), Some("n-1")).await,
            Err(AuthError::TokenValidation(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &good_claims(),
            &EncodingKey::from_secret(b"wrong-secret"),
        )
        .unwrap();
        assert!(validator().validate(&token, Some("n-1")).await.is_err());
    }

    #[tokio::test]
    async fn multiple_audiences_require_azp() {
        let mut claims = good_claims();
        claims["aud"] = json!(["test-client", "other"]);
        assert!(validator().validate(&sign(&claims), Some("n-1")).await.is_err());

        claims["azp"] = json!("test-client");
        assert!(validator().validate(&sign(&claims), Some("n-1")).await.is_ok());
    }

    #[test]
    fn decode_unverified_reads_claims() {
        let mut claims = good_claims();
        claims["exp"] = json!(now() - 3600);
        let decoded = decode_unverified(&sign(&claims)).unwrap();
        assert_eq!(decoded.subject(), Some("user-1"));
        assert!(decode_unverified("not-a-jwt").is_err());
    }
}
