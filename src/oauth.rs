use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::config::{AuthConfig, RetryPolicy};
use crate::error::AuthError;
use crate::types::TokenSet;
use crate::well_known::{DISCOVERY_PATH, ProviderMetadata};

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Token response from the provider's token endpoint.
#[derive(Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Converts the response into a [`TokenSet`] anchored at `issued_at`.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenExchange`] (not retryable) if `expires_in` does not fit a date.
    pub fn into_token_set(self, issued_at: OffsetDateTime) -> Result<TokenSet, AuthError> {
        let expires_in = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expires_at = i64::try_from(expires_in)
            .ok()
            .and_then(|secs| issued_at.checked_add(time::Duration::seconds(secs)))
            .ok_or_else(|| AuthError::TokenExchange {
                operation: "token response",
                status: None,
                detail: format!("expires_in out of range: {expires_in}"),
                retryable: false,
            })?;
        Ok(TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            id_token: self.id_token,
            expires_at,
            scope: self.scope,
        })
    }
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

/// HTTP client for the provider's token, userinfo, revocation and discovery endpoints.
///
/// Token endpoint calls are bounded by the configured timeout and retried with
/// exponential backoff on transport failures and 5xx responses.
#[derive(Clone)]
pub struct OAuthClient {
    config: AuthConfig,
    http: reqwest::Client,
}

impl OAuthClient {
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Exchange an authorization code for tokens using PKCE.
    ///
    /// # Errors
    ///
    /// [`AuthError::TokenExchange`] when the endpoint rejects the code or keeps failing,
    /// [`AuthError::Timeout`] when the last attempt timed out.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, AuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        self.token_request(&params, "token exchange").await
    }

    /// Obtain fresh tokens with a refresh token.
    ///
    /// # Errors
    ///
    /// Same as [`exchange_code`](Self::exchange_code).
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let scope = self.config.scopes().join(" ");
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("scope", scope.as_str()),
        ];
        self.token_request(&params, "token refresh").await
    }

    /// Fetch user claims using an access token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenExchange`] or [`AuthError::Timeout`] on failure.
    pub async fn get_user_info(
        &self,
        access_token: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AuthError> {
        const OPERATION: &str = "userinfo request";
        let response = self
            .http
            .get(self.config.endpoints.userinfo.clone())
            .bearer_auth(access_token)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e, OPERATION))?;

        let response = ensure_success(response, OPERATION).await?;
        response
            .json()
            .await
            .map_err(|e| self.transport_error(e, OPERATION))
    }

    /// Revoke an access token (RFC 7009).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenExchange`] or [`AuthError::Timeout`] on failure.
    pub async fn revoke(&self, access_token: &str) -> Result<(), AuthError> {
        const OPERATION: &str = "token revocation";
        let params = [
            ("token", access_token),
            ("client_id", self.config.client_id.as_str()),
            ("token_type_hint", "access_token"),
        ];
        let response = self
            .http
            .post(self.config.endpoints.revocation.clone())
            .form(&params)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e, OPERATION))?;
        ensure_success(response, OPERATION).await?;
        Ok(())
    }

    /// Fetch the OpenID Provider configuration document under the server origin.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenExchange`] or [`AuthError::Timeout`] on failure.
    pub async fn discover(&self) -> Result<ProviderMetadata, AuthError> {
        const OPERATION: &str = "discovery";
        let base = self.config.server_origin.as_str().trim_end_matches('/');
        let url = format!("{base}{DISCOVERY_PATH}");
        let response = self
            .http
            .get(url)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e, OPERATION))?;
        let response = ensure_success(response, OPERATION).await?;
        response
            .json()
            .await
            .map_err(|e| self.transport_error(e, OPERATION))
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
        operation: &'static str,
    ) -> Result<TokenResponse, AuthError> {
        let RetryPolicy {
            max_attempts,
            initial_backoff,
        } = self.config.retry;
        let mut attempt = 0u32;
        let mut backoff = initial_backoff;

        loop {
            attempt += 1;
            match self.token_request_once(params, operation).await {
                Ok(response) => {
                    if attempt > 1 {
                        tracing::info!(operation, attempt, "Token request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "Token request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => {
                    tracing::error!(operation, attempt, error = %err, "Token request failed");
                    return Err(err);
                }
            }
        }
    }

    async fn token_request_once(
        &self,
        params: &[(&str, &str)],
        operation: &'static str,
    ) -> Result<TokenResponse, AuthError> {
        let response = self
            .http
            .post(self.config.endpoints.token.clone())
            .form(params)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e, operation))?;

        let response = ensure_success(response, operation).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| self.transport_error(e, operation))
    }

    fn transport_error(&self, e: reqwest::Error, operation: &'static str) -> AuthError {
        transport_error(e, operation, self.config.request_timeout)
    }
}

/// Classifies a reqwest failure: timeouts become [`AuthError::Timeout`], everything else a
/// [`AuthError::TokenExchange`] that is retryable unless the body could not be decoded.
pub(crate) fn transport_error(
    e: reqwest::Error,
    operation: &'static str,
    timeout: Duration,
) -> AuthError {
    if e.is_timeout() {
        AuthError::Timeout { operation, timeout }
    } else {
        AuthError::TokenExchange {
            operation,
            status: None,
            retryable: !e.is_decode(),
            detail: e.to_string(),
        }
    }
}

/// Checks HTTP response status; returns the response on success or an error with details.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    operation: &'static str,
) -> Result<reqwest::Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AuthError::TokenExchange {
        operation,
        status: Some(status.as_u16()),
        detail: provider_error_detail(&body),
        retryable: status.is_server_error(),
    })
}

/// Extracts `error` / `error_description` from an OAuth2 error body, falling back to the raw text.
fn provider_error_detail(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
        #[serde(default)]
        error_description: Option<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error,
            error_description: Some(desc),
        }) => format!("{error}: {desc}"),
        Ok(ErrorBody { error, .. }) => error,
        Err(_) => body.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_set_defaults_expiry_to_an_hour() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"at","token_type":"Bearer"}"#).unwrap();
        let issued = OffsetDateTime::UNIX_EPOCH;
        let tokens = response.into_token_set(issued).unwrap();
        assert_eq!(tokens.expires_at, issued + time::Duration::hours(1));
        assert!(tokens.refresh_token.is_none());
    }

    #[test]
    fn token_set_keeps_all_tokens() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"at","expires_in":60,"refresh_token":"rt","id_token":"idt","scope":"openid email"}"#,
        )
        .unwrap();
        let tokens = response.into_token_set(OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(tokens.refresh_token.as_deref(), Some("rt"));
        assert_eq!(tokens.id_token.as_deref(), Some("idt"));
        assert_eq!(tokens.scope.as_deref(), Some("openid email"));
        assert_eq!(
            tokens.expires_at,
            OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(60)
        );
    }

    #[test]
    fn oversized_expires_in_is_rejected() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"at","expires_in":18446744073709551615}"#,
        )
        .unwrap();
        let err = response.into_token_set(OffsetDateTime::now_utc()).unwrap_err();
        assert!(matches!(
            err,
            AuthError::TokenExchange {
                status: None,
                retryable: false,
                ..
            }
        ));

        // Fits in i64 seconds but not in a calendar date.
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"at","expires_in":9223372036854775807}"#,
        )
        .unwrap();
        assert!(response.into_token_set(OffsetDateTime::now_utc()).is_err());
    }

    #[test]
    fn provider_error_detail_formats() {
        assert_eq!(
            provider_error_detail(r#"{"error":"invalid_grant","error_description":"code used"}"#),
            "invalid_grant: code used"
        );
        assert_eq!(provider_error_detail(r#"{"error":"invalid_grant"}"#), "invalid_grant");
        assert_eq!(provider_error_detail("Bad Gateway"), "Bad Gateway");
    }

    #[test]
    fn response_debug_hides_tokens() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"secret","refresh_token":"secret2"}"#).unwrap();
        let debug = format!("{response:?}");
        assert!(!debug.contains("secret"));
    }
}
