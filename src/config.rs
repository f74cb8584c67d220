use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::AuthError;
use crate::well_known::ProviderMetadata;

/// Retry policy for token endpoint calls: exponential backoff, bounded attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

/// Provider endpoints. Derived from the server origin unless overridden.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Endpoints {
    pub authorization: Url,
    pub token: Url,
    pub userinfo: Url,
    pub jwks: Url,
    pub revocation: Url,
    pub end_session: Url,
    pub issuer: String,
}

impl Endpoints {
    fn from_origin(origin: &Url) -> Result<Self, AuthError> {
        // Paths are appended so tenant-scoped origins (`/t/{tenant}`) are preserved.
        let base = origin.as_str().trim_end_matches('/');
        let join = |path: &str| {
            format!("{base}{path}")
                .parse::<Url>()
                .map_err(|e| AuthError::Configuration(format!("serverOrigin: {e}")))
        };
        let token = join("/oauth2/token")?;
        Ok(Self {
            authorization: join("/oauth2/authorize")?,
            issuer: token.as_str().to_owned(),
            token,
            userinfo: join("/oauth2/userinfo")?,
            jwks: join("/oauth2/jwks")?,
            revocation: join("/oauth2/revoke")?,
            end_session: join("/oidc/logout")?,
        })
    }
}

/// OpenID Connect client configuration.
///
/// Required fields are constructor parameters; optional ones use `with_*` methods.
///
/// ```rust,ignore
/// use spa_auth::AuthConfig;
///
/// let config = AuthConfig::new(
///     "my-client-id",
///     "https://api.asgardeo.io/t/acme".parse()?,
///     "https://my-app.com/".parse()?,
/// )?
/// .with_scopes(vec!["openid".into(), "profile".into()]);
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthConfig {
    pub(crate) client_id: String,
    pub(crate) server_origin: Url,
    pub(crate) redirect_uri: Url,
    pub(crate) sign_out_redirect_url: Option<Url>,
    pub(crate) scopes: Vec<String>,
    pub(crate) endpoints: Endpoints,
    pub(crate) validate_id_token: bool,
    pub(crate) clock_tolerance: Duration,
    pub(crate) refresh_margin: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) authorization_state_ttl: Duration,
}

impl AuthConfig {
    /// Create a configuration with default endpoints under `server_origin`.
    ///
    /// An empty `client_id` is accepted here so it can be reported to the user;
    /// [`validate`](Self::validate) rejects it.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] if endpoint URLs cannot be derived from the origin.
    pub fn new(
        client_id: impl Into<String>,
        server_origin: Url,
        redirect_uri: Url,
    ) -> Result<Self, AuthError> {
        let endpoints = Endpoints::from_origin(&server_origin)?;
        Ok(Self {
            client_id: client_id.into(),
            server_origin,
            redirect_uri,
            sign_out_redirect_url: None,
            scopes: vec!["openid".into(), "profile".into()],
            endpoints,
            validate_id_token: true,
            clock_tolerance: Duration::from_secs(300),
            refresh_margin: Duration::from_secs(60),
            request_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            authorization_state_ttl: Duration::from_secs(600),
        })
    }

    /// Parse the JSON configuration file shape used by browser samples:
    ///
    /// ```json
    /// { "clientID": "", "serverOrigin": "https://api.asgardeo.io/t/acme",
    ///   "signInRedirectURL": "https://localhost:3000", "scope": ["profile"] }
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] on malformed JSON or URLs.
    pub fn from_json_str(json: &str) -> Result<Self, AuthError> {
        let raw: RawConfig = serde_json::from_str(json)
            .map_err(|e| AuthError::Configuration(format!("invalid config JSON: {e}")))?;
        raw.into_config()
    }

    /// Read and parse a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| AuthError::Configuration(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `SPA_AUTH_CLIENT_ID`: OAuth2 client ID
    /// - `SPA_AUTH_SERVER_ORIGIN`: identity provider origin
    /// - `SPA_AUTH_REDIRECT_URI`: sign-in redirect URL
    ///
    /// # Optional env vars
    /// - `SPA_AUTH_SIGN_OUT_REDIRECT_URL`: post-logout redirect
    /// - `SPA_AUTH_SCOPES`: comma-separated scopes
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] if required vars are missing or URLs are invalid.
    pub fn from_env() -> Result<Self, AuthError> {
        let client_id = std::env::var("SPA_AUTH_CLIENT_ID")
            .map_err(|_| AuthError::Configuration("SPA_AUTH_CLIENT_ID is required".into()))?;
        let server_origin = env_url("SPA_AUTH_SERVER_ORIGIN")?
            .ok_or_else(|| AuthError::Configuration("SPA_AUTH_SERVER_ORIGIN is required".into()))?;
        let redirect_uri = env_url("SPA_AUTH_REDIRECT_URI")?
            .ok_or_else(|| AuthError::Configuration("SPA_AUTH_REDIRECT_URI is required".into()))?;

        let mut config = Self::new(client_id, server_origin, redirect_uri)?;
        if let Some(url) = env_url("SPA_AUTH_SIGN_OUT_REDIRECT_URL")? {
            config = config.with_sign_out_redirect_url(url);
        }
        if let Ok(scopes) = std::env::var("SPA_AUTH_SCOPES") {
            config = config.with_scopes(scopes.split(',').map(|s| s.trim().to_string()).collect());
        }
        Ok(config)
    }

    /// Checks the configuration before any client is built.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] for an empty client ID or a non-HTTP origin.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::Configuration("client ID is required".into()));
        }
        if !matches!(self.server_origin.scheme(), "http" | "https") {
            return Err(AuthError::Configuration(format!(
                "serverOrigin must be http(s), got '{}'",
                self.server_origin
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(AuthError::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_sign_out_redirect_url(mut self, url: Url) -> Self {
        self.sign_out_redirect_url = Some(url);
        self
    }

    /// Override the scopes. `openid` is always requested even if omitted here.
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    #[must_use]
    pub fn with_authorization_endpoint(mut self, url: Url) -> Self {
        self.endpoints.authorization = url;
        self
    }

    #[must_use]
    pub fn with_token_endpoint(mut self, url: Url) -> Self {
        self.endpoints.token = url;
        self
    }

    #[must_use]
    pub fn with_userinfo_endpoint(mut self, url: Url) -> Self {
        self.endpoints.userinfo = url;
        self
    }

    #[must_use]
    pub fn with_jwks_endpoint(mut self, url: Url) -> Self {
        self.endpoints.jwks = url;
        self
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.endpoints.issuer = issuer.into();
        self
    }

    /// Apply endpoints from an OIDC discovery document.
    #[must_use]
    pub fn with_provider_metadata(mut self, metadata: &ProviderMetadata) -> Self {
        self.endpoints.issuer = metadata.issuer.clone();
        self.endpoints.authorization = metadata.authorization_endpoint.clone();
        self.endpoints.token = metadata.token_endpoint.clone();
        self.endpoints.jwks = metadata.jwks_uri.clone();
        if let Some(url) = &metadata.userinfo_endpoint {
            self.endpoints.userinfo = url.clone();
        }
        if let Some(url) = &metadata.revocation_endpoint {
            self.endpoints.revocation = url.clone();
        }
        if let Some(url) = &metadata.end_session_endpoint {
            self.endpoints.end_session = url.clone();
        }
        self
    }

    #[must_use]
    pub fn with_id_token_validation(mut self, enabled: bool) -> Self {
        self.validate_id_token = enabled;
        self
    }

    #[must_use]
    pub fn with_clock_tolerance(mut self, tolerance: Duration) -> Self {
        self.clock_tolerance = tolerance;
        self
    }

    /// How long before expiry a token counts as due for refresh.
    #[must_use]
    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }

    /// Per-request network timeout for provider calls.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// How long a pending sign-in may wait for its callback before it is discarded.
    #[must_use]
    pub fn with_authorization_state_ttl(mut self, ttl: Duration) -> Self {
        self.authorization_state_ttl = ttl;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn server_origin(&self) -> &Url {
        &self.server_origin
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Post-logout redirect, falling back to the sign-in redirect URI.
    #[must_use]
    pub fn sign_out_redirect_url(&self) -> &Url {
        self.sign_out_redirect_url
            .as_ref()
            .unwrap_or(&self.redirect_uri)
    }

    /// Requested scopes, with `openid` first.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        let mut scopes = vec!["openid".to_owned()];
        scopes.extend(self.scopes.iter().filter(|s| *s != "openid").cloned());
        scopes
    }

    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    #[must_use]
    pub fn validates_id_token(&self) -> bool {
        self.validate_id_token
    }

    #[must_use]
    pub fn clock_tolerance(&self) -> Duration {
        self.clock_tolerance
    }

    #[must_use]
    pub fn refresh_margin(&self) -> Duration {
        self.refresh_margin
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    #[must_use]
    pub fn authorization_state_ttl(&self) -> Duration {
        self.authorization_state_ttl
    }
}

fn env_url(name: &str) -> Result<Option<Url>, AuthError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| AuthError::Configuration(format!("{name}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfig {
    #[serde(rename = "clientID", default)]
    client_id: String,
    server_origin: String,
    #[serde(rename = "redirectURI", alias = "signInRedirectURL")]
    redirect_uri: String,
    #[serde(rename = "signOutRedirectURL", default)]
    sign_out_redirect_url: Option<String>,
    #[serde(default)]
    scope: Option<Vec<String>>,
    #[serde(default)]
    clock_tolerance: Option<u64>,
    #[serde(rename = "validateIDToken", default)]
    validate_id_token: Option<bool>,
    #[serde(default)]
    refresh_margin: Option<u64>,
    #[serde(default)]
    request_timeout: Option<u64>,
    #[serde(default)]
    authorization_state_ttl: Option<u64>,
}

impl RawConfig {
    fn into_config(self) -> Result<AuthConfig, AuthError> {
        let parse = |name: &str, value: &str| -> Result<Url, AuthError> {
            value
                .parse()
                .map_err(|e| AuthError::Configuration(format!("{name}: {e}")))
        };

        let mut config = AuthConfig::new(
            self.client_id,
            parse("serverOrigin", &self.server_origin)?,
            parse("redirectURI", &self.redirect_uri)?,
        )?;
        if let Some(url) = self.sign_out_redirect_url.filter(|u| !u.is_empty()) {
            config = config.with_sign_out_redirect_url(parse("signOutRedirectURL", &url)?);
        }
        if let Some(scope) = self.scope {
            config = config.with_scopes(scope);
        }
        if let Some(secs) = self.clock_tolerance {
            config = config.with_clock_tolerance(Duration::from_secs(secs));
        }
        if let Some(enabled) = self.validate_id_token {
            config = config.with_id_token_validation(enabled);
        }
        if let Some(secs) = self.refresh_margin {
            config = config.with_refresh_margin(Duration::from_secs(secs));
        }
        if let Some(secs) = self.request_timeout {
            config = config.with_request_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.authorization_state_ttl {
            config = config.with_authorization_state_ttl(Duration::from_secs(secs));
        }
        Ok(config)
    }
}
