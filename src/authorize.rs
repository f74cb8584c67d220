use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use url::Url;

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::pkce::{self, PkcePair};
use crate::types::{Nonce, StateToken};

/// Pre-redirect context, persisted before navigating to the provider and read back
/// when the callback arrives.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct AuthorizationState {
    pub state: StateToken,
    pub nonce: Nonce,
    pub code_verifier: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub return_path: Option<String>,
    /// The URL handed to the caller; returned again while this flow is pending.
    pub authorization_url: Url,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl AuthorizationState {
    /// Whether this pending flow is older than `ttl`.
    #[must_use]
    pub fn is_stale(&self, ttl: std::time::Duration, now: OffsetDateTime) -> bool {
        let ttl = time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX);
        now - self.created_at >= ttl
    }
}

impl std::fmt::Debug for AuthorizationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationState")
            .field("state", &self.state)
            .field("scopes", &self.scopes)
            .field("return_path", &self.return_path)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// A ready-to-follow authorization request and the state to persist for it.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: AuthorizationState,
}

impl AuthorizationRequest {
    /// Generates PKCE, `state` and `nonce` from the OS random source and builds the URL.
    ///
    /// The caller must persist `state` before navigating.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RandomSource`] if secure randomness is unavailable.
    pub fn prepare(
        config: &AuthConfig,
        scopes: &[String],
        return_path: Option<String>,
    ) -> Result<Self, AuthError> {
        let pkce = PkcePair::generate()?;
        let state = pkce::generate_state()?;
        let nonce = pkce::generate_nonce()?;
        let url = build_authorization_url(config, &pkce, &state, &nonce, scopes);

        Ok(Self {
            state: AuthorizationState {
                state,
                nonce,
                code_verifier: pkce.verifier,
                scopes: scopes.to_vec(),
                return_path,
                authorization_url: url.clone(),
                created_at: OffsetDateTime::now_utc(),
            },
            url,
        })
    }
}

/// Builds the authorization endpoint URL. Pure over its inputs.
#[must_use]
pub fn build_authorization_url(
    config: &AuthConfig,
    pkce: &PkcePair,
    state: &StateToken,
    nonce: &Nonce,
    scopes: &[String],
) -> Url {
    let scope = scopes.join(" ");
    let mut url = config.endpoints.authorization.clone();
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &config.client_id)
        .append_pair("redirect_uri", config.redirect_uri.as_str())
        .append_pair("scope", &scope)
        .append_pair("state", state.as_str())
        .append_pair("nonce", nonce.as_str())
        .append_pair("code_challenge", &pkce.challenge)
        .append_pair("code_challenge_method", "S256");
    url
}

/// Builds the provider's end-session (logout) URL.
#[must_use]
pub fn build_logout_url(config: &AuthConfig, id_token_hint: Option<&str>) -> Url {
    let mut url = config.endpoints.end_session.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("client_id", &config.client_id);
        if let Some(hint) = id_token_hint {
            query.append_pair("id_token_hint", hint);
        }
        query
            .append_pair(
                "post_logout_redirect_uri",
                config.sign_out_redirect_url().as_str(),
            )
            .append_pair("state", "sign_out_success");
    }
    url
}
