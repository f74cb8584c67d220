use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Anti-CSRF `state` value bound to a single authorization request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct StateToken(pub String);

impl StateToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// ID token `nonce` bound to a single authorization request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct Nonce(pub String);

impl Nonce {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Where the session state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

/// Tokens issued for an authenticated session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenSet {
    #[must_use]
    pub fn new(access_token: impl Into<String>, expires_at: OffsetDateTime) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            id_token: None,
            expires_at,
            scope: None,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_id_token(mut self, token: impl Into<String>) -> Self {
        self.id_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// True once `expires_at` is at or before `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

// Tokens never show up in logs.
impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("id_token", &self.id_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Basic identity of the signed-in user.
///
/// Built once per session from ID token claims (or the userinfo endpoint) and never
/// mutated afterwards. Empty strings and the literal `"null"` are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BasicUserInfo {
    pub sub: Option<String>,
    pub display_name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
    #[serde(default)]
    pub session_state: Option<String>,
}

impl BasicUserInfo {
    /// Derives user info from a JSON claims object.
    ///
    /// Accepts both the provider's own claim names (`displayName`, `username`) and the
    /// standard OIDC ones (`name`, `preferred_username`, `sub`).
    #[must_use]
    pub fn from_claims(claims: &serde_json::Map<String, serde_json::Value>) -> Self {
        let text = |key: &str| -> Option<String> {
            claims
                .get(key)
                .and_then(|v| v.as_str())
                .and_then(present)
        };

        let display_name = text("displayName")
            .or_else(|| text("name"))
            .or_else(|| match (text("given_name"), text("family_name")) {
                (Some(given), Some(family)) => Some(format!("{given} {family}")),
                (given, family) => given.or(family),
            });

        Self {
            sub: text("sub"),
            display_name,
            username: text("username")
                .or_else(|| text("preferred_username"))
                .or_else(|| text("sub")),
            email: text("email"),
            allowed_scopes: Vec::new(),
            session_state: None,
        }
    }

    #[must_use]
    pub fn with_allowed_scopes(mut self, scope: Option<&str>) -> Self {
        self.allowed_scopes = scope
            .map(|s| s.split_whitespace().map(str::to_owned).collect())
            .unwrap_or_default();
        self
    }

    #[must_use]
    pub fn with_session_state(mut self, session_state: Option<String>) -> Self {
        self.session_state = session_state;
        self
    }
}

fn present(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "null" {
        None
    } else {
        Some(trimmed.to_owned())
    }
}
