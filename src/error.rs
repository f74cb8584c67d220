use std::time::Duration;

/// Errors surfaced by the authentication client.
///
/// `Clone` because one initialization outcome is shared by every caller that awaits it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Missing or invalid configuration (e.g. empty client ID). Raised before any network call.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The `state` returned by the provider does not match the pending request.
    #[error("State mismatch: the authorization response does not belong to a pending sign-in")]
    StateMismatch,

    /// The authorization response was already consumed.
    #[error("Authorization response already processed")]
    CallbackReplayed,

    /// The provider (or the user) declined the authorization request.
    #[error("Authorization denied: {error}{}", .description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    /// The callback carried neither a code nor an error.
    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    /// Token or userinfo endpoint failure.
    #[error("OAuth2 {operation} failed{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    TokenExchange {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
        retryable: bool,
    },

    /// A network call exceeded its time budget.
    #[error("OAuth2 {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// ID token signature or claims did not validate.
    #[error("ID token validation error: {0}")]
    TokenValidation(String),

    /// An authenticated-only operation was called without a session.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Session storage read or write failed.
    #[error("Session storage error: {0}")]
    Storage(String),

    /// The operating system random source is unavailable.
    #[error("Secure random source unavailable: {0}")]
    RandomSource(String),
}

impl AuthError {
    /// Whether repeating the same request may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::TokenExchange { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        Self::Storage(e.to_string())
    }
}
