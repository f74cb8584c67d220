use std::time::Duration;

use time::OffsetDateTime;

use crate::error::AuthError;
use crate::id_token::IdTokenValidator;
use crate::oauth::OAuthClient;
use crate::types::TokenSet;

/// Renews tokens ahead of expiry with the `refresh_token` grant.
pub struct TokenRefresher<'a> {
    client: &'a OAuthClient,
    validator: &'a IdTokenValidator,
    margin: Duration,
}

impl<'a> TokenRefresher<'a> {
    #[must_use]
    pub fn new(client: &'a OAuthClient, validator: &'a IdTokenValidator, margin: Duration) -> Self {
        Self {
            client,
            validator,
            margin,
        }
    }

    /// Whether `tokens` expire within the margin of `now`.
    #[must_use]
    pub fn needs_refresh(&self, tokens: &TokenSet, now: OffsetDateTime) -> bool {
        tokens.expires_at - now <= self.margin()
    }

    /// How long until `tokens` become due for refresh (zero if already due).
    #[must_use]
    pub fn due_in(&self, tokens: &TokenSet, now: OffsetDateTime) -> Duration {
        let remaining = tokens.expires_at - now - self.margin();
        Duration::try_from(remaining).unwrap_or(Duration::ZERO)
    }

    fn margin(&self) -> time::Duration {
        time::Duration::try_from(self.margin).unwrap_or(time::Duration::MAX)
    }

    /// Refresh `current`. A response without a new refresh token keeps the old one.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotAuthenticated`] if there is no refresh token; otherwise errors
    /// from the token endpoint or ID token validation.
    pub async fn refresh(&self, current: &TokenSet) -> Result<TokenSet, AuthError> {
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or(AuthError::NotAuthenticated)?;

        let issued_at = OffsetDateTime::now_utc();
        let response = self.client.refresh(refresh_token).await?;
        let mut tokens = response.into_token_set(issued_at)?;

        if let Some(id_token) = tokens.id_token.as_deref() {
            if self.client.config().validates_id_token() {
                self.validator.validate(id_token, None).await?;
            }
        }

        if tokens.refresh_token.is_none() {
            tokens.refresh_token = current.refresh_token.clone();
        }
        if tokens.id_token.is_none() {
            tokens.id_token = current.id_token.clone();
        }
        if tokens.scope.is_none() {
            tokens.scope = current.scope.clone();
        }

        tracing::info!(expires_at = %tokens.expires_at, "Tokens refreshed");
        Ok(tokens)
    }
}
