use time::OffsetDateTime;
use url::Url;

use crate::authorize::AuthorizationState;
use crate::error::AuthError;
use crate::id_token::IdTokenValidator;
use crate::oauth::OAuthClient;
use crate::types::{BasicUserInfo, TokenSet};

/// Parameters of the redirect back from the authorization endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub session_state: Option<String>,
}

impl CallbackParams {
    /// Parses a query string (without the leading `?`).
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                "session_state" => &mut params.session_state,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }
        params
    }

    /// Extracts callback parameters from a page URL, or `None` if the URL is not
    /// an authorization response.
    #[must_use]
    pub fn from_url(url: &Url) -> Option<Self> {
        let params = Self::from_query(url.query()?);
        params.is_authorization_response().then_some(params)
    }

    /// Carries a `code` or an `error`.
    #[must_use]
    pub fn is_authorization_response(&self) -> bool {
        self.code.is_some() || self.error.is_some()
    }
}

/// Result of a processed callback.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub tokens: TokenSet,
    pub user_info: BasicUserInfo,
    /// Carried over from the authorization state.
    pub return_path: Option<String>,
}

/// Validates the authorization response and exchanges its code for tokens.
pub struct CallbackProcessor<'a> {
    client: &'a OAuthClient,
    validator: &'a IdTokenValidator,
}

impl<'a> CallbackProcessor<'a> {
    #[must_use]
    pub fn new(client: &'a OAuthClient, validator: &'a IdTokenValidator) -> Self {
        Self { client, validator }
    }

    /// Processes a callback against the stored authorization state.
    ///
    /// The caller removes `stored` from storage before calling, so the state is
    /// destroyed whether this succeeds or fails.
    ///
    /// # Errors
    ///
    /// - [`AuthError::StateMismatch`] if `state` is missing or differs
    /// - [`AuthError::AuthorizationDenied`] if the provider returned an error
    /// - [`AuthError::InvalidCallback`] if there is no code
    /// - [`AuthError::TokenExchange`] / [`AuthError::Timeout`] from the token endpoint
    /// - [`AuthError::TokenValidation`] if the ID token does not validate
    pub async fn process(
        &self,
        params: &CallbackParams,
        stored: &AuthorizationState,
    ) -> Result<CallbackOutcome, AuthError> {
        if params.state.as_deref() != Some(stored.state.as_str()) {
            tracing::warn!("OAuth state mismatch");
            return Err(AuthError::StateMismatch);
        }

        if let Some(error) = &params.error {
            tracing::warn!(
                error = %error,
                description = params.error_description.as_deref().unwrap_or(""),
                "OAuth2 error from provider"
            );
            return Err(AuthError::AuthorizationDenied {
                error: error.clone(),
                description: params.error_description.clone(),
            });
        }

        let code = params
            .code
            .as_deref()
            .ok_or_else(|| AuthError::InvalidCallback("missing code".into()))?;

        let issued_at = OffsetDateTime::now_utc();
        let response = self
            .client
            .exchange_code(code, &stored.code_verifier)
            .await?;
        let tokens = response.into_token_set(issued_at)?;

        let claims = match tokens.id_token.as_deref() {
            Some(id_token) if self.client.config().validates_id_token() => Some(
                self.validator
                    .validate(id_token, Some(stored.nonce.as_str()))
                    .await?
                    .into_map(),
            ),
            Some(id_token) => Some(crate::id_token::decode_unverified(id_token)?.into_map()),
            None if self.client.config().validates_id_token()
                && stored.scopes.iter().any(|s| s == "openid") =>
            {
                return Err(AuthError::TokenValidation(
                    "token response has no id_token".into(),
                ));
            }
            None => None,
        };

        let claims = match claims {
            Some(claims) => claims,
            None => self.client.get_user_info(&tokens.access_token).await?,
        };

        let user_info = BasicUserInfo::from_claims(&claims)
            .with_allowed_scopes(tokens.scope.as_deref())
            .with_session_state(params.session_state.clone());

        Ok(CallbackOutcome {
            tokens,
            user_info,
            return_path: stored.return_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_response() {
        let url: Url = "https://app.example.com/?code=abc&state=xyz&session_state=ss"
            .parse()
            .unwrap();
        let params = CallbackParams::from_url(&url).unwrap();
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("xyz"));
        assert_eq!(params.session_state.as_deref(), Some("ss"));
        assert!(params.error.is_none());
    }

    #[test]
    fn parses_error_response() {
        let params = CallbackParams::from_query(
            "error=access_denied&error_description=User%20denied%20consent&state=s",
        );
        assert!(params.is_authorization_response());
        assert_eq!(params.error.as_deref(), Some("access_denied"));
        assert_eq!(params.error_description.as_deref(), Some("User denied consent"));
    }

    #[test]
    fn plain_urls_are_not_callbacks() {
        let url: Url = "https://app.example.com/home?tab=1".parse().unwrap();
        assert!(CallbackParams::from_url(&url).is_none());
        let url: Url = "https://app.example.com/".parse().unwrap();
        assert!(CallbackParams::from_url(&url).is_none());
    }
}
