use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use jsonwebtoken::{Algorithm, DecodingKey};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OnceCell};
use url::Url;

use crate::authorize::{AuthorizationRequest, build_logout_url};
use crate::callback::{CallbackParams, CallbackProcessor};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::hooks::{HookEvent, HookKind, HookRegistry};
use crate::id_token::{self, IdTokenClaims, IdTokenValidator, KeySource};
use crate::jwks::JwksCache;
use crate::oauth::OAuthClient;
use crate::refresh::TokenRefresher;
use crate::storage::SessionStorage;
use crate::token_store::{StoredSession, TokenStore};
use crate::types::{BasicUserInfo, SessionStatus, TokenSet};

const JWKS_TTL: Duration = Duration::from_secs(600);

/// Shortest pause between background refresh attempts.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Options for [`SessionManager::sign_in`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct SignInOptions {
    pub force: bool,
    pub call_only_on_redirect: bool,
    pub callback_url: Option<Url>,
    pub return_path: Option<String>,
    pub scopes: Option<Vec<String>>,
}

impl SignInOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new flow even if signed in or a flow is pending.
    #[must_use]
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Only complete a callback present in `callback_url`; never start a redirect.
    #[must_use]
    pub fn call_only_on_redirect(mut self) -> Self {
        self.call_only_on_redirect = true;
        self
    }

    /// The current page URL, checked for an authorization response.
    #[must_use]
    pub fn with_callback_url(mut self, url: Url) -> Self {
        self.callback_url = Some(url);
        self
    }

    /// Application path to return to after sign-in; kept with the authorization state.
    #[must_use]
    pub fn with_return_path(mut self, path: impl Into<String>) -> Self {
        self.return_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = Some(scopes);
        self
    }
}

/// A sign-in completed from an authorization response.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct CompletedSignIn {
    pub user: BasicUserInfo,
    /// Application path recorded with [`SignInOptions::with_return_path`] before the redirect.
    pub return_path: Option<String>,
}

/// What a call to [`SessionManager::sign_in`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    /// Navigate to this URL to continue at the provider.
    Redirect(Url),
    /// A callback was processed and the session is established.
    Completed(CompletedSignIn),
    /// Already signed in; nothing was done.
    AlreadyAuthenticated(BasicUserInfo),
    /// `call_only_on_redirect` was set and no callback was present.
    NoCallback,
}

/// Builds a [`SessionManager`]. Validates configuration without touching the network.
pub struct SessionManagerBuilder<S> {
    config: AuthConfig,
    storage: S,
    location: Option<Url>,
    http: Option<reqwest::Client>,
    keys: Option<KeySource>,
}

impl<S: SessionStorage> SessionManagerBuilder<S> {
    /// The page URL the application was (re)loaded at. A callback found here is
    /// processed during [`SessionManager::initialize`].
    #[must_use]
    pub fn with_location(mut self, url: Url) -> Self {
        self.location = Some(url);
        self
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    /// Verify ID tokens with a fixed key instead of the provider's JWKS.
    #[must_use]
    pub fn with_id_token_key(mut self, key: DecodingKey, algorithm: Algorithm) -> Self {
        self.keys = Some(KeySource::Static { key, algorithm });
        self
    }

    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] if the configuration is invalid.
    pub fn build(self) -> Result<SessionManager<S>, AuthError> {
        self.config.validate()?;

        let http = self.http.unwrap_or_default();
        let keys = self.keys.unwrap_or_else(|| {
            KeySource::Jwks(JwksCache::new(
                http.clone(),
                self.config.endpoints.jwks.clone(),
                JWKS_TTL,
                self.config.request_timeout,
            ))
        });

        Ok(SessionManager {
            validator: IdTokenValidator::new(&self.config, keys),
            client: OAuthClient::new(self.config.clone()).with_http_client(http),
            store: TokenStore::new(self.storage, &self.config.client_id),
            config: self.config,
            hooks: HookRegistry::new(),
            location: self.location,
            init: OnceCell::new(),
            in_flight: Mutex::new(()),
            return_path: StdMutex::new(None),
        })
    }
}

/// Owns one authentication session: the state machine, its tokens, and its hooks.
///
/// Construct one per application context and pass it around; there is no global
/// instance. Every operation first awaits [`initialize`](Self::initialize), so a
/// callback on the page is always handled before anything else looks at the session.
///
/// Token exchanges and refreshes run one at a time per session.
pub struct SessionManager<S> {
    config: AuthConfig,
    client: OAuthClient,
    validator: IdTokenValidator,
    store: TokenStore<S>,
    hooks: HookRegistry,
    location: Option<Url>,
    init: OnceCell<Result<Option<BasicUserInfo>, AuthError>>,
    in_flight: Mutex<()>,
    return_path: StdMutex<Option<String>>,
}

impl<S: SessionStorage> SessionManager<S> {
    pub fn builder(config: AuthConfig, storage: S) -> SessionManagerBuilder<S> {
        SessionManagerBuilder {
            config,
            storage,
            location: None,
            http: None,
            keys: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Restore the persisted session and complete any callback in the page location.
    ///
    /// Runs once; later calls (and concurrent ones) get the same outcome.
    /// `Ok(Some(user))` means a session is active after initialization.
    ///
    /// # Errors
    ///
    /// Whatever processing the page's callback failed with, or a storage error.
    pub async fn initialize(&self) -> Result<Option<BasicUserInfo>, AuthError> {
        self.init.get_or_init(|| self.bootstrap()).await.clone()
    }

    async fn bootstrap(&self) -> Result<Option<BasicUserInfo>, AuthError> {
        self.store.load().await?;

        let outcome = match self.location.as_ref().and_then(CallbackParams::from_url) {
            Some(params) => {
                let nothing_pending = self.store.pending_authorization_state().await.is_none();
                match self.authenticated_user().await {
                    // A reload that still carries an already handled response.
                    Some(user) if nothing_pending => {
                        tracing::debug!("Ignoring handled authorization response in page location");
                        Ok(Some(user))
                    }
                    _ => {
                        tracing::debug!("Authorization response found in page location");
                        self.complete_callback(params).await.map(|done| Some(done.user))
                    }
                }
            }
            None => Ok(self.authenticated_user().await),
        };

        let authenticated = self.is_authenticated_now().await;
        tracing::debug!(authenticated, "Session initialized");
        self.hooks.fire(&HookEvent::Initialize { authenticated });
        outcome
    }

    /// Return path of the most recently completed sign-in, if one was recorded.
    ///
    /// Covers callbacks handled by [`initialize`](Self::initialize) as well as explicit ones.
    pub fn take_return_path(&self) -> Option<String> {
        self.return_path
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Register a hook handler. Handlers of one kind run in registration order.
    pub fn on<F>(&self, kind: HookKind, handler: F)
    where
        F: Fn(&HookEvent<'_>) + Send + Sync + 'static,
    {
        self.hooks.on(kind, handler);
    }

    /// Start or continue signing in.
    ///
    /// # Errors
    ///
    /// Callback processing errors when a callback is present, storage errors, or
    /// [`AuthError::RandomSource`].
    pub async fn sign_in(&self, options: SignInOptions) -> Result<SignInOutcome, AuthError> {
        if let Err(e) = self.initialize().await {
            tracing::debug!(error = %e, "Initialization reported an error; continuing sign-in");
        }

        if !options.force {
            if let Some(user) = self.authenticated_user().await {
                return Ok(SignInOutcome::AlreadyAuthenticated(user));
            }
        }

        if let Some(params) = options.callback_url.as_ref().and_then(CallbackParams::from_url) {
            return self
                .complete_callback(params)
                .await
                .map(SignInOutcome::Completed);
        }

        if options.call_only_on_redirect {
            return Ok(SignInOutcome::NoCallback);
        }

        let _guard = self.in_flight.lock().await;

        if !options.force {
            if let Some(pending) = self.store.pending_authorization_state().await {
                let ttl = self.config.authorization_state_ttl;
                if !pending.is_stale(ttl, OffsetDateTime::now_utc()) {
                    tracing::debug!("Sign-in already pending; reusing its authorization request");
                    return Ok(SignInOutcome::Redirect(pending.authorization_url));
                }
            }
        }

        // Tokens exist only while Authenticated.
        if self.store.clear_session().await?.is_some() {
            tracing::info!("Discarded previous session before a new sign-in");
            self.hooks.fire(&HookEvent::SignOut);
        }

        let scopes = options.scopes.unwrap_or_else(|| self.config.scopes());
        let request = AuthorizationRequest::prepare(&self.config, &scopes, options.return_path)?;
        self.store.save_authorization_state(&request.state).await?;

        tracing::info!(scope = %scopes.join(" "), "Redirecting to authorization endpoint");
        Ok(SignInOutcome::Redirect(request.url))
    }

    /// Complete an authorization response delivered to `url`.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidCallback`] if `url` carries no authorization response;
    /// [`AuthError::CallbackReplayed`] if it was already processed; otherwise as
    /// [`CallbackProcessor::process`].
    pub async fn handle_redirect(&self, url: &Url) -> Result<CompletedSignIn, AuthError> {
        let params = CallbackParams::from_url(url)
            .ok_or_else(|| AuthError::InvalidCallback("no authorization response in URL".into()))?;
        if let Err(e) = self.initialize().await {
            tracing::debug!(error = %e, "Initialization reported an error");
        }
        self.complete_callback(params).await
    }

    async fn complete_callback(&self, params: CallbackParams) -> Result<CompletedSignIn, AuthError> {
        let _guard = self.in_flight.lock().await;

        let Some(pending) = self.store.take_authorization_state().await? else {
            let replayed = match params.state.as_deref() {
                Some(state) => self.store.was_consumed(state).await,
                None => false,
            };
            tracing::warn!(replayed, "Authorization response without a pending sign-in");
            return Err(if replayed {
                AuthError::CallbackReplayed
            } else {
                AuthError::StateMismatch
            });
        };

        let processor = CallbackProcessor::new(&self.client, &self.validator);
        let outcome = match processor.process(&params, &pending).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "Sign-in callback failed");
                return Err(e);
            }
        };

        let user = outcome.user_info.clone();
        self.store
            .store_session(StoredSession {
                tokens: outcome.tokens,
                user_info: outcome.user_info,
            })
            .await?;

        *self.return_path.lock().unwrap_or_else(PoisonError::into_inner) =
            outcome.return_path.clone();

        tracing::info!(username = user.username.as_deref().unwrap_or(""), "Sign-in completed");
        self.hooks.fire(&HookEvent::SignIn(&user));
        Ok(CompletedSignIn {
            user,
            return_path: outcome.return_path,
        })
    }

    /// End the session and return the provider logout URL to navigate to.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the session cannot be cleared.
    pub async fn sign_out(&self) -> Result<Url, AuthError> {
        if let Err(e) = self.initialize().await {
            tracing::debug!(error = %e, "Initialization reported an error");
        }

        let removed = self.store.clear_session().await?;
        self.store.discard_authorization_state().await?;

        let id_token_hint = removed.as_ref().and_then(|s| s.tokens.id_token.as_deref());
        let url = build_logout_url(&self.config, id_token_hint);

        tracing::info!(had_session = removed.is_some(), "Signed out");
        self.hooks.fire(&HookEvent::SignOut);
        Ok(url)
    }

    /// True iff a session exists and its access token has not expired.
    ///
    /// Does not refresh or otherwise change the session.
    pub async fn is_authenticated(&self) -> bool {
        let _ = self.initialize().await;
        self.is_authenticated_now().await
    }

    pub async fn status(&self) -> SessionStatus {
        let _ = self.initialize().await;
        if self.store.has_session().await {
            SessionStatus::Authenticated
        } else if self.store.pending_authorization_state().await.is_some() {
            SessionStatus::Authenticating
        } else {
            SessionStatus::Unauthenticated
        }
    }

    /// # Errors
    ///
    /// Returns [`AuthError::NotAuthenticated`] without a session.
    pub async fn get_basic_user_info(&self) -> Result<BasicUserInfo, AuthError> {
        let _ = self.initialize().await;
        self.store.user_info().await.ok_or(AuthError::NotAuthenticated)
    }

    /// Claims of the stored ID token.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotAuthenticated`] without a session or ID token.
    pub async fn get_decoded_id_token(&self) -> Result<IdTokenClaims, AuthError> {
        let _ = self.initialize().await;
        let tokens = self.store.tokens().await.ok_or(AuthError::NotAuthenticated)?;
        let id_token = tokens.id_token.as_deref().ok_or(AuthError::NotAuthenticated)?;
        id_token::decode_unverified(id_token)
    }

    /// A usable access token, refreshed first if it is close to expiry.
    ///
    /// # Errors
    ///
    /// As [`ensure_fresh`](Self::ensure_fresh).
    pub async fn get_access_token(&self) -> Result<String, AuthError> {
        self.ensure_fresh().await.map(|t| t.access_token)
    }

    /// Return current tokens, refreshing them if they expire within the margin.
    ///
    /// A failed refresh ends the session and fires `SignOut`.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotAuthenticated`] without a session; refresh errors otherwise.
    pub async fn ensure_fresh(&self) -> Result<TokenSet, AuthError> {
        let _ = self.initialize().await;
        let refresher = self.refresher();

        let current = self.store.tokens().await.ok_or(AuthError::NotAuthenticated)?;
        if !refresher.needs_refresh(&current, OffsetDateTime::now_utc()) {
            return Ok(current);
        }

        let _guard = self.in_flight.lock().await;
        // Another caller may have refreshed while we waited.
        let current = self.store.tokens().await.ok_or(AuthError::NotAuthenticated)?;
        if !refresher.needs_refresh(&current, OffsetDateTime::now_utc()) {
            return Ok(current);
        }

        match refresher.refresh(&current).await {
            Ok(tokens) => {
                self.store.replace_tokens(tokens.clone()).await?;
                Ok(tokens)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Silent refresh failed; ending session");
                self.store.clear_session().await?;
                self.hooks.fire(&HookEvent::SignOut);
                Err(e)
            }
        }
    }

    /// Revoke the access token at the provider and end the session.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotAuthenticated`] without a session; revocation endpoint errors.
    pub async fn revoke_access_token(&self) -> Result<(), AuthError> {
        let _ = self.initialize().await;
        let tokens = self.store.tokens().await.ok_or(AuthError::NotAuthenticated)?;
        self.client.revoke(&tokens.access_token).await?;
        self.store.clear_session().await?;

        tracing::info!("Access token revoked");
        self.hooks.fire(&HookEvent::RevokeAccessToken);
        Ok(())
    }

    /// Refresh tokens in the background ahead of expiry until the session ends
    /// or a refresh fails.
    pub fn spawn_auto_refresh(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let _ = manager.initialize().await;
            loop {
                let Some(tokens) = manager.store.tokens().await else {
                    tracing::debug!("No session; background refresh stopped");
                    break;
                };
                let wait = manager
                    .refresher()
                    .due_in(&tokens, OffsetDateTime::now_utc())
                    .max(MIN_REFRESH_INTERVAL);
                tokio::time::sleep(wait).await;

                if let Err(e) = manager.ensure_fresh().await {
                    tracing::warn!(error = %e, "Background refresh stopped");
                    break;
                }
            }
        })
    }

    fn refresher(&self) -> TokenRefresher<'_> {
        TokenRefresher::new(&self.client, &self.validator, self.config.refresh_margin)
    }

    async fn is_authenticated_now(&self) -> bool {
        self.store.tokens().await.is_some_and(|t| !t.is_expired())
    }

    async fn authenticated_user(&self) -> Option<BasicUserInfo> {
        if self.is_authenticated_now().await {
            self.store.user_info().await
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn test_config(client_id: &str) -> AuthConfig {
        AuthConfig::new(
            client_id,
            "https://idp.example.com".parse().unwrap(),
            "https://app.example.com/".parse().unwrap(),
        )
        .unwrap()
    }

    fn manager(storage: MemoryStorage) -> SessionManager<MemoryStorage> {
        SessionManager::builder(test_config("test-client"), storage)
            .with_id_token_key(DecodingKey::from_secret(b"s"), Algorithm::HS256)
            .build()
            .unwrap()
    }

    async fn seed_session(storage: &MemoryStorage, expires_in: time::Duration) {
        let store = TokenStore::new(storage.clone(), "test-client");
        store
            .store_session(StoredSession {
                tokens: TokenSet::new("at", OffsetDateTime::now_utc() + expires_in),
                user_info: BasicUserInfo {
                    username: Some("jane".into()),
                    ..BasicUserInfo::default()
                },
            })
            .await
            .unwrap();
    }

    #[test]
    fn empty_client_id_is_rejected_before_any_client_exists() {
        let result = SessionManager::builder(test_config(""), MemoryStorage::new()).build();
        assert!(matches!(result, Err(AuthError::Configuration(_))));
    }

    #[tokio::test]
    async fn starts_unauthenticated() {
        let manager = manager(MemoryStorage::new());
        assert_eq!(manager.initialize().await, Ok(None));
        assert!(!manager.is_authenticated().await);
        assert_eq!(manager.status().await, SessionStatus::Unauthenticated);
        assert_eq!(
            manager.get_basic_user_info().await,
            Err(AuthError::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn sign_in_redirects_and_persists_state() {
        let storage = MemoryStorage::new();
        let manager = manager(storage.clone());
        let SignInOutcome::Redirect(url) = manager.sign_in(SignInOptions::new()).await.unwrap()
        else {
            panic!("expected redirect");
        };
        assert_eq!(url.path(), "/oauth2/authorize");
        assert_eq!(manager.status().await, SessionStatus::Authenticating);
        assert_eq!(storage.len(), 1);
    }

    #[tokio::test]
    async fn pending_sign_in_is_coalesced() {
        let manager = manager(MemoryStorage::new());
        let first = manager.sign_in(SignInOptions::new()).await.unwrap();
        let second = manager.sign_in(SignInOptions::new()).await.unwrap();
        assert_eq!(first, second);

        let forced = manager.sign_in(SignInOptions::new().force()).await.unwrap();
        assert_ne!(first, forced);
    }

    #[tokio::test]
    async fn forced_sign_in_ends_current_session() {
        let storage = MemoryStorage::new();
        seed_session(&storage, time::Duration::hours(1)).await;
        let manager = manager(storage);

        let fired = Arc::new(StdMutex::new(0));
        let counter = fired.clone();
        manager.on(HookKind::SignOut, move |_| *counter.lock().unwrap() += 1);

        let outcome = manager.sign_in(SignInOptions::new().force()).await.unwrap();
        assert!(matches!(outcome, SignInOutcome::Redirect(_)));
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(!manager.is_authenticated().await);
        assert_eq!(manager.status().await, SessionStatus::Authenticating);
    }

    #[tokio::test]
    async fn call_only_on_redirect_does_not_start_a_flow() {
        let manager = manager(MemoryStorage::new());
        let outcome = manager
            .sign_in(
                SignInOptions::new()
                    .call_only_on_redirect()
                    .with_callback_url("https://app.example.com/".parse().unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, SignInOutcome::NoCallback);
        assert_eq!(manager.status().await, SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn restores_persisted_session() {
        let storage = MemoryStorage::new();
        seed_session(&storage, time::Duration::hours(1)).await;
        let manager = manager(storage);

        let user = manager.initialize().await.unwrap().unwrap();
        assert_eq!(user.username.as_deref(), Some("jane"));
        assert!(manager.is_authenticated().await);
        assert!(matches!(
            manager.sign_in(SignInOptions::new()).await.unwrap(),
            SignInOutcome::AlreadyAuthenticated(_)
        ));
    }

    #[tokio::test]
    async fn expired_session_is_not_authenticated() {
        let storage = MemoryStorage::new();
        seed_session(&storage, time::Duration::seconds(-5)).await;
        let manager = manager(storage);

        assert!(!manager.is_authenticated().await);
        // The state machine has not been told to sign out.
        assert_eq!(manager.status().await, SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn callback_without_pending_state_is_a_mismatch() {
        let manager = manager(MemoryStorage::new());
        let err = manager
            .handle_redirect(&"https://app.example.com/?code=c&state=s".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::StateMismatch);
        assert_eq!(manager.status().await, SessionStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn sign_out_clears_and_fires_hook() {
        let storage = MemoryStorage::new();
        seed_session(&storage, time::Duration::hours(1)).await;
        let manager = manager(storage.clone());

        let fired = Arc::new(StdMutex::new(0));
        let counter = fired.clone();
        manager.on(HookKind::SignOut, move |_| *counter.lock().unwrap() += 1);

        let url = manager.sign_out().await.unwrap();
        assert_eq!(url.path(), "/oidc/logout");
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(!manager.is_authenticated().await);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn initialize_hook_fires_once() {
        let manager = manager(MemoryStorage::new());
        let fired = Arc::new(StdMutex::new(Vec::new()));
        let log = fired.clone();
        manager.on(HookKind::Initialize, move |event| {
            if let HookEvent::Initialize { authenticated } = event {
                log.lock().unwrap().push(*authenticated);
            }
        });

        let (a, b) = tokio::join!(manager.initialize(), manager.is_authenticated());
        assert_eq!(a, Ok(None));
        assert!(!b);
        manager.initialize().await.unwrap();
        assert_eq!(*fired.lock().unwrap(), vec![false]);
    }
}
