use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::authorize::AuthorizationState;
use crate::error::AuthError;
use crate::storage::SessionStorage;
use crate::types::{BasicUserInfo, StateToken, TokenSet};

/// Persisted post-login record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub tokens: TokenSet,
    pub user_info: BasicUserInfo,
}

#[derive(Debug, Default)]
struct Slots {
    session: Option<StoredSession>,
    pending: Option<AuthorizationState>,
    consumed_state: Option<StateToken>,
}

/// Sole owner of the session's tokens and of the pending authorization state.
///
/// Writes persist to [`SessionStorage`] while the write lock is held, so a
/// reader sees either the old record or the new one, never a mix.
pub struct TokenStore<S> {
    storage: S,
    session_key: String,
    pending_key: String,
    slots: RwLock<Slots>,
}

impl<S: SessionStorage> TokenStore<S> {
    /// Keys are namespaced by client ID so several apps can share one storage.
    pub fn new(storage: S, client_id: &str) -> Self {
        Self {
            storage,
            session_key: format!("session_data-{client_id}"),
            pending_key: format!("authorization_state-{client_id}"),
            slots: RwLock::new(Slots::default()),
        }
    }

    /// Reload persisted records into memory. Unreadable records are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the backend fails.
    pub async fn load(&self) -> Result<(), AuthError> {
        let mut slots = self.slots.write().await;
        slots.session = self.read_json(&self.session_key).await?;
        slots.pending = self.read_json(&self.pending_key).await?;
        Ok(())
    }

    pub async fn session(&self) -> Option<StoredSession> {
        self.slots.read().await.session.clone()
    }

    pub async fn tokens(&self) -> Option<TokenSet> {
        self.slots
            .read()
            .await
            .session
            .as_ref()
            .map(|s| s.tokens.clone())
    }

    pub async fn user_info(&self) -> Option<BasicUserInfo> {
        self.slots
            .read()
            .await
            .session
            .as_ref()
            .map(|s| s.user_info.clone())
    }

    pub async fn has_session(&self) -> bool {
        self.slots.read().await.session.is_some()
    }

    /// Store a fresh session and drop any pending authorization state.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the backend fails.
    pub async fn store_session(&self, session: StoredSession) -> Result<(), AuthError> {
        let mut slots = self.slots.write().await;
        self.write_json(&self.session_key, &session).await?;
        self.remove_key(&self.pending_key).await?;
        slots.pending = None;
        slots.session = Some(session);
        Ok(())
    }

    /// Replace the tokens of the current session (refresh), keeping user info.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotAuthenticated`] if there is no session to update.
    pub async fn replace_tokens(&self, tokens: TokenSet) -> Result<(), AuthError> {
        let mut slots = self.slots.write().await;
        let Some(current) = slots.session.as_ref() else {
            return Err(AuthError::NotAuthenticated);
        };
        let updated = StoredSession {
            tokens,
            user_info: current.user_info.clone(),
        };
        self.write_json(&self.session_key, &updated).await?;
        slots.session = Some(updated);
        Ok(())
    }

    /// Remove the session. Returns what was removed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the backend fails.
    pub async fn clear_session(&self) -> Result<Option<StoredSession>, AuthError> {
        let mut slots = self.slots.write().await;
        self.remove_key(&self.session_key).await?;
        Ok(slots.session.take())
    }

    /// Persist the pre-redirect context.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the backend fails.
    pub async fn save_authorization_state(
        &self,
        state: &AuthorizationState,
    ) -> Result<(), AuthError> {
        let mut slots = self.slots.write().await;
        self.write_json(&self.pending_key, state).await?;
        slots.pending = Some(state.clone());
        Ok(())
    }

    pub async fn pending_authorization_state(&self) -> Option<AuthorizationState> {
        self.slots.read().await.pending.clone()
    }

    /// Remove and return the pending authorization state. One-time use: a second
    /// call returns `None`, and the consumed `state` value is remembered.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the backend fails.
    pub async fn take_authorization_state(
        &self,
    ) -> Result<Option<AuthorizationState>, AuthError> {
        let mut slots = self.slots.write().await;
        if slots.pending.is_none() {
            return Ok(None);
        }
        self.remove_key(&self.pending_key).await?;
        let taken = slots.pending.take();
        slots.consumed_state = taken.as_ref().map(|s| s.state.clone());
        Ok(taken)
    }

    /// Drop the pending authorization state without consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Storage`] if the backend fails.
    pub async fn discard_authorization_state(&self) -> Result<(), AuthError> {
        let mut slots = self.slots.write().await;
        self.remove_key(&self.pending_key).await?;
        slots.pending = None;
        Ok(())
    }

    /// Whether `state` belongs to an authorization response already processed here.
    pub async fn was_consumed(&self, state: &str) -> bool {
        self.slots
            .read()
            .await
            .consumed_state
            .as_ref()
            .is_some_and(|s| s.as_str() == state)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, AuthError> {
        let Some(raw) = self.storage.get(key).await.map_err(AuthError::storage)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding unreadable session record");
                self.remove_key(key).await?;
                Ok(None)
            }
        }
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), AuthError> {
        let json = serde_json::to_string(value).map_err(AuthError::storage)?;
        self.storage
            .set(key, json)
            .await
            .map_err(AuthError::storage)
    }

    async fn remove_key(&self, key: &str) -> Result<(), AuthError> {
        self.storage.remove(key).await.map_err(AuthError::storage)
    }
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::authorize::AuthorizationRequest;
    use crate::config::AuthConfig;
    use crate::storage::MemoryStorage;

    fn test_config() -> AuthConfig {
        AuthConfig::new(
            "test-client",
            "https://idp.example.com".parse().unwrap(),
            "https://app.example.com/".parse().unwrap(),
        )
        .unwrap()
    }

    fn session() -> StoredSession {
        StoredSession {
            tokens: TokenSet::new("at", OffsetDateTime::now_utc() + time::Duration::hours(1))
                .with_refresh_token("rt"),
            user_info: BasicUserInfo {
                username: Some("jane".into()),
                ..BasicUserInfo::default()
            },
        }
    }

    #[tokio::test]
    async fn session_survives_reload() {
        let storage = MemoryStorage::new();
        let store = TokenStore::new(storage.clone(), "test-client");
        store.store_session(session()).await.unwrap();

        let reloaded = TokenStore::new(storage, "test-client");
        assert!(!reloaded.has_session().await);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.session().await, Some(session()));
    }

    #[tokio::test]
    async fn keys_are_scoped_by_client() {
        let storage = MemoryStorage::new();
        TokenStore::new(storage.clone(), "a")
            .store_session(session())
            .await
            .unwrap();
        let other = TokenStore::new(storage, "b");
        other.load().await.unwrap();
        assert!(!other.has_session().await);
    }

    #[tokio::test]
    async fn authorization_state_is_one_time() {
        let config = test_config();
        let storage = MemoryStorage::new();
        let store = TokenStore::new(storage.clone(), "test-client");
        let request = AuthorizationRequest::prepare(&config, &config.scopes(), None).unwrap();
        store.save_authorization_state(&request.state).await.unwrap();

        let reloaded = TokenStore::new(storage.clone(), "test-client");
        reloaded.load().await.unwrap();
        let taken = reloaded.take_authorization_state().await.unwrap().unwrap();
        assert_eq!(taken.state, request.state.state);
        assert!(reloaded.was_consumed(request.state.state.as_str()).await);
        assert!(reloaded.take_authorization_state().await.unwrap().is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn replace_tokens_keeps_user() {
        let store = TokenStore::new(MemoryStorage::new(), "c");
        let err = store
            .replace_tokens(TokenSet::new("x", OffsetDateTime::now_utc()))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::NotAuthenticated);

        store.store_session(session()).await.unwrap();
        store
            .replace_tokens(TokenSet::new("new", OffsetDateTime::now_utc()))
            .await
            .unwrap();
        let current = store.session().await.unwrap();
        assert_eq!(current.tokens.access_token, "new");
        assert_eq!(current.user_info.username.as_deref(), Some("jane"));
    }

    #[tokio::test]
    async fn clear_removes_persisted_session() {
        let storage = MemoryStorage::new();
        let store = TokenStore::new(storage.clone(), "c");
        store.store_session(session()).await.unwrap();
        assert!(store.clear_session().await.unwrap().is_some());
        assert!(store.tokens().await.is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn corrupt_record_is_dropped() {
        let storage = MemoryStorage::new();
        storage
            .set("session_data-c", "{not json".into())
            .await
            .unwrap();
        let store = TokenStore::new(storage.clone(), "c");
        store.load().await.unwrap();
        assert!(!store.has_session().await);
        assert!(storage.is_empty());
    }
}
