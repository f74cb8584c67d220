#![doc = include_str!("../README.md")]

pub mod authorize;
pub mod callback;
pub mod config;
pub mod error;
pub mod hooks;
pub mod id_token;
pub mod jwks;
pub mod oauth;
pub mod pkce;
pub mod refresh;
pub mod session;
pub mod storage;
pub mod token_store;
pub mod types;
pub mod view;
pub mod well_known;

// Re-exports for convenient access
pub use authorize::{AuthorizationRequest, AuthorizationState, build_logout_url};
pub use callback::{CallbackOutcome, CallbackParams, CallbackProcessor};
pub use config::{AuthConfig, Endpoints, RetryPolicy};
pub use error::AuthError;
pub use hooks::{HookEvent, HookKind, HookRegistry};
pub use id_token::{IdTokenClaims, IdTokenValidator, KeySource};
pub use oauth::{OAuthClient, TokenResponse};
pub use pkce::{PkcePair, generate_code_challenge, generate_nonce, generate_state};
pub use refresh::TokenRefresher;
pub use session::{
    CompletedSignIn, SessionManager, SessionManagerBuilder, SignInOptions, SignInOutcome,
};
pub use storage::{FileStorage, MemoryStorage, SessionStorage, StorageError};
pub use token_store::{StoredSession, TokenStore};
pub use types::{BasicUserInfo, Nonce, SessionStatus, StateToken, TokenSet};
pub use view::AppView;
pub use well_known::ProviderMetadata;
