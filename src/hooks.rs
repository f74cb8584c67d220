use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::types::BasicUserInfo;

/// Session lifecycle transitions observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    SignIn,
    SignOut,
    Initialize,
    RevokeAccessToken,
}

/// Payload handed to hook handlers.
#[derive(Debug, Clone, Copy)]
pub enum HookEvent<'a> {
    SignIn(&'a BasicUserInfo),
    SignOut,
    /// Initialization finished; `authenticated` is the resulting session state.
    Initialize {
        authenticated: bool,
    },
    RevokeAccessToken,
}

impl HookEvent<'_> {
    #[must_use]
    pub fn kind(&self) -> HookKind {
        match self {
            Self::SignIn(_) => HookKind::SignIn,
            Self::SignOut => HookKind::SignOut,
            Self::Initialize { .. } => HookKind::Initialize,
            Self::RevokeAccessToken => HookKind::RevokeAccessToken,
        }
    }
}

type Handler = Arc<dyn Fn(&HookEvent<'_>) + Send + Sync>;

/// Ordered observer lists per hook kind.
///
/// Handlers run synchronously, in registration order, at the point of transition.
/// They are called outside the registry lock, so a handler may register more handlers.
#[derive(Default)]
pub struct HookRegistry {
    handlers: RwLock<HashMap<HookKind, Vec<Handler>>>,
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: HookKind, handler: F)
    where
        F: Fn(&HookEvent<'_>) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn fire(&self, event: &HookEvent<'_>) {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        tracing::debug!(hook = ?event.kind(), handlers = handlers.len(), "Firing hook");
        for handler in handlers {
            handler(event);
        }
    }

    #[must_use]
    pub fn count(&self, kind: HookKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<_, _> = handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("HookRegistry").field("handlers", &counts).finish()
    }
}
