use crate::error::AuthError;
use crate::session::SessionManager;
use crate::storage::SessionStorage;
use crate::types::BasicUserInfo;

/// Which screen an application shows for the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppView {
    /// The client could not be built; carries the reason to show the user.
    ConfigurationRequired(String),
    SignedIn(BasicUserInfo),
    /// Offer a login action.
    SignedOut,
}

impl AppView {
    /// Decide the view from the outcome of building a [`SessionManager`].
    ///
    /// A configuration error yields [`AppView::ConfigurationRequired`] without any
    /// network or storage access.
    pub async fn resolve<S: SessionStorage>(built: &Result<SessionManager<S>, AuthError>) -> Self {
        let manager = match built {
            Ok(manager) => manager,
            Err(AuthError::Configuration(reason)) => {
                return Self::ConfigurationRequired(reason.clone());
            }
            Err(e) => return Self::ConfigurationRequired(e.to_string()),
        };

        if !manager.is_authenticated().await {
            return Self::SignedOut;
        }
        match manager.get_basic_user_info().await {
            Ok(user) => Self::SignedIn(user),
            Err(_) => Self::SignedOut,
        }
    }

    #[must_use]
    pub fn shows_login(&self) -> bool {
        matches!(self, Self::SignedOut)
    }

    /// Labelled detail rows for the signed-in screen. Absent fields are left out.
    #[must_use]
    pub fn details(&self) -> Vec<(&'static str, &str)> {
        let Self::SignedIn(user) = self else {
            return Vec::new();
        };
        [
            ("Name", user.display_name.as_deref()),
            ("Username", user.username.as_deref()),
            ("Email", user.email.as_deref().filter(|e| *e != "null")),
        ]
        .into_iter()
        .filter_map(|(label, value)| value.map(|v| (label, v)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::storage::MemoryStorage;

    fn build(client_id: &str) -> Result<SessionManager<MemoryStorage>, AuthError> {
        let config = AuthConfig::new(
            client_id,
            "https://idp.example.com".parse().unwrap(),
            "https://app.example.com/".parse().unwrap(),
        )?;
        SessionManager::builder(config, MemoryStorage::new()).build()
    }

    #[tokio::test]
    async fn empty_client_id_requires_configuration() {
        let view = AppView::resolve(&build("")).await;
        assert_eq!(
            view,
            AppView::ConfigurationRequired("client ID is required".into())
        );
        assert!(!view.shows_login());
        assert!(view.details().is_empty());
    }

    #[tokio::test]
    async fn fresh_client_is_signed_out() {
        let view = AppView::resolve(&build("client")).await;
        assert_eq!(view, AppView::SignedOut);
        assert!(view.shows_login());
    }

    #[test]
    fn null_email_is_not_listed() {
        let view = AppView::SignedIn(BasicUserInfo {
            display_name: Some("Jane Doe".into()),
            username: Some("jane".into()),
            email: Some("null".into()),
            ..BasicUserInfo::default()
        });
        assert_eq!(
            view.details(),
            vec![("Name", "Jane Doe"), ("Username", "jane")]
        );
    }
}
