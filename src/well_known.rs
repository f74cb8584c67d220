use serde::{Deserialize, Serialize};
use url::Url;

/// Path of the OpenID Provider configuration document, relative to the issuer.
pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// OpenID Provider metadata (OIDC Discovery 1.0, section 3).
///
/// Only the fields this client consumes are modelled; unknown ones are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub jwks_uri: Url,
    #[serde(default)]
    pub userinfo_endpoint: Option<Url>,
    #[serde(default)]
    pub revocation_endpoint: Option<Url>,
    #[serde(default)]
    pub end_session_endpoint: Option<Url>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Whether the provider advertises S256 PKCE. Absence of the field means unknown
    /// and is treated as supported.
    #[must_use]
    pub fn supports_s256(&self) -> bool {
        self.code_challenge_methods_supported.is_empty()
            || self
                .code_challenge_methods_supported
                .iter()
                .any(|m| m == "S256")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let doc: ProviderMetadata = serde_json::from_str(
            r#"{
                "issuer": "https://idp.example.com/oauth2/token",
                "authorization_endpoint": "https://idp.example.com/oauth2/authorize",
                "token_endpoint": "https://idp.example.com/oauth2/token",
                "jwks_uri": "https://idp.example.com/oauth2/jwks",
                "response_types_supported": ["code"]
            }"#,
        )
        .unwrap();
        assert_eq!(doc.issuer, "https://idp.example.com/oauth2/token");
        assert!(doc.userinfo_endpoint.is_none());
        assert!(doc.supports_s256());
    }

    #[test]
    fn detects_missing_s256() {
        let doc: ProviderMetadata = serde_json::from_str(
            r#"{
                "issuer": "i",
                "authorization_endpoint": "https://idp.example.com/a",
                "token_endpoint": "https://idp.example.com/t",
                "jwks_uri": "https://idp.example.com/k",
                "code_challenge_methods_supported": ["plain"]
            }"#,
        )
        .unwrap();
        assert!(!doc.supports_s256());
    }
}
