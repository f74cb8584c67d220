use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::AuthError;
use crate::types::{Nonce, StateToken};

/// PKCE verifier and its S256 challenge (RFC 7636).
///
/// Created when a sign-in starts; the verifier is persisted with the
/// authorization state and consumed once by the callback.
#[derive(Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generates a fresh verifier and derives its challenge.
    ///
    /// The verifier is 64 URL-safe characters (48 random bytes).
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RandomSource`] if the OS random source fails.
    pub fn generate() -> Result<Self, AuthError> {
        let verifier = random_urlsafe::<48>()?;
        let challenge = generate_code_challenge(&verifier);
        Ok(Self {
            verifier,
            challenge,
        })
    }
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Computes the S256 code challenge from a code verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generates the anti-CSRF `state` parameter (16 random bytes, 22 chars).
///
/// # Errors
///
/// Returns [`AuthError::RandomSource`] if the OS random source fails.
pub fn generate_state() -> Result<StateToken, AuthError> {
    random_urlsafe::<16>().map(StateToken::from)
}

/// Generates the ID token `nonce` (16 random bytes, 22 chars).
///
/// # Errors
///
/// Returns [`AuthError::RandomSource`] if the OS random source fails.
pub fn generate_nonce() -> Result<Nonce, AuthError> {
    random_urlsafe::<16>().map(Nonce::from)
}

fn random_urlsafe<const N: usize>() -> Result<String, AuthError> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| AuthError::RandomSource(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_length_within_rfc_bounds() {
        let pair = PkcePair::generate().unwrap();
        assert_eq!(pair.verifier.len(), 64);
        assert!((43..=128).contains(&pair.verifier.len()));
    }

    #[test]
    fn verifier_is_url_safe() {
        let pair = PkcePair::generate().unwrap();
        assert!(
            pair.verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "verifier should be URL-safe: {}",
            pair.verifier
        );
    }

    #[test]
    fn challenge_matches_verifier() {
        let pair = PkcePair::generate().unwrap();
        assert_eq!(pair.challenge, generate_code_challenge(&pair.verifier));
        assert_eq!(pair.challenge.len(), 43);
    }

    #[test]
    fn pairs_are_unique() {
        let a = PkcePair::generate().unwrap();
        let b = PkcePair::generate().unwrap();
        assert_ne!(a.verifier, b.verifier);
    }

    #[test]
    fn rfc7636_appendix_b_vector() {
        assert_eq!(
            generate_code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn state_and_nonce_length() {
        assert_eq!(generate_state().unwrap().as_str().len(), 22);
        assert_eq!(generate_nonce().unwrap().as_str().len(), 22);
        assert_ne!(generate_state().unwrap(), generate_state().unwrap());
    }

    #[test]
    fn debug_redacts_verifier() {
        let pair = PkcePair::generate().unwrap();
        assert!(!format!("{pair:?}").contains(&pair.verifier));
    }
}
