//! PKCE (RFC 7636, S256 only) and the login state token.

use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generates a code verifier from 32 bytes of OS entropy.
pub fn generate_verifier() -> String {
    b64url(&random_bytes())
}

/// S256: BASE64URL(SHA256(verifier)).
pub fn compute_challenge(verifier: &str) -> String {
    b64url(&Sha256::digest(verifier.as_bytes()))
}

/// Unguessable `state` token tying the callback to a pending request.
/// Same 32 bytes of OS entropy as the verifier; never derived from user input.
pub fn generate_state_token() -> String {
    b64url(&random_bytes())
}

fn random_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

fn b64url(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_matches_rfc_7636_vector() {
        // Appendix B of RFC 7636.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            compute_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_is_valid_and_unique() {
        let a = generate_verifier();
        let b = generate_verifier();

        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn state_tokens_are_unique() {
        assert_ne!(generate_state_token(), generate_state_token());
    }
}
