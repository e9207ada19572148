//! DPoP (RFC 9449) key handling and proof minting.
//!
//! Each pending authorization request gets a fresh P-256 keypair; the key
//! follows the session for its whole life and every outbound request to the
//! authorization server or PDS carries a one-shot proof JWT signed with it.

use base64::Engine;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::AuthError;

/// JWK form of a DPoP keypair. The private scalar `d` is present only in
/// the at-rest representation, which is age-encrypted before storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpopJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

pub struct DpopKey {
    signing_key: SigningKey,
}

impl DpopKey {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Serializes the full keypair (private scalar included) for storage.
    pub fn to_jwk_json(&self) -> Result<String, AuthError> {
        let (x, y) = self.public_coordinates()?;
        let jwk = DpopJwk {
            kty: "EC".to_string(),
            crv: "P-256".to_string(),
            x,
            y,
            d: Some(b64url(&self.signing_key.to_bytes())),
        };
        Ok(serde_json::to_string(&jwk)?)
    }

    pub fn from_jwk_json(json: &str) -> Result<Self, AuthError> {
        let jwk: DpopJwk = serde_json::from_str(json)?;
        let d = jwk
            .d
            .ok_or_else(|| AuthError::internal("stored JWK has no private key"))?;
        let d_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&d)
            .map_err(|e| AuthError::internal(format!("bad JWK private key encoding: {e}")))?;
        let signing_key = SigningKey::from_slice(&d_bytes)
            .map_err(|e| AuthError::internal(format!("bad JWK private key: {e}")))?;
        Ok(Self { signing_key })
    }

    /// Public half as the JWK embedded in proof headers.
    pub fn public_jwk(&self) -> Result<serde_json::Value, AuthError> {
        let (x, y) = self.public_coordinates()?;
        Ok(serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "x": x,
            "y": y,
        }))
    }

    /// RFC 7638 thumbprint: SHA-256 over the canonical JWK members.
    pub fn thumbprint(&self) -> Result<String, AuthError> {
        let (x, y) = self.public_coordinates()?;
        let canonical = format!(r#"{{"crv":"P-256","kty":"EC","x":"{x}","y":"{y}"}}"#);
        Ok(b64url(&Sha256::digest(canonical.as_bytes())))
    }

    /// Mints a single-use proof JWT for one HTTP request. `nonce` is the
    /// most recent value the target server issued, if any; `access_token`
    /// is set for resource requests and hashed into the `ath` claim.
    pub fn proof(
        &self,
        method: &str,
        url: &str,
        nonce: Option<&str>,
        access_token: Option<&str>,
    ) -> Result<String, AuthError> {
        let header = serde_json::json!({
            "typ": "dpop+jwt",
            "alg": "ES256",
            "jwk": self.public_jwk()?,
        });

        let now = chrono::Utc::now().timestamp();
        let mut claims = serde_json::json!({
            "jti": uuid::Uuid::new_v4().to_string(),
            "htm": method.to_uppercase(),
            "htu": url,
            "iat": now,
            "exp": now + 300,
        });
        if let Some(nonce) = nonce {
            claims["nonce"] = serde_json::Value::String(nonce.to_string());
        }
        if let Some(token) = access_token {
            claims["ath"] = serde_json::Value::String(b64url(&Sha256::digest(token.as_bytes())));
        }

        let header_b64 = b64url(serde_json::to_string(&header)?.as_bytes());
        let claims_b64 = b64url(serde_json::to_string(&claims)?.as_bytes());
        let signing_input = format!("{header_b64}.{claims_b64}");

        let signature: Signature = self.signing_key.sign(signing_input.as_bytes());
        let signature_b64 = b64url(&signature.to_bytes());

        Ok(format!("{signing_input}.{signature_b64}"))
    }

    fn public_coordinates(&self) -> Result<(String, String), AuthError> {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let x = point
            .x()
            .ok_or_else(|| AuthError::internal("point at infinity"))?;
        let y = point
            .y()
            .ok_or_else(|| AuthError::internal("point at infinity"))?;
        Ok((b64url(x), b64url(y)))
    }
}

fn b64url(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}
