//! DPoP-authenticated requests to a user's PDS.
//!
//! The resource server runs its own nonce sequence, independent of the
//! authorization server's, so the session tracks the two separately. A 401
//! carrying `use_dpop_nonce` in WWW-Authenticate gets one retry with the
//! nonce the server just issued; any further challenge is returned as-is.

use reqwest::Method;
use tracing::debug;
use url::Url;

use crate::errors::AuthError;
use crate::oauth::db;
use crate::oauth::dpop::DpopKey;
use crate::oauth::session;
use crate::security::is_safe_url;
use crate::state::AppState;

/// Issues an authenticated request on behalf of `did`. Guarantees a fresh
/// access token via the session store before anything goes on the wire.
pub async fn authed_request(
    app: &AppState,
    did: &str,
    method: Method,
    url: &str,
    body: Option<serde_json::Value>,
) -> Result<reqwest::Response, AuthError> {
    if !is_safe_url(url) {
        return Err(AuthError::internal(format!("unsafe PDS request URL: {url}")));
    }

    let session = session::ensure_fresh(app, did).await?;
    let key = DpopKey::from_jwk_json(&session.dpop_private_jwk)?;

    let mut nonce = session.dpop_pds_nonce.clone();
    let response = send_once(app, &session.access_token, &key, &method, url, &body, &nonce).await?;

    observe_nonce(app, did, &mut nonce, &response).await?;

    if !wants_fresh_nonce(&response) {
        return Ok(response);
    }

    debug!(url, "PDS demanded a DPoP nonce, retrying once");
    let response = send_once(app, &session.access_token, &key, &method, url, &body, &nonce).await?;
    observe_nonce(app, did, &mut nonce, &response).await?;

    Ok(response)
}

async fn send_once(
    app: &AppState,
    access_token: &str,
    key: &DpopKey,
    method: &Method,
    url: &str,
    body: &Option<serde_json::Value>,
    nonce: &Option<String>,
) -> Result<reqwest::Response, AuthError> {
    let htu = proof_target(url)?;
    let proof = key.proof(method.as_str(), &htu, nonce.as_deref(), Some(access_token))?;

    let mut request = app
        .http
        .request(method.clone(), url)
        .header("Authorization", format!("DPoP {access_token}"))
        .header("DPoP", proof);
    if let Some(json) = body {
        request = request.json(json);
    }

    request
        .send()
        .await
        .map_err(|e| AuthError::transport("pds", e))
}

/// Persists a newly issued resource-server nonce so the next request's
/// first attempt already carries it.
async fn observe_nonce(
    app: &AppState,
    did: &str,
    nonce: &mut Option<String>,
    response: &reqwest::Response,
) -> Result<(), AuthError> {
    let fresh = response
        .headers()
        .get("DPoP-Nonce")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(fresh) = fresh {
        if nonce.as_deref() != Some(fresh.as_str()) {
            db::update_pds_nonce(app, did, &fresh).await?;
            *nonce = Some(fresh);
        }
    }

    Ok(())
}

/// RFC 9449 `htu` claim: the target URI without query or fragment.
fn proof_target(url: &str) -> Result<String, AuthError> {
    let mut target =
        Url::parse(url).map_err(|e| AuthError::internal(format!("bad request URL {url}: {e}")))?;
    target.set_query(None);
    target.set_fragment(None);
    Ok(target.into())
}

fn wants_fresh_nonce(response: &reqwest::Response) -> bool {
    if response.status() != reqwest::StatusCode::UNAUTHORIZED {
        return false;
    }

    response
        .headers()
        .get("WWW-Authenticate")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("use_dpop_nonce"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_target_strips_query_and_fragment() {
        assert_eq!(
            proof_target("https://pds.example/xrpc/com.example.ping?cursor=5&limit=10#top")
                .unwrap(),
            "https://pds.example/xrpc/com.example.ping"
        );
        assert_eq!(
            proof_target("https://pds.example/xrpc/com.example.ping").unwrap(),
            "https://pds.example/xrpc/com.example.ping"
        );
    }
}
