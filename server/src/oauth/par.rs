//! Client side of the authorization server's endpoints: pushed
//! authorization requests, the authorization-code exchange, and the
//! refresh grant.
//!
//! All three go through [`send_with_dpop`], which signs each attempt with a
//! fresh proof, watches the `DPoP-Nonce` header on every response, and
//! retries exactly once when the server answers `use_dpop_nonce`. A second
//! consecutive nonce demand is a terminal protocol error, not a loop.

use serde::Deserialize;
use tracing::debug;

use crate::errors::AuthError;
use crate::oauth::dpop::DpopKey;

#[derive(Debug)]
pub struct ParRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
    pub state: String,
    pub code_challenge: String,
    pub login_hint: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ParResponse {
    pub request_uri: String,
    #[allow(dead_code)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: Option<String>,
    pub expires_in: Option<i64>,
    pub sub: Option<String>,
}

/// Conventional token endpoint location for an atproto issuer.
pub fn token_endpoint(issuer: &str) -> String {
    format!("{}/oauth/token", issuer.trim_end_matches('/'))
}

/// Submits a PAR. Returns the `request_uri` plus the newest auth-server
/// nonce, which the caller persists on the pending record.
pub async fn push_authorization_request(
    http: &reqwest::Client,
    key: &DpopKey,
    par_endpoint: &str,
    request: &ParRequest,
    nonce: Option<String>,
) -> Result<(ParResponse, Option<String>), AuthError> {
    let mut params = vec![
        ("response_type".to_string(), "code".to_string()),
        ("client_id".to_string(), request.client_id.clone()),
        ("redirect_uri".to_string(), request.redirect_uri.clone()),
        ("scope".to_string(), request.scope.clone()),
        ("state".to_string(), request.state.clone()),
        ("code_challenge".to_string(), request.code_challenge.clone()),
        ("code_challenge_method".to_string(), "S256".to_string()),
        (
            "dpop_bound_access_tokens".to_string(),
            "true".to_string(),
        ),
    ];
    if let Some(hint) = &request.login_hint {
        params.push(("login_hint".to_string(), hint.clone()));
    }

    let (body, nonce) = send_with_dpop(http, key, par_endpoint, &params, nonce).await?;
    let response: ParResponse = serde_json::from_value(body)
        .map_err(|e| AuthError::TokenExchange(format!("bad PAR response: {e}")))?;

    Ok((response, nonce))
}

/// Exchanges an authorization code for the initial token set.
pub async fn exchange_code(
    http: &reqwest::Client,
    key: &DpopKey,
    issuer: &str,
    code: &str,
    pkce_verifier: &str,
    client_id: &str,
    redirect_uri: &str,
    nonce: Option<String>,
) -> Result<(TokenSet, Option<String>), AuthError> {
    let params = vec![
        ("grant_type".to_string(), "authorization_code".to_string()),
        ("code".to_string(), code.to_string()),
        ("redirect_uri".to_string(), redirect_uri.to_string()),
        ("code_verifier".to_string(), pkce_verifier.to_string()),
        ("client_id".to_string(), client_id.to_string()),
    ];

    let endpoint = token_endpoint(issuer);
    let (body, nonce) = send_with_dpop(http, key, &endpoint, &params, nonce).await?;
    let tokens = parse_token_set(body)?;

    Ok((tokens, nonce))
}

/// Redeems a refresh token. A 4xx from the server (most commonly
/// `invalid_grant` after revocation) surfaces as `TokenExchange`, which
/// callers treat as a definitive rejection; a 5xx surfaces as
/// `AuthServerUnavailable` and leaves the grant intact for a later retry.
pub async fn refresh_grant(
    http: &reqwest::Client,
    key: &DpopKey,
    issuer: &str,
    refresh_token: &str,
    client_id: &str,
    nonce: Option<String>,
) -> Result<(TokenSet, Option<String>), AuthError> {
    let params = vec![
        ("grant_type".to_string(), "refresh_token".to_string()),
        ("refresh_token".to_string(), refresh_token.to_string()),
        ("client_id".to_string(), client_id.to_string()),
    ];

    let endpoint = token_endpoint(issuer);
    let (body, nonce) = send_with_dpop(http, key, &endpoint, &params, nonce).await?;
    let tokens = parse_token_set(body)?;

    Ok((tokens, nonce))
}

fn parse_token_set(body: serde_json::Value) -> Result<TokenSet, AuthError> {
    let tokens: TokenSet = serde_json::from_value(body)
        .map_err(|e| AuthError::TokenExchange(format!("bad token response: {e}")))?;

    if let Some(token_type) = &tokens.token_type {
        if !token_type.eq_ignore_ascii_case("dpop") {
            return Err(AuthError::TokenExchange(format!(
                "expected DPoP-bound tokens, got token_type {token_type}"
            )));
        }
    }

    Ok(tokens)
}

async fn send_with_dpop(
    http: &reqwest::Client,
    key: &DpopKey,
    url: &str,
    params: &[(String, String)],
    mut nonce: Option<String>,
) -> Result<(serde_json::Value, Option<String>), AuthError> {
    match send_once(http, key, url, params, nonce.clone()).await {
        Ok(ok) => Ok(ok),
        Err(AuthError::NonceRequired { nonce: fresh }) => {
            debug!(url, "retrying with server-issued DPoP nonce");
            nonce = Some(fresh);
            match send_once(http, key, url, params, nonce).await {
                Ok(ok) => Ok(ok),
                Err(AuthError::NonceRequired { .. }) => Err(AuthError::TokenExchange(
                    "authorization server demanded a DPoP nonce twice".to_string(),
                )),
                Err(err) => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

async fn send_once(
    http: &reqwest::Client,
    key: &DpopKey,
    url: &str,
    params: &[(String, String)],
    nonce: Option<String>,
) -> Result<(serde_json::Value, Option<String>), AuthError> {
    let proof = key.proof("POST", url, nonce.as_deref(), None)?;

    let response = http
        .post(url)
        .header("DPoP", proof)
        .form(params)
        .send()
        .await
        .map_err(|e| AuthError::transport("authorization server", e))?;

    let status = response.status();
    let fresh_nonce = response
        .headers()
        .get("DPoP-Nonce")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let text = response
        .text()
        .await
        .map_err(|e| AuthError::transport("authorization server", e))?;
    let body: serde_json::Value = serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);

    if status.is_success() {
        return Ok((body, fresh_nonce.or(nonce)));
    }

    let error_code = body["error"].as_str().unwrap_or_default().to_string();

    if (status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED)
        && error_code == "use_dpop_nonce"
    {
        let fresh = fresh_nonce.ok_or_else(|| {
            AuthError::TokenExchange(
                "server demanded a DPoP nonce but sent no DPoP-Nonce header".to_string(),
            )
        })?;
        return Err(AuthError::NonceRequired { nonce: fresh });
    }

    let description = body["error_description"].as_str().unwrap_or(&text);

    // Only a 4xx is the server actually ruling on the request. A 5xx (or
    // anything stranger) leaves the grant's status unknown, and callers
    // must not tear anything down over it.
    if status.is_client_error() {
        return Err(AuthError::TokenExchange(format!(
            "HTTP {status}: {error_code} {description}"
        )));
    }

    Err(AuthError::AuthServerUnavailable {
        status: status.as_u16(),
        message: format!("{error_code} {description}").trim().to_string(),
    })
}
