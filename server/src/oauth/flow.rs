//! The login flow coordinator: everything between "user typed a handle"
//! and "session row exists".

use chrono::{Duration, Utc};
use tracing::info;
use url::Url;

use crate::errors::AuthError;
use crate::identity;
use crate::oauth::db;
use crate::oauth::dpop::DpopKey;
use crate::oauth::par::{self, ParRequest};
use crate::oauth::pkce;
use crate::oauth::session::{OAuthSession, PendingAuthRequest};
use crate::state::AppState;

/// Explicit flow stages, logged at every transition so a stuck login can
/// be placed precisely from the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    Resolving,
    ParSent,
    AwaitingCallback,
    ExchangingToken,
    Established,
}

impl std::fmt::Display for FlowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FlowStage::Resolving => "resolving",
            FlowStage::ParSent => "par_sent",
            FlowStage::AwaitingCallback => "awaiting_callback",
            FlowStage::ExchangingToken => "exchanging_token",
            FlowStage::Established => "established",
        };
        f.write_str(s)
    }
}

/// Outcome of [`begin_login`]: where to send the browser, and the state
/// token that names the pending request.
#[derive(Debug)]
pub struct LoginStart {
    pub authorization_url: String,
    pub state: String,
}

/// Starts a login: resolves the hint, mints PKCE material and a DPoP key,
/// pushes the authorization request, and persists the pending record.
/// Nothing is stored unless the PAR succeeded.
///
/// The hint is either an account identifier (handle or DID) or a PDS /
/// authorization server URL. In the URL case the account identity is not
/// known yet; [`complete_login`] resolves it from the token's subject.
pub async fn begin_login(app: &AppState, identifier: &str) -> Result<LoginStart, AuthError> {
    let identifier = identifier.trim();
    info!(stage = %FlowStage::Resolving, identifier, "login started");

    let (resolved, authserver) =
        if identifier.starts_with("https://") || identifier.starts_with("http://") {
            let authserver = identity::resolve_server_hint(&app.http, identifier).await?;
            (None, authserver)
        } else {
            let resolved = identity::resolve_identity(&app.http, &app.config, identifier).await?;
            let authserver = resolved.authserver.clone();
            (Some(resolved), authserver)
        };

    let pkce_verifier = pkce::generate_verifier();
    let code_challenge = pkce::compute_challenge(&pkce_verifier);
    let state_token = pkce::generate_state_token();
    let dpop_key = DpopKey::generate();

    let request = ParRequest {
        client_id: app.client_id(),
        redirect_uri: app.redirect_uri(),
        scope: app.config.oauth_scope.clone(),
        state: state_token.clone(),
        code_challenge,
        login_hint: resolved.as_ref().map(|r| r.handle.clone()),
    };

    let par_endpoint = authserver.par_endpoint()?;
    let (par_response, nonce) = par::push_authorization_request(
        &app.http,
        &dpop_key,
        par_endpoint,
        &request,
        None,
    )
    .await?;
    info!(stage = %FlowStage::ParSent, did = ?resolved.as_ref().map(|r| r.did.as_str()), "authorization request pushed");

    let pending = PendingAuthRequest {
        state: state_token.clone(),
        authserver_iss: authserver.issuer.clone(),
        did: resolved.as_ref().map(|r| r.did.clone()),
        handle: resolved.as_ref().map(|r| r.handle.clone()),
        pds_url: resolved.map(|r| r.pds_url),
        pkce_verifier,
        scope: app.config.oauth_scope.clone(),
        dpop_authserver_nonce: nonce,
        dpop_private_jwk: dpop_key.to_jwk_json()?,
        created_at: Utc::now(),
    };
    db::put_pending(app, &pending).await?;

    let authorization_url = build_authorization_url(
        &authserver.authorization_endpoint,
        &app.client_id(),
        &par_response.request_uri,
        &state_token,
    )?;
    info!(stage = %FlowStage::AwaitingCallback, did = ?pending.did, "redirecting to authorization server");

    Ok(LoginStart {
        authorization_url,
        state: state_token,
    })
}

fn build_authorization_url(
    authorization_endpoint: &str,
    client_id: &str,
    request_uri: &str,
    state: &str,
) -> Result<String, AuthError> {
    let mut url = Url::parse(authorization_endpoint)
        .map_err(|e| AuthError::internal(format!("bad authorization endpoint: {e}")))?;
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("request_uri", request_uri)
        .append_pair("state", state);
    Ok(url.into())
}

/// Completes a login from the provider callback. The pending request is
/// consumed atomically up front, so a state token works exactly once no
/// matter how many callbacks race.
pub async fn complete_login(
    app: &AppState,
    code: &str,
    state_token: &str,
    iss: Option<&str>,
) -> Result<OAuthSession, AuthError> {
    let pending = db::consume_pending(app, state_token)
        .await?
        .ok_or(AuthError::InvalidState)?;

    if let Some(iss) = iss {
        if iss.trim_end_matches('/') != pending.authserver_iss.trim_end_matches('/') {
            return Err(AuthError::TokenExchange(format!(
                "callback issuer {iss} does not match pending issuer {}",
                pending.authserver_iss
            )));
        }
    }

    info!(stage = %FlowStage::ExchangingToken, did = ?pending.did, "exchanging authorization code");
    let dpop_key = DpopKey::from_jwk_json(&pending.dpop_private_jwk)?;
    let (tokens, nonce) = par::exchange_code(
        &app.http,
        &dpop_key,
        &pending.authserver_iss,
        code,
        &pending.pkce_verifier,
        &app.client_id(),
        &app.redirect_uri(),
        pending.dpop_authserver_nonce.clone(),
    )
    .await?;

    let sub = tokens
        .sub
        .clone()
        .ok_or_else(|| AuthError::TokenExchange("token response missing sub".to_string()))?;

    let (did, handle, pds_url) = match pending.did {
        Some(did) => {
            if sub != did {
                return Err(AuthError::TokenExchange(format!(
                    "token subject {sub} does not match expected DID {did}"
                )));
            }
            let handle = pending
                .handle
                .ok_or_else(|| AuthError::internal("pending request has a DID but no handle"))?;
            let pds_url = pending
                .pds_url
                .ok_or_else(|| AuthError::internal("pending request has a DID but no PDS URL"))?;
            (did, handle, pds_url)
        }
        None => {
            // Server-URL login: the token's subject is the first time we
            // learn who logged in. Resolve it and check that its PDS's
            // authorization server matches the issuer that vouched for it.
            let resolved = identity::resolve_identity(&app.http, &app.config, &sub).await?;
            if resolved.authserver.issuer.trim_end_matches('/')
                != pending.authserver_iss.trim_end_matches('/')
            {
                return Err(AuthError::TokenExchange(format!(
                    "{sub} is not served by authorization server {}",
                    pending.authserver_iss
                )));
            }
            (resolved.did, resolved.handle, resolved.pds_url)
        }
    };

    let refresh_token = tokens
        .refresh_token
        .ok_or_else(|| AuthError::TokenExchange("token response missing refresh_token".to_string()))?;

    let session = OAuthSession {
        did,
        handle,
        pds_url,
        authserver_iss: pending.authserver_iss,
        access_token: tokens.access_token,
        refresh_token,
        access_token_expires_at: Utc::now()
            + Duration::seconds(tokens.expires_in.unwrap_or(3600)),
        dpop_private_jwk: pending.dpop_private_jwk,
        dpop_authserver_nonce: nonce,
        dpop_pds_nonce: None,
    };
    db::upsert_session(app, &session).await?;
    info!(stage = %FlowStage::Established, did = %session.did, "oauth session established");

    Ok(session)
}
