//! Session domain types and the freshness guarantee.
//!
//! `ensure_fresh` is the only way the rest of the app gets at an access
//! token. It refreshes behind a per-DID lock so a burst of concurrent
//! requests produces exactly one refresh grant.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::AuthError;
use crate::oauth::db;
use crate::oauth::dpop::DpopKey;
use crate::oauth::par;
use crate::state::AppState;

/// Seconds before nominal expiry at which a token is treated as expired.
pub const REFRESH_MARGIN_SECS: i64 = 60;

/// A pending authorization request, alive between the redirect to the
/// authorization server and the callback. Keyed by `state`. The identity
/// fields are `None` for logins that started from a PDS or authorization
/// server URL; those are filled in from the token's subject at callback.
#[derive(Debug, Clone)]
pub struct PendingAuthRequest {
    pub state: String,
    pub authserver_iss: String,
    pub did: Option<String>,
    pub handle: Option<String>,
    pub pds_url: Option<String>,
    pub pkce_verifier: String,
    pub scope: String,
    pub dpop_authserver_nonce: Option<String>,
    pub dpop_private_jwk: String,
    pub created_at: DateTime<Utc>,
}

/// An established OAuth session, one per account DID.
#[derive(Debug, Clone)]
pub struct OAuthSession {
    pub did: String,
    pub handle: String,
    pub pds_url: String,
    pub authserver_iss: String,
    pub access_token: String,
    pub refresh_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub dpop_private_jwk: String,
    pub dpop_authserver_nonce: Option<String>,
    pub dpop_pds_nonce: Option<String>,
}

impl OAuthSession {
    /// True when the access token is expired or within the refresh margin.
    pub fn needs_refresh(&self) -> bool {
        self.access_token_expires_at - Utc::now() < Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

/// Returns a session whose access token is guaranteed usable, refreshing it
/// first if needed. A missing session, or one whose refresh the server
/// definitively rejected, surfaces as `SessionExpired`.
pub async fn ensure_fresh(state: &AppState, did: &str) -> Result<OAuthSession, AuthError> {
    let session = db::get_session(state, did)
        .await?
        .ok_or(AuthError::SessionExpired)?;

    if !session.needs_refresh() {
        return Ok(session);
    }

    let lock = refresh_lock(state, did);
    let result = {
        let _guard = lock.lock().await;
        refresh_under_lock(state, did).await
    };

    // Drop the map entry when no other caller still holds a clone. The
    // count check runs under the shard lock, so a new waiter cannot
    // appear between the check and the removal.
    state
        .refresh_locks
        .remove_if(did, |_, lock| Arc::strong_count(lock) == 2);

    result
}

async fn refresh_under_lock(state: &AppState, did: &str) -> Result<OAuthSession, AuthError> {
    // Another request may have refreshed while we waited on the lock.
    let session = db::get_session(state, did)
        .await?
        .ok_or(AuthError::SessionExpired)?;
    if !session.needs_refresh() {
        return Ok(session);
    }

    refresh_session(state, session).await
}

fn refresh_lock(state: &AppState, did: &str) -> Arc<Mutex<()>> {
    state
        .refresh_locks
        .entry(did.to_string())
        .or_default()
        .clone()
}

async fn refresh_session(
    state: &AppState,
    session: OAuthSession,
) -> Result<OAuthSession, AuthError> {
    info!(did = %session.did, "refreshing access token");

    let key = DpopKey::from_jwk_json(&session.dpop_private_jwk)?;
    let result = par::refresh_grant(
        &state.http,
        &key,
        &session.authserver_iss,
        &session.refresh_token,
        &state.client_id(),
        session.dpop_authserver_nonce.clone(),
    )
    .await;

    let (tokens, nonce) = match result {
        Ok(ok) => ok,
        Err(AuthError::TokenExchange(reason)) => {
            // The grant is dead; keeping the session would just loop every
            // caller through the same rejection.
            warn!(did = %session.did, %reason, "refresh rejected, dropping session");
            db::delete_session(state, &session.did).await?;
            return Err(AuthError::SessionExpired);
        }
        Err(err) => return Err(err),
    };

    let mut refreshed = session;
    refreshed.access_token = tokens.access_token;
    // Providers may rotate the refresh token on every grant.
    if let Some(rotated) = tokens.refresh_token {
        refreshed.refresh_token = rotated;
    }
    refreshed.access_token_expires_at =
        Utc::now() + Duration::seconds(tokens.expires_in.unwrap_or(3600));
    if nonce.is_some() {
        refreshed.dpop_authserver_nonce = nonce;
    }

    db::upsert_session(state, &refreshed).await?;
    info!(did = %refreshed.did, "access token refreshed");

    Ok(refreshed)
}
