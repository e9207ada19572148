//! Persistence for pending authorization requests and OAuth sessions.
//!
//! PKCE verifiers, DPoP private keys, and both tokens are age-encrypted
//! before they reach a row and decrypted on the way out. Server-issued
//! DPoP nonces are stored in the clear.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use tracing::info;

use crate::errors::AuthError;
use crate::oauth::session::{OAuthSession, PendingAuthRequest};
use crate::state::AppState;

/// Lifetime of a pending authorization request.
pub const PENDING_TTL_SECS: i64 = 3600;

fn crypto_err(err: color_eyre::Report) -> AuthError {
    AuthError::internal(format!("encryption failure: {err}"))
}

pub async fn put_pending(state: &AppState, pending: &PendingAuthRequest) -> Result<(), AuthError> {
    let enc_verifier = state
        .encryption
        .encrypt(&pending.pkce_verifier)
        .await
        .map_err(crypto_err)?;
    let enc_jwk = state
        .encryption
        .encrypt(&pending.dpop_private_jwk)
        .await
        .map_err(crypto_err)?;

    sqlx::query(
        r#"
        INSERT INTO auth_requests (
            state, authserver_iss, did, handle, pds_url,
            pkce_verifier, scope, dpop_authserver_nonce, dpop_private_jwk, created_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&pending.state)
    .bind(&pending.authserver_iss)
    .bind(pending.did.as_deref())
    .bind(pending.handle.as_deref())
    .bind(pending.pds_url.as_deref())
    .bind(&enc_verifier)
    .bind(&pending.scope)
    .bind(&pending.dpop_authserver_nonce)
    .bind(&enc_jwk)
    .bind(pending.created_at)
    .execute(&state.db)
    .await?;

    Ok(())
}

/// Atomically removes and returns the pending request for `state_token`.
/// The delete-returning form means two racing callbacks can never both
/// see the record. Expired records are treated as absent.
pub async fn consume_pending(
    state: &AppState,
    state_token: &str,
) -> Result<Option<PendingAuthRequest>, AuthError> {
    let row = sqlx::query(
        r#"
        DELETE FROM auth_requests
        WHERE state = ?
        RETURNING state, authserver_iss, did, handle, pds_url,
                  pkce_verifier, scope, dpop_authserver_nonce, dpop_private_jwk, created_at
        "#,
    )
    .bind(state_token)
    .fetch_optional(&state.db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    if Utc::now() - created_at > Duration::seconds(PENDING_TTL_SECS) {
        info!(state = state_token, "pending authorization request expired");
        return Ok(None);
    }

    let pkce_verifier = state
        .encryption
        .decrypt(row.try_get("pkce_verifier")?)
        .await
        .map_err(crypto_err)?;
    let dpop_private_jwk = state
        .encryption
        .decrypt(row.try_get("dpop_private_jwk")?)
        .await
        .map_err(crypto_err)?;

    Ok(Some(PendingAuthRequest {
        state: row.try_get("state")?,
        authserver_iss: row.try_get("authserver_iss")?,
        did: row.try_get("did")?,
        handle: row.try_get("handle")?,
        pds_url: row.try_get("pds_url")?,
        pkce_verifier,
        scope: row.try_get("scope")?,
        dpop_authserver_nonce: row.try_get("dpop_authserver_nonce")?,
        dpop_private_jwk,
        created_at,
    }))
}

/// Deletes pending requests past their TTL. Run periodically; the read
/// path enforces the TTL on its own, so this only reclaims space.
pub async fn cleanup_expired_requests(state: &AppState) -> Result<u64, AuthError> {
    let cutoff = Utc::now() - Duration::seconds(PENDING_TTL_SECS);

    let result = sqlx::query("DELETE FROM auth_requests WHERE created_at < ?")
        .bind(cutoff)
        .execute(&state.db)
        .await?;

    let swept = result.rows_affected();
    if swept > 0 {
        info!(swept, "swept expired authorization requests");
    }
    Ok(swept)
}

pub async fn upsert_session(state: &AppState, session: &OAuthSession) -> Result<(), AuthError> {
    let enc_access = state
        .encryption
        .encrypt(&session.access_token)
        .await
        .map_err(crypto_err)?;
    let enc_refresh = state
        .encryption
        .encrypt(&session.refresh_token)
        .await
        .map_err(crypto_err)?;
    let enc_jwk = state
        .encryption
        .encrypt(&session.dpop_private_jwk)
        .await
        .map_err(crypto_err)?;

    sqlx::query(
        r#"
        INSERT INTO oauth_sessions (
            did, handle, pds_url, authserver_iss,
            access_token, refresh_token, access_token_expires_at,
            dpop_private_jwk, dpop_authserver_nonce, dpop_pds_nonce,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (did) DO UPDATE SET
            handle = excluded.handle,
            pds_url = excluded.pds_url,
            authserver_iss = excluded.authserver_iss,
            access_token = excluded.access_token,
            refresh_token = excluded.refresh_token,
            access_token_expires_at = excluded.access_token_expires_at,
            dpop_private_jwk = excluded.dpop_private_jwk,
            dpop_authserver_nonce = excluded.dpop_authserver_nonce,
            dpop_pds_nonce = excluded.dpop_pds_nonce,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&session.did)
    .bind(&session.handle)
    .bind(&session.pds_url)
    .bind(&session.authserver_iss)
    .bind(&enc_access)
    .bind(&enc_refresh)
    .bind(session.access_token_expires_at)
    .bind(&enc_jwk)
    .bind(&session.dpop_authserver_nonce)
    .bind(&session.dpop_pds_nonce)
    .bind(Utc::now())
    .bind(Utc::now())
    .execute(&state.db)
    .await?;

    Ok(())
}

pub async fn get_session(
    state: &AppState,
    did: &str,
) -> Result<Option<OAuthSession>, AuthError> {
    let row = sqlx::query(
        r#"
        SELECT did, handle, pds_url, authserver_iss,
               access_token, refresh_token, access_token_expires_at,
               dpop_private_jwk, dpop_authserver_nonce, dpop_pds_nonce
        FROM oauth_sessions
        WHERE did = ?
        "#,
    )
    .bind(did)
    .fetch_optional(&state.db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let access_token = state
        .encryption
        .decrypt(row.try_get("access_token")?)
        .await
        .map_err(crypto_err)?;
    let refresh_token = state
        .encryption
        .decrypt(row.try_get("refresh_token")?)
        .await
        .map_err(crypto_err)?;
    let dpop_private_jwk = state
        .encryption
        .decrypt(row.try_get("dpop_private_jwk")?)
        .await
        .map_err(crypto_err)?;

    Ok(Some(OAuthSession {
        did: row.try_get("did")?,
        handle: row.try_get("handle")?,
        pds_url: row.try_get("pds_url")?,
        authserver_iss: row.try_get("authserver_iss")?,
        access_token,
        refresh_token,
        access_token_expires_at: row.try_get("access_token_expires_at")?,
        dpop_private_jwk,
        dpop_authserver_nonce: row.try_get("dpop_authserver_nonce")?,
        dpop_pds_nonce: row.try_get("dpop_pds_nonce")?,
    }))
}

pub async fn delete_session(state: &AppState, did: &str) -> Result<(), AuthError> {
    sqlx::query("DELETE FROM oauth_sessions WHERE did = ?")
        .bind(did)
        .execute(&state.db)
        .await?;
    Ok(())
}

/// Persists the newest resource-server nonce observed for this session.
pub async fn update_pds_nonce(
    state: &AppState,
    did: &str,
    nonce: &str,
) -> Result<(), AuthError> {
    sqlx::query("UPDATE oauth_sessions SET dpop_pds_nonce = ?, updated_at = ? WHERE did = ?")
        .bind(nonce)
        .bind(Utc::now())
        .bind(did)
        .execute(&state.db)
        .await?;
    Ok(())
}
