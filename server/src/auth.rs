//! Browser session layer: ties a private cookie to an account DID.
//!
//! This is deliberately separate from the OAuth session store. Logging out
//! of the browser deletes a `browser_sessions` row; the account's OAuth
//! session (and its tokens) stays usable for background work.

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Redirect, Response},
};
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use tracing::error;

use crate::cookies::{Cookie, CookieJar};
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "bibliome_session";

/// Browser sessions last 30 days; the row expiry is authoritative.
const SESSION_TTL_DAYS: i64 = 30;

pub async fn create_session_and_set_cookie(
    app: &AppState,
    jar: &CookieJar,
    did: &str,
) -> Result<(), sqlx::Error> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let expires_at = Utc::now() + Duration::days(SESSION_TTL_DAYS);

    sqlx::query(
        "INSERT INTO browser_sessions (session_id, did, created_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&session_id)
    .bind(did)
    .bind(Utc::now())
    .bind(expires_at)
    .execute(&app.db)
    .await?;

    let mut cookie = Cookie::new(SESSION_COOKIE, session_id);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_max_age(time::Duration::days(SESSION_TTL_DAYS));
    jar.add(cookie);

    Ok(())
}

pub async fn end_session(app: &AppState, jar: &CookieJar) -> Result<(), sqlx::Error> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        sqlx::query("DELETE FROM browser_sessions WHERE session_id = ?")
            .bind(cookie.value())
            .execute(&app.db)
            .await?;
        jar.remove(Cookie::new(SESSION_COOKIE, ""));
    }
    Ok(())
}

async fn lookup_did(app: &AppState, session_id: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT did, expires_at FROM browser_sessions WHERE session_id = ?",
    )
    .bind(session_id)
    .fetch_optional(&app.db)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
    if expires_at < Utc::now() {
        return Ok(None);
    }

    Ok(Some(row.try_get("did")?))
}

/// The authenticated account behind the current request. Rejects with a
/// redirect to the login page.
pub struct AuthUser {
    pub did: String,
}

#[async_trait::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        match OptionalUser::from_request_parts(parts, state).await {
            Ok(OptionalUser(Some(user))) => Ok(user),
            Ok(OptionalUser(None)) => Err(Redirect::to("/login").into_response()),
            Err(response) => Err(response),
        }
    }
}

/// Like [`AuthUser`] but for pages that render either way.
pub struct OptionalUser(pub Option<AuthUser>);

#[async_trait::async_trait]
impl FromRequestParts<AppState> for OptionalUser {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_request_parts(parts, state).await?;

        let Some(cookie) = jar.get(SESSION_COOKIE) else {
            return Ok(OptionalUser(None));
        };

        match lookup_did(state, cookie.value()).await {
            Ok(Some(did)) => Ok(OptionalUser(Some(AuthUser { did }))),
            Ok(None) => {
                jar.remove(Cookie::new(SESSION_COOKIE, ""));
                Ok(OptionalUser(None))
            }
            Err(err) => {
                error!(error = ?err, "browser session lookup failed");
                Err(Redirect::to("/login").into_response())
            }
        }
    }
}
