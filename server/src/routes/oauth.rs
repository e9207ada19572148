//! OAuth HTTP surface: login kick-off, provider callback, client metadata,
//! logout.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    Form, Json,
};
use serde::Deserialize;
use tracing::info;

use crate::auth;
use crate::cookies::CookieJar;
use crate::errors::AuthError;
use crate::oauth::flow;
use crate::routes::error_page;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct LoginForm {
    identifier: String,
}

pub async fn login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<Redirect, AuthError> {
    let start = flow::begin_login(&state, &form.identifier).await?;
    Ok(Redirect::to(&start.authorization_url))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    iss: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

pub async fn callback(
    State(state): State<AppState>,
    jar: CookieJar,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AuthError> {
    // The authorization server reports user denials and its own failures
    // through the callback rather than an error status.
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        info!(%error, %description, "authorization server returned an error");
        let message = if description.is_empty() {
            format!("The login provider reported: {error}")
        } else {
            format!("The login provider reported: {description}")
        };
        return Ok((StatusCode::BAD_REQUEST, error_page(&message)).into_response());
    }

    let (Some(code), Some(state_token)) = (params.code, params.state) else {
        return Ok((
            StatusCode::BAD_REQUEST,
            error_page("The callback was missing required parameters."),
        )
            .into_response());
    };

    let session =
        flow::complete_login(&state, &code, &state_token, params.iss.as_deref()).await?;

    auth::create_session_and_set_cookie(&state, &jar, &session.did).await?;

    Ok(Redirect::to("/me").into_response())
}

/// Client metadata document. Its URL doubles as our OAuth client ID; the
/// authorization server fetches it to learn our redirect URIs and auth
/// style (public client, DPoP-bound tokens).
pub async fn client_metadata(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "client_id": state.client_id(),
        "client_name": "Bibliome",
        "client_uri": state.config.app_url,
        "application_type": "web",
        "grant_types": ["authorization_code", "refresh_token"],
        "response_types": ["code"],
        "redirect_uris": [state.redirect_uri()],
        "scope": state.config.oauth_scope,
        "token_endpoint_auth_method": "none",
        "dpop_bound_access_tokens": true,
    }))
}

pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Result<Redirect, AuthError> {
    auth::end_session(&state, &jar).await?;
    Ok(Redirect::to("/"))
}
