use std::fmt::Debug;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};

/// Where identity resolution gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStage {
    Handle,
    DidDocument,
    PdsMetadata,
    AuthServerMetadata,
}

impl std::fmt::Display for ResolutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResolutionStage::Handle => "handle resolution",
            ResolutionStage::DidDocument => "DID document fetch",
            ResolutionStage::PdsMetadata => "PDS metadata fetch",
            ResolutionStage::AuthServerMetadata => "authorization server metadata fetch",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("identity resolution failed during {stage}: {message}")]
    Resolution {
        stage: ResolutionStage,
        message: String,
    },

    #[error("authorization server missing required capability: {0}")]
    Capability(String),

    /// Internal signal that an endpoint demanded a DPoP nonce. Callers retry
    /// once with the attached nonce; this never escapes the client modules.
    #[error("server requires a DPoP nonce")]
    NonceRequired { nonce: String },

    #[error("unknown or already-used authorization state")]
    InvalidState,

    #[error("token request rejected: {0}")]
    TokenExchange(String),

    /// The authorization server failed without rejecting the request (5xx
    /// and the like). Unlike `TokenExchange`, this is not a verdict on the
    /// grant itself.
    #[error("authorization server unavailable (HTTP {status}): {message}")]
    AuthServerUnavailable { status: u16, message: String },

    #[error("session expired, login required")]
    SessionExpired,

    #[error("network error talking to {context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Internal(String),
}

impl AuthError {
    pub fn resolution(stage: ResolutionStage, message: impl Into<String>) -> Self {
        AuthError::Resolution {
            stage,
            message: message.into(),
        }
    }

    pub fn transport(context: &'static str, source: reqwest::Error) -> Self {
        AuthError::Transport { context, source }
    }

    pub fn internal(message: impl std::fmt::Display) -> Self {
        AuthError::Internal(message.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Resolution { .. } => StatusCode::BAD_REQUEST,
            AuthError::Capability(_) => StatusCode::BAD_GATEWAY,
            AuthError::InvalidState => StatusCode::BAD_REQUEST,
            AuthError::TokenExchange(_) => StatusCode::BAD_GATEWAY,
            AuthError::AuthServerUnavailable { .. } => StatusCode::BAD_GATEWAY,
            AuthError::SessionExpired => StatusCode::UNAUTHORIZED,
            AuthError::Transport { .. } => StatusCode::BAD_GATEWAY,
            AuthError::NonceRequired { .. } | AuthError::Database(_) | AuthError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            AuthError::Resolution { stage, .. } => {
                format!("Could not look up that account ({stage} failed). Check the handle and try again.")
            }
            AuthError::Capability(cap) => {
                format!("This account's provider does not support the required login mechanism ({cap}).")
            }
            AuthError::InvalidState => {
                "This login link is no longer valid. Please start over.".to_string()
            }
            AuthError::TokenExchange(_) => {
                "The login provider rejected the request. Please try again.".to_string()
            }
            AuthError::AuthServerUnavailable { .. } => {
                "The login provider is temporarily unavailable. Please try again.".to_string()
            }
            AuthError::SessionExpired => {
                "Your session has expired. Please log in again.".to_string()
            }
            AuthError::Transport { .. } => {
                "Could not reach the login provider. Please try again.".to_string()
            }
            AuthError::NonceRequired { .. } | AuthError::Database(_) | AuthError::Internal(_) => {
                "Something went wrong on our end.".to_string()
            }
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Internal(err.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self, "auth error");
        let page = crate::routes::error_page(&self.user_message());
        (self.status(), page).into_response()
    }
}

#[derive(Debug)]
pub struct ServerError<R: IntoResponse>(pub(crate) color_eyre::Report, pub(crate) R);

pub type ServerResult<S, F = Response> = Result<S, ServerError<F>>;

impl<R: IntoResponse> IntoResponse for ServerError<R> {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self.0, "Request Error");
        self.1.into_response()
    }
}

impl<E> From<E> for ServerError<StatusCode>
where
    E: Into<color_eyre::Report>,
{
    fn from(err: E) -> Self {
        ServerError(err.into(), StatusCode::INTERNAL_SERVER_ERROR)
    }
}

pub(crate) trait WithRedirect<T> {
    fn with_redirect(self, redirect: Redirect) -> Result<T, ServerError<Redirect>>;
}

impl<T, E> WithRedirect<T> for Result<T, E>
where
    E: Into<color_eyre::Report>,
{
    fn with_redirect(self, redirect: Redirect) -> Result<T, ServerError<Redirect>> {
        match self {
            Ok(val) => Ok(val),
            Err(err) => Err(ServerError(err.into(), redirect)),
        }
    }
}
