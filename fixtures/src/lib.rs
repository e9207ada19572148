//! An in-process mock of the atproto identity network for tests: handle
//! resolver, PLC directory, PDS metadata, and an OAuth authorization
//! server with PAR and token endpoints, all on one loopback listener.
//!
//! The mock counts calls to the interesting endpoints and can be told to
//! demand DPoP nonces or reject refresh grants, so tests can assert on
//! retry and refresh behavior rather than just happy paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Form, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

#[derive(Debug, Clone)]
pub struct MockNetworkConfig {
    pub did: String,
    pub handle: String,
    /// Reject this many initial PAR attempts with `use_dpop_nonce`.
    pub par_nonce_challenges: usize,
    /// Reject this many initial resource requests with a 401 nonce
    /// challenge in WWW-Authenticate.
    pub pds_nonce_challenges: usize,
    /// Answer every refresh grant with `invalid_grant`.
    pub reject_refresh: bool,
    /// Answer every refresh grant with HTTP 503.
    pub refresh_outage: bool,
    /// Artificial latency on refresh grants, to widen race windows.
    pub refresh_delay_ms: u64,
}

impl Default for MockNetworkConfig {
    fn default() -> Self {
        Self {
            did: "did:example:alice".to_string(),
            handle: "alice.example".to_string(),
            par_nonce_challenges: 0,
            pds_nonce_challenges: 0,
            reject_refresh: false,
            refresh_outage: false,
            refresh_delay_ms: 0,
        }
    }
}

struct Inner {
    config: MockNetworkConfig,
    base_url: String,
    par_calls: AtomicUsize,
    token_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    pds_calls: AtomicUsize,
}

/// A running mock network. Dropping it does not stop the server; the
/// spawned task lives for the remainder of the test process.
pub struct MockNetwork {
    inner: Arc<Inner>,
}

impl MockNetwork {
    pub async fn spawn(config: MockNetworkConfig) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);

        let inner = Arc::new(Inner {
            config,
            base_url,
            par_calls: AtomicUsize::new(0),
            token_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            pds_calls: AtomicUsize::new(0),
        });

        let router = Router::new()
            .route(
                "/xrpc/com.atproto.identity.resolveHandle",
                get(resolve_handle),
            )
            .route(
                "/.well-known/oauth-protected-resource",
                get(protected_resource),
            )
            .route(
                "/.well-known/oauth-authorization-server",
                get(authserver_metadata),
            )
            .route("/oauth/par", post(pushed_authorization))
            .route("/oauth/token", post(token))
            .route("/xrpc/com.example.ping", get(ping))
            .route("/:did", get(did_document))
            .with_state(inner.clone());

        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                tracing::error!("mock network server failed: {err}");
            }
        });

        Ok(Self { inner })
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn par_calls(&self) -> usize {
        self.inner.par_calls.load(Ordering::SeqCst)
    }

    /// Authorization-code exchanges only; refreshes are counted separately.
    pub fn token_calls(&self) -> usize {
        self.inner.token_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn pds_calls(&self) -> usize {
        self.inner.pds_calls.load(Ordering::SeqCst)
    }
}

async fn resolve_handle(
    State(inner): State<Arc<Inner>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.get("handle").map(String::as_str) == Some(inner.config.handle.as_str()) {
        Json(serde_json::json!({ "did": inner.config.did })).into_response()
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "InvalidRequest", "message": "Unable to resolve handle" })),
        )
            .into_response()
    }
}

async fn did_document(State(inner): State<Arc<Inner>>, Path(did): Path<String>) -> Response {
    if did != inner.config.did {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "message": "DID not registered" })),
        )
            .into_response();
    }

    Json(serde_json::json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": inner.config.did,
        "alsoKnownAs": [format!("at://{}", inner.config.handle)],
        "service": [{
            "id": "#atproto_pds",
            "type": "AtprotoPersonalDataServer",
            "serviceEndpoint": inner.base_url,
        }],
    }))
    .into_response()
}

async fn protected_resource(State(inner): State<Arc<Inner>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "resource": inner.base_url,
        "authorization_servers": [inner.base_url],
    }))
}

async fn authserver_metadata(State(inner): State<Arc<Inner>>) -> Json<serde_json::Value> {
    let base = &inner.base_url;
    Json(serde_json::json!({
        "issuer": base,
        "pushed_authorization_request_endpoint": format!("{base}/oauth/par"),
        "authorization_endpoint": format!("{base}/oauth/authorize"),
        "token_endpoint": format!("{base}/oauth/token"),
        "scopes_supported": ["atproto", "transition:generic"],
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "dpop_signing_alg_values_supported": ["ES256"],
        "code_challenge_methods_supported": ["S256"],
        "token_endpoint_auth_methods_supported": ["none"],
        "require_pushed_authorization_requests": true,
    }))
}

async fn pushed_authorization(
    State(inner): State<Arc<Inner>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    let attempt = inner.par_calls.fetch_add(1, Ordering::SeqCst);

    if attempt < inner.config.par_nonce_challenges {
        return (
            StatusCode::BAD_REQUEST,
            [("DPoP-Nonce", format!("par-nonce-{attempt}"))],
            Json(serde_json::json!({
                "error": "use_dpop_nonce",
                "error_description": "Authorization server requires nonce in DPoP proof",
            })),
        )
            .into_response();
    }

    for required in ["client_id", "state", "code_challenge", "redirect_uri"] {
        if !params.contains_key(required) {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": "invalid_request",
                    "error_description": format!("missing {required}"),
                })),
            )
                .into_response();
        }
    }

    (
        StatusCode::CREATED,
        [("DPoP-Nonce", "par-nonce-ok".to_string())],
        Json(serde_json::json!({
            "request_uri": "urn:ietf:params:oauth:request_uri:mock-req-1",
            "expires_in": 60,
        })),
    )
        .into_response()
}

/// A stand-in resource endpoint. Requires a DPoP-bound access token and
/// runs its own nonce sequence, like a real PDS.
async fn ping(State(inner): State<Arc<Inner>>, headers: axum::http::HeaderMap) -> Response {
    let attempt = inner.pds_calls.fetch_add(1, Ordering::SeqCst);

    let has_dpop_auth = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("DPoP "))
        .unwrap_or(false);
    if !has_dpop_auth || !headers.contains_key("DPoP") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid_token" })),
        )
            .into_response();
    }

    if attempt < inner.config.pds_nonce_challenges {
        return (
            StatusCode::UNAUTHORIZED,
            [
                ("DPoP-Nonce", format!("pds-nonce-{attempt}")),
                (
                    "WWW-Authenticate",
                    "DPoP error=\"use_dpop_nonce\", error_description=\"Resource server requires nonce in DPoP proof\"".to_string(),
                ),
            ],
            Json(serde_json::json!({ "error": "use_dpop_nonce" })),
        )
            .into_response();
    }

    (
        [("DPoP-Nonce", "pds-nonce-ok".to_string())],
        Json(serde_json::json!({ "ok": true })),
    )
        .into_response()
}

async fn token(
    State(inner): State<Arc<Inner>>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    match params.get("grant_type").map(String::as_str) {
        Some("authorization_code") => {
            inner.token_calls.fetch_add(1, Ordering::SeqCst);

            if !params.contains_key("code") || !params.contains_key("code_verifier") {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": "invalid_request" })),
                )
                    .into_response();
            }

            Json(serde_json::json!({
                "access_token": "tok1",
                "refresh_token": "ref1",
                "token_type": "DPoP",
                "expires_in": 3600,
                "scope": "atproto transition:generic",
                "sub": inner.config.did,
            }))
            .into_response()
        }
        Some("refresh_token") => {
            inner.refresh_calls.fetch_add(1, Ordering::SeqCst);

            if inner.config.refresh_delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(
                    inner.config.refresh_delay_ms,
                ))
                .await;
            }

            if inner.config.refresh_outage {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({
                        "error": "temporarily_unavailable",
                        "error_description": "authorization server overloaded",
                    })),
                )
                    .into_response();
            }

            if inner.config.reject_refresh {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": "invalid_grant",
                        "error_description": "refresh token revoked",
                    })),
                )
                    .into_response();
            }

            Json(serde_json::json!({
                "access_token": "tok2",
                "refresh_token": "ref2",
                "token_type": "DPoP",
                "expires_in": 3600,
                "sub": inner.config.did,
            }))
            .into_response()
        }
        _ => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "unsupported_grant_type" })),
        )
            .into_response(),
    }
}
