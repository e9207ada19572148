//! End-to-end tests of the login flow and session store against an
//! in-process mock of the identity network.

use std::str::FromStr;

use chrono::{Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use url::Url;

use bibliome::encryption::EncryptionKey;
use bibliome::errors::AuthError;
use bibliome::oauth::dpop::DpopKey;
use bibliome::oauth::session::OAuthSession;
use bibliome::oauth::{db, flow, session};
use bibliome::pds;
use bibliome::state::{AppConfig, AppState};
use fixtures::{MockNetwork, MockNetworkConfig};

const ALICE_DID: &str = "did:example:alice";

async fn test_state(mock: &MockNetwork) -> AppState {
    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::migrate!("../migrations").run(&pool).await.unwrap();

    let config = AppConfig {
        app_url: "http://127.0.0.1:8080".to_string(),
        appview_url: mock.base_url().to_string(),
        plc_directory_url: mock.base_url().to_string(),
        oauth_scope: "atproto transition:generic".to_string(),
    };

    AppState::new(
        pool,
        config,
        tower_cookies::Key::generate(),
        EncryptionKey::generate(),
    )
    .unwrap()
}

fn state_param(authorization_url: &str) -> String {
    let url = Url::parse(authorization_url).unwrap();
    url.query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.to_string())
        .unwrap()
}

async fn seed_session(app: &AppState, mock: &MockNetwork, expires_in_secs: i64) -> OAuthSession {
    let session = OAuthSession {
        did: ALICE_DID.to_string(),
        handle: "alice.example".to_string(),
        pds_url: mock.base_url().to_string(),
        authserver_iss: mock.base_url().to_string(),
        access_token: "tok1".to_string(),
        refresh_token: "ref1".to_string(),
        access_token_expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        dpop_private_jwk: DpopKey::generate().to_jwk_json().unwrap(),
        dpop_authserver_nonce: None,
        dpop_pds_nonce: None,
    };
    db::upsert_session(app, &session).await.unwrap();
    session
}

#[tokio::test]
async fn full_login_flow_establishes_session() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;

    let start = flow::begin_login(&app, "alice.example").await.unwrap();

    let url = Url::parse(&start.authorization_url).unwrap();
    assert!(url.as_str().starts_with(mock.base_url()));
    assert!(url
        .query_pairs()
        .any(|(k, v)| k == "request_uri" && v.contains("mock-req-1")));
    assert_eq!(state_param(&start.authorization_url), start.state);

    let established = flow::complete_login(&app, "code-1", &start.state, Some(mock.base_url()))
        .await
        .unwrap();
    assert_eq!(established.did, ALICE_DID);
    assert_eq!(established.handle, "alice.example");
    assert_eq!(established.access_token, "tok1");
    assert_eq!(established.refresh_token, "ref1");

    assert_eq!(mock.par_calls(), 1);
    assert_eq!(mock.token_calls(), 1);

    let stored = db::get_session(&app, ALICE_DID).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "tok1");
    assert_eq!(stored.authserver_iss, mock.base_url());
}

#[tokio::test]
async fn tokens_are_encrypted_at_rest() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;
    seed_session(&app, &mock, 3600).await;

    let row = sqlx::query("SELECT access_token, dpop_private_jwk FROM oauth_sessions WHERE did = ?")
        .bind(ALICE_DID)
        .fetch_one(&app.db)
        .await
        .unwrap();

    let raw_token: String = row.try_get("access_token").unwrap();
    let raw_jwk: String = row.try_get("dpop_private_jwk").unwrap();
    assert_ne!(raw_token, "tok1");
    assert!(!raw_jwk.contains("P-256"));
}

#[tokio::test]
async fn state_token_is_single_use() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;

    let start = flow::begin_login(&app, "alice.example").await.unwrap();
    flow::complete_login(&app, "code-1", &start.state, None)
        .await
        .unwrap();

    let second = flow::complete_login(&app, "code-1", &start.state, None).await;
    assert!(matches!(second, Err(AuthError::InvalidState)));
    // The second attempt never reached the token endpoint.
    assert_eq!(mock.token_calls(), 1);
}

#[tokio::test]
async fn unknown_state_is_rejected_without_session() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;

    let result = flow::complete_login(&app, "code-1", "never-issued-state", None).await;
    assert!(matches!(result, Err(AuthError::InvalidState)));
    assert!(db::get_session(&app, ALICE_DID).await.unwrap().is_none());
    assert_eq!(mock.token_calls(), 0);
}

#[tokio::test]
async fn expired_pending_request_is_treated_as_absent() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;

    let start = flow::begin_login(&app, "alice.example").await.unwrap();

    sqlx::query("UPDATE auth_requests SET created_at = ? WHERE state = ?")
        .bind(Utc::now() - Duration::seconds(7200))
        .bind(&start.state)
        .execute(&app.db)
        .await
        .unwrap();

    let result = flow::complete_login(&app, "code-1", &start.state, None).await;
    assert!(matches!(result, Err(AuthError::InvalidState)));
    assert_eq!(mock.token_calls(), 0);
}

#[tokio::test]
async fn login_accepts_a_bare_did() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;

    let start = flow::begin_login(&app, ALICE_DID).await.unwrap();
    let established = flow::complete_login(&app, "code-1", &start.state, None)
        .await
        .unwrap();

    assert_eq!(established.did, ALICE_DID);
    assert_eq!(established.handle, "alice.example");
}

#[tokio::test]
async fn login_from_a_server_url_resolves_identity_at_callback() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;

    let start = flow::begin_login(&app, mock.base_url()).await.unwrap();

    // No identity is pinned yet; the callback fills it in from `sub`.
    let row = sqlx::query("SELECT did, handle FROM auth_requests WHERE state = ?")
        .bind(&start.state)
        .fetch_one(&app.db)
        .await
        .unwrap();
    let pending_did: Option<String> = row.try_get("did").unwrap();
    assert!(pending_did.is_none());

    let established = flow::complete_login(&app, "code-1", &start.state, Some(mock.base_url()))
        .await
        .unwrap();
    assert_eq!(established.did, ALICE_DID);
    assert_eq!(established.handle, "alice.example");
    assert_eq!(established.pds_url, mock.base_url());

    let stored = db::get_session(&app, ALICE_DID).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "tok1");
}

#[tokio::test]
async fn server_url_login_rejects_a_foreign_issuer() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let foreign = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    // Identity lookups go to `mock`, so alice's real authorization server is
    // `mock`; the login was started against `foreign`.
    let app = test_state(&mock).await;

    let start = flow::begin_login(&app, foreign.base_url()).await.unwrap();
    let result =
        flow::complete_login(&app, "code-1", &start.state, Some(foreign.base_url())).await;

    assert!(matches!(result, Err(AuthError::TokenExchange(_))));
    assert!(db::get_session(&app, ALICE_DID).await.unwrap().is_none());
}

#[tokio::test]
async fn callback_issuer_mismatch_is_rejected() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;

    let start = flow::begin_login(&app, "alice.example").await.unwrap();
    let result =
        flow::complete_login(&app, "code-1", &start.state, Some("https://evil.example")).await;

    assert!(matches!(result, Err(AuthError::TokenExchange(_))));
    assert!(db::get_session(&app, ALICE_DID).await.unwrap().is_none());
}

#[tokio::test]
async fn par_nonce_challenge_is_retried_exactly_once() {
    let mock = MockNetwork::spawn(MockNetworkConfig {
        par_nonce_challenges: 1,
        ..Default::default()
    })
    .await
    .unwrap();
    let app = test_state(&mock).await;

    let start = flow::begin_login(&app, "alice.example").await.unwrap();
    assert_eq!(mock.par_calls(), 2);
    assert!(!start.state.is_empty());
}

#[tokio::test]
async fn persistent_nonce_challenges_never_loop() {
    let mock = MockNetwork::spawn(MockNetworkConfig {
        par_nonce_challenges: usize::MAX,
        ..Default::default()
    })
    .await
    .unwrap();
    let app = test_state(&mock).await;

    let result = flow::begin_login(&app, "alice.example").await;
    assert!(matches!(result, Err(AuthError::TokenExchange(_))));
    // One attempt plus the single permitted retry.
    assert_eq!(mock.par_calls(), 2);
}

#[tokio::test]
async fn fresh_token_is_returned_without_refresh() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;
    seed_session(&app, &mock, 3600).await;

    let fresh = session::ensure_fresh(&app, ALICE_DID).await.unwrap();
    assert_eq!(fresh.access_token, "tok1");
    assert_eq!(mock.refresh_calls(), 0);
}

#[tokio::test]
async fn token_within_margin_is_refreshed() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;
    // Nominally valid for another 10 seconds, inside the 60 second margin.
    seed_session(&app, &mock, 10).await;

    let fresh = session::ensure_fresh(&app, ALICE_DID).await.unwrap();
    assert_eq!(fresh.access_token, "tok2");
    assert_eq!(fresh.refresh_token, "ref2");
    assert_eq!(mock.refresh_calls(), 1);

    let stored = db::get_session(&app, ALICE_DID).await.unwrap().unwrap();
    assert_eq!(stored.access_token, "tok2");
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let mock = MockNetwork::spawn(MockNetworkConfig {
        refresh_delay_ms: 100,
        ..Default::default()
    })
    .await
    .unwrap();
    let app = test_state(&mock).await;
    seed_session(&app, &mock, -10).await;

    let results = futures::future::join_all(
        (0..5).map(|_| session::ensure_fresh(&app, ALICE_DID)),
    )
    .await;

    for result in results {
        assert_eq!(result.unwrap().access_token, "tok2");
    }
    assert_eq!(mock.refresh_calls(), 1);
    // The last caller out releases the per-DID lock entry.
    assert!(app.refresh_locks.is_empty());
}

#[tokio::test]
async fn refresh_locks_are_released_after_use() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;
    seed_session(&app, &mock, -10).await;

    session::ensure_fresh(&app, ALICE_DID).await.unwrap();

    assert_eq!(mock.refresh_calls(), 1);
    assert!(!app.refresh_locks.contains_key(ALICE_DID));
}

#[tokio::test]
async fn transient_refresh_failure_keeps_the_session() {
    let mock = MockNetwork::spawn(MockNetworkConfig {
        refresh_outage: true,
        ..Default::default()
    })
    .await
    .unwrap();
    let app = test_state(&mock).await;
    seed_session(&app, &mock, -10).await;

    let result = session::ensure_fresh(&app, ALICE_DID).await;
    assert!(matches!(
        result,
        Err(AuthError::AuthServerUnavailable { status: 503, .. })
    ));

    // The grant was never ruled on, so the session survives for a retry.
    assert!(db::get_session(&app, ALICE_DID).await.unwrap().is_some());
    assert_eq!(mock.refresh_calls(), 1);
}

#[tokio::test]
async fn rejected_refresh_deletes_the_session() {
    let mock = MockNetwork::spawn(MockNetworkConfig {
        reject_refresh: true,
        ..Default::default()
    })
    .await
    .unwrap();
    let app = test_state(&mock).await;
    seed_session(&app, &mock, -10).await;

    let first = session::ensure_fresh(&app, ALICE_DID).await;
    assert!(matches!(first, Err(AuthError::SessionExpired)));
    assert!(db::get_session(&app, ALICE_DID).await.unwrap().is_none());

    // Subsequent calls fail fast instead of re-attempting the grant.
    let second = session::ensure_fresh(&app, ALICE_DID).await;
    assert!(matches!(second, Err(AuthError::SessionExpired)));
    assert_eq!(mock.refresh_calls(), 1);
}

#[tokio::test]
async fn sweep_removes_only_expired_pending_requests() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;

    let stale = flow::begin_login(&app, "alice.example").await.unwrap();
    let live = flow::begin_login(&app, "alice.example").await.unwrap();

    sqlx::query("UPDATE auth_requests SET created_at = ? WHERE state = ?")
        .bind(Utc::now() - Duration::seconds(7200))
        .bind(&stale.state)
        .execute(&app.db)
        .await
        .unwrap();

    let swept = db::cleanup_expired_requests(&app).await.unwrap();
    assert_eq!(swept, 1);

    assert!(matches!(
        flow::complete_login(&app, "code-1", &stale.state, None).await,
        Err(AuthError::InvalidState)
    ));
    flow::complete_login(&app, "code-1", &live.state, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn authed_pds_request_carries_dpop_binding() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;
    seed_session(&app, &mock, 3600).await;

    let url = format!("{}/xrpc/com.example.ping", mock.base_url());
    let response = pds::authed_request(&app, ALICE_DID, reqwest::Method::GET, &url, None)
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(mock.pds_calls(), 1);

    // The server's nonce is remembered for the next request.
    let stored = db::get_session(&app, ALICE_DID).await.unwrap().unwrap();
    assert_eq!(stored.dpop_pds_nonce.as_deref(), Some("pds-nonce-ok"));
}

#[tokio::test]
async fn pds_nonce_challenge_is_retried_once() {
    let mock = MockNetwork::spawn(MockNetworkConfig {
        pds_nonce_challenges: 1,
        ..Default::default()
    })
    .await
    .unwrap();
    let app = test_state(&mock).await;
    seed_session(&app, &mock, 3600).await;

    let url = format!("{}/xrpc/com.example.ping", mock.base_url());
    let response = pds::authed_request(&app, ALICE_DID, reqwest::Method::GET, &url, None)
        .await
        .unwrap();

    assert!(response.status().is_success());
    assert_eq!(mock.pds_calls(), 2);
}

#[tokio::test]
async fn persistent_pds_nonce_challenge_returns_the_response() {
    let mock = MockNetwork::spawn(MockNetworkConfig {
        pds_nonce_challenges: usize::MAX,
        ..Default::default()
    })
    .await
    .unwrap();
    let app = test_state(&mock).await;
    seed_session(&app, &mock, 3600).await;

    let url = format!("{}/xrpc/com.example.ping", mock.base_url());
    let response = pds::authed_request(&app, ALICE_DID, reqwest::Method::GET, &url, None)
        .await
        .unwrap();

    // One retry, then the 401 is handed back to the caller.
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(mock.pds_calls(), 2);
}

#[tokio::test]
async fn missing_session_surfaces_as_expired() {
    let mock = MockNetwork::spawn(MockNetworkConfig::default()).await.unwrap();
    let app = test_state(&mock).await;

    let result = session::ensure_fresh(&app, "did:example:nobody").await;
    assert!(matches!(result, Err(AuthError::SessionExpired)));
}
