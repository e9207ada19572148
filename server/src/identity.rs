//! Identity resolution: handle or DID in, authorization server metadata out.
//!
//! The pipeline is handle -> DID (AppView lookup), DID -> DID document (PLC
//! directory), document -> PDS endpoint, PDS -> authorization server
//! (protected-resource metadata), issuer -> server metadata. Every step is
//! re-fetched per login; nothing here is cached.

use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::errors::{AuthError, ResolutionStage};
use crate::security::{is_safe_url, is_valid_did, is_valid_handle};
use crate::state::AppConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct DidDocument {
    pub id: String,
    #[serde(default, rename = "alsoKnownAs")]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub pushed_authorization_request_endpoint: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub dpop_signing_alg_values_supported: Vec<String>,
    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,
}

impl AuthServerMetadata {
    /// The PAR endpoint, guaranteed present by [`verify_capabilities`].
    pub fn par_endpoint(&self) -> Result<&str, AuthError> {
        self.pushed_authorization_request_endpoint
            .as_deref()
            .ok_or_else(|| {
                AuthError::Capability("pushed_authorization_request_endpoint".to_string())
            })
    }
}

/// Everything the flow coordinator needs to start a login for one account.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub did: String,
    pub handle: String,
    pub pds_url: String,
    pub authserver: AuthServerMetadata,
}

/// Resolves a user-supplied handle or DID all the way to authorization
/// server metadata, with bidirectional handle verification.
pub async fn resolve_identity(
    http: &reqwest::Client,
    config: &AppConfig,
    identifier: &str,
) -> Result<ResolvedIdentity, AuthError> {
    let identifier = identifier.trim().trim_start_matches('@');
    info!(identifier, "resolving identity");

    let (did, handle, document) = if identifier.starts_with("did:") {
        resolve_did_first(http, config, identifier).await?
    } else {
        resolve_handle_first(http, config, identifier).await?
    };

    let pds_url = extract_pds_endpoint(&document)?;
    debug!(%did, %pds_url, "found PDS endpoint");

    let authserver_url = resolve_pds_authserver(http, &pds_url).await?;
    let authserver = fetch_authserver_meta(http, &authserver_url).await?;
    verify_capabilities(&authserver)?;

    info!(%did, %handle, issuer = %authserver.issuer, "identity resolved");
    Ok(ResolvedIdentity {
        did,
        handle,
        pds_url,
        authserver,
    })
}

/// Resolves a user-supplied PDS or authorization server URL to verified
/// server metadata. The account identity stays unknown until the token
/// exchange returns `sub`.
pub async fn resolve_server_hint(
    http: &reqwest::Client,
    url: &str,
) -> Result<AuthServerMetadata, AuthError> {
    let url = url.trim().trim_end_matches('/');
    if !is_safe_url(url) {
        return Err(AuthError::resolution(
            ResolutionStage::PdsMetadata,
            format!("unsafe server URL: {url}"),
        ));
    }

    let authserver_url = resolve_pds_authserver(http, url).await?;
    let authserver = fetch_authserver_meta(http, &authserver_url).await?;
    verify_capabilities(&authserver)?;

    info!(issuer = %authserver.issuer, "server hint resolved");
    Ok(authserver)
}

async fn resolve_handle_first(
    http: &reqwest::Client,
    config: &AppConfig,
    handle: &str,
) -> Result<(String, String, DidDocument), AuthError> {
    if !is_valid_handle(handle) {
        return Err(AuthError::resolution(
            ResolutionStage::Handle,
            format!("invalid handle format: {handle}"),
        ));
    }

    let did = resolve_handle_to_did(http, config, handle).await?;
    let document = fetch_did_document(http, config, &did).await?;

    // The document must claim the handle back, or anyone could log in as a
    // handle their DID never owned.
    if !document_claims_handle(&document, handle) {
        return Err(AuthError::resolution(
            ResolutionStage::Handle,
            format!("DID document for {did} does not claim handle {handle}"),
        ));
    }

    Ok((did, handle.to_string(), document))
}

async fn resolve_did_first(
    http: &reqwest::Client,
    config: &AppConfig,
    did: &str,
) -> Result<(String, String, DidDocument), AuthError> {
    if !is_valid_did(did) {
        return Err(AuthError::resolution(
            ResolutionStage::DidDocument,
            format!("invalid DID format: {did}"),
        ));
    }

    let document = fetch_did_document(http, config, did).await?;
    let handle = extract_handle(&document).ok_or_else(|| {
        AuthError::resolution(
            ResolutionStage::DidDocument,
            format!("DID document for {did} claims no handle"),
        )
    })?;

    // Back-check: the claimed handle must resolve to the same DID.
    let resolved_did = resolve_handle_to_did(http, config, &handle).await?;
    if resolved_did != did {
        return Err(AuthError::resolution(
            ResolutionStage::Handle,
            format!("handle {handle} resolves to {resolved_did}, not {did}"),
        ));
    }

    Ok((did.to_string(), handle, document))
}

#[derive(Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

async fn resolve_handle_to_did(
    http: &reqwest::Client,
    config: &AppConfig,
    handle: &str,
) -> Result<String, AuthError> {
    let url = format!(
        "{}/xrpc/com.atproto.identity.resolveHandle",
        config.appview_url
    );

    let response = http
        .get(&url)
        .query(&[("handle", handle)])
        .send()
        .await
        .map_err(|e| AuthError::transport("appview", e))?;

    if !response.status().is_success() {
        return Err(AuthError::resolution(
            ResolutionStage::Handle,
            format!("appview returned HTTP {}", response.status()),
        ));
    }

    let body: ResolveHandleResponse = response.json().await.map_err(|e| {
        AuthError::resolution(ResolutionStage::Handle, format!("bad appview response: {e}"))
    })?;

    if !is_valid_did(&body.did) {
        return Err(AuthError::resolution(
            ResolutionStage::Handle,
            format!("appview returned invalid DID: {}", body.did),
        ));
    }

    Ok(body.did)
}

async fn fetch_did_document(
    http: &reqwest::Client,
    config: &AppConfig,
    did: &str,
) -> Result<DidDocument, AuthError> {
    let url = format!("{}/{}", config.plc_directory_url, did);
    debug!(%url, "fetching DID document");

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| AuthError::transport("plc directory", e))?;

    if !response.status().is_success() {
        return Err(AuthError::resolution(
            ResolutionStage::DidDocument,
            format!("PLC directory returned HTTP {}", response.status()),
        ));
    }

    let document: DidDocument = response.json().await.map_err(|e| {
        AuthError::resolution(
            ResolutionStage::DidDocument,
            format!("bad DID document: {e}"),
        )
    })?;

    if document.id != did {
        return Err(AuthError::resolution(
            ResolutionStage::DidDocument,
            format!("DID document id {} does not match {did}", document.id),
        ));
    }

    Ok(document)
}

fn extract_handle(document: &DidDocument) -> Option<String> {
    document
        .also_known_as
        .iter()
        .find_map(|aka| aka.strip_prefix("at://"))
        .map(str::to_string)
}

fn document_claims_handle(document: &DidDocument, handle: &str) -> bool {
    document
        .also_known_as
        .iter()
        .any(|aka| aka.strip_prefix("at://") == Some(handle))
}

fn extract_pds_endpoint(document: &DidDocument) -> Result<String, AuthError> {
    let service = document
        .service
        .iter()
        .find(|s| s.id.ends_with("#atproto_pds") && s.service_type == "AtprotoPersonalDataServer")
        .ok_or_else(|| {
            AuthError::resolution(
                ResolutionStage::DidDocument,
                "no PDS service endpoint in DID document",
            )
        })?;

    if !is_safe_url(&service.service_endpoint) {
        return Err(AuthError::resolution(
            ResolutionStage::DidDocument,
            format!("unsafe PDS endpoint: {}", service.service_endpoint),
        ));
    }

    Ok(service.service_endpoint.trim_end_matches('/').to_string())
}

#[derive(Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// Maps a PDS to its authorization server. A PDS that serves no
/// protected-resource metadata is assumed to be its own authorization
/// server, which is how single-host deployments advertise themselves.
async fn resolve_pds_authserver(
    http: &reqwest::Client,
    pds_url: &str,
) -> Result<String, AuthError> {
    let url = format!("{pds_url}/.well-known/oauth-protected-resource");

    let fetched: Option<ProtectedResourceMetadata> = match http.get(&url).send().await {
        Ok(response) if response.status().is_success() => response.json().await.ok(),
        Ok(_) | Err(_) => None,
    };

    let authserver_url = match fetched.and_then(|meta| meta.authorization_servers.into_iter().next())
    {
        Some(url) => url,
        None => pds_url.to_string(),
    };

    if !is_safe_url(&authserver_url) {
        return Err(AuthError::resolution(
            ResolutionStage::PdsMetadata,
            format!("unsafe authorization server URL: {authserver_url}"),
        ));
    }

    Ok(authserver_url.trim_end_matches('/').to_string())
}

async fn fetch_authserver_meta(
    http: &reqwest::Client,
    authserver_url: &str,
) -> Result<AuthServerMetadata, AuthError> {
    let url = format!("{authserver_url}/.well-known/oauth-authorization-server");
    debug!(%url, "fetching authorization server metadata");

    let response = http
        .get(&url)
        .send()
        .await
        .map_err(|e| AuthError::transport("authorization server", e))?;

    if !response.status().is_success() {
        return Err(AuthError::resolution(
            ResolutionStage::AuthServerMetadata,
            format!("authorization server returned HTTP {}", response.status()),
        ));
    }

    let metadata: AuthServerMetadata = response.json().await.map_err(|e| {
        AuthError::resolution(
            ResolutionStage::AuthServerMetadata,
            format!("bad authorization server metadata: {e}"),
        )
    })?;

    // The issuer must match the origin we fetched from, port included.
    let expected_issuer = url_origin(authserver_url).ok_or_else(|| {
        AuthError::resolution(
            ResolutionStage::AuthServerMetadata,
            format!("unparseable authorization server URL: {authserver_url}"),
        )
    })?;
    let actual_issuer = url_origin(&metadata.issuer).unwrap_or_default();

    if actual_issuer != expected_issuer {
        return Err(AuthError::resolution(
            ResolutionStage::AuthServerMetadata,
            format!("issuer mismatch: {} != {expected_issuer}", metadata.issuer),
        ));
    }

    Ok(metadata)
}

fn url_origin(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    Some(parsed.origin().ascii_serialization())
}

/// The OAuth profile this app depends on: PAR, S256 code challenges, ES256
/// DPoP keys, and the `atproto` scope. Anything less gets a hard error
/// before we send the user anywhere.
pub fn verify_capabilities(metadata: &AuthServerMetadata) -> Result<(), AuthError> {
    metadata.par_endpoint()?;

    if !metadata
        .code_challenge_methods_supported
        .iter()
        .any(|m| m == "S256")
    {
        return Err(AuthError::Capability(
            "S256 code challenge method".to_string(),
        ));
    }

    if !metadata
        .dpop_signing_alg_values_supported
        .iter()
        .any(|alg| alg == "ES256")
    {
        return Err(AuthError::Capability("ES256 DPoP signing".to_string()));
    }

    if !metadata.scopes_supported.iter().any(|s| s == "atproto") {
        return Err(AuthError::Capability("atproto scope".to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> AuthServerMetadata {
        AuthServerMetadata {
            issuer: "https://auth.example".to_string(),
            pushed_authorization_request_endpoint: Some("https://auth.example/par".to_string()),
            authorization_endpoint: "https://auth.example/authorize".to_string(),
            token_endpoint: "https://auth.example/token".to_string(),
            scopes_supported: vec!["atproto".to_string(), "transition:generic".to_string()],
            dpop_signing_alg_values_supported: vec!["ES256".to_string()],
            code_challenge_methods_supported: vec!["S256".to_string()],
        }
    }

    #[test]
    fn capabilities_pass_for_conforming_server() {
        assert!(verify_capabilities(&metadata()).is_ok());
    }

    #[test]
    fn missing_par_endpoint_is_a_capability_error() {
        let mut meta = metadata();
        meta.pushed_authorization_request_endpoint = None;
        assert!(matches!(
            verify_capabilities(&meta),
            Err(AuthError::Capability(_))
        ));
    }

    #[test]
    fn missing_dpop_alg_is_a_capability_error() {
        let mut meta = metadata();
        meta.dpop_signing_alg_values_supported = vec!["RS256".to_string()];
        assert!(matches!(
            verify_capabilities(&meta),
            Err(AuthError::Capability(_))
        ));
    }

    #[test]
    fn missing_atproto_scope_is_a_capability_error() {
        let mut meta = metadata();
        meta.scopes_supported = vec!["openid".to_string()];
        assert!(matches!(
            verify_capabilities(&meta),
            Err(AuthError::Capability(_))
        ));
    }

    #[test]
    fn pds_endpoint_extraction() {
        let doc = DidDocument {
            id: "did:plc:abc".to_string(),
            also_known_as: vec!["at://alice.example".to_string()],
            service: vec![DidService {
                id: "#atproto_pds".to_string(),
                service_type: "AtprotoPersonalDataServer".to_string(),
                service_endpoint: "https://pds.example".to_string(),
            }],
        };

        assert_eq!(extract_pds_endpoint(&doc).unwrap(), "https://pds.example");
        assert_eq!(extract_handle(&doc).as_deref(), Some("alice.example"));
        assert!(document_claims_handle(&doc, "alice.example"));
        assert!(!document_claims_handle(&doc, "mallory.example"));
    }

    #[test]
    fn unsafe_pds_endpoint_rejected() {
        let doc = DidDocument {
            id: "did:plc:abc".to_string(),
            also_known_as: vec![],
            service: vec![DidService {
                id: "#atproto_pds".to_string(),
                service_type: "AtprotoPersonalDataServer".to_string(),
                service_endpoint: "http://pds.example".to_string(),
            }],
        };

        assert!(extract_pds_endpoint(&doc).is_err());
    }
}
