use std::env;
use std::str::FromStr;
use std::sync::Arc;

use color_eyre::eyre::{eyre, Result, WrapErr};
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::encryption::EncryptionKey;

/// Deployment-level knobs. Everything here is constructible directly so
/// tests can point the app at a local mock network.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Public base URL of this app, e.g. `https://bibliome.example`.
    pub app_url: String,
    /// AppView used for handle resolution.
    pub appview_url: String,
    /// PLC directory used for DID document resolution.
    pub plc_directory_url: String,
    /// OAuth scope requested at login.
    pub oauth_scope: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let app_url = env::var("APP_URL").wrap_err("APP_URL must be set")?;
        let appview_url =
            env::var("APPVIEW_URL").unwrap_or_else(|_| "https://public.api.bsky.app".to_string());
        let plc_directory_url =
            env::var("PLC_DIRECTORY_URL").unwrap_or_else(|_| "https://plc.directory".to_string());
        let oauth_scope = env::var("OAUTH_SCOPE")
            .unwrap_or_else(|_| "atproto transition:generic".to_string());

        Ok(Self {
            app_url: app_url.trim_end_matches('/').to_string(),
            appview_url: appview_url.trim_end_matches('/').to_string(),
            plc_directory_url: plc_directory_url.trim_end_matches('/').to_string(),
            oauth_scope,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub cookie_key: tower_cookies::Key,
    pub config: AppConfig,
    pub http: reqwest::Client,
    pub encryption: EncryptionKey,
    /// Per-DID locks so concurrent requests coalesce onto one token refresh.
    pub refresh_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl AppState {
    pub async fn from_env() -> Result<Self> {
        let pool = setup_db_pool().await?;
        let config = AppConfig::from_env()?;
        let cookie_key = cookie_key_from_env()?;
        let encryption = EncryptionKey::from_env()?;

        Self::new(pool, config, cookie_key, encryption)
    }

    pub fn new(
        db: SqlitePool,
        config: AppConfig,
        cookie_key: tower_cookies::Key,
        encryption: EncryptionKey,
    ) -> Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .timeout(std::time::Duration::from_secs(10))
            .use_rustls_tls()
            .build()
            .wrap_err("failed to build HTTP client")?;

        Ok(Self {
            db,
            cookie_key,
            config,
            http,
            encryption,
            refresh_locks: Arc::new(DashMap::new()),
        })
    }

    /// OAuth client ID: the URL of our client metadata document.
    pub fn client_id(&self) -> String {
        format!("{}/oauth/client-metadata.json", self.config.app_url)
    }

    /// Canonical redirect URI registered in the client metadata.
    pub fn redirect_uri(&self) -> String {
        format!("{}/oauth/callback", self.config.app_url)
    }
}

fn cookie_key_from_env() -> Result<tower_cookies::Key> {
    match env::var("COOKIE_KEY") {
        Ok(encoded) => {
            let bytes =
                base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &encoded)
                    .map_err(|e| eyre!("Failed to decode COOKIE_KEY: {}", e))?;
            tower_cookies::Key::try_from(bytes.as_slice())
                .map_err(|e| eyre!("COOKIE_KEY is not a valid cookie key: {}", e))
        }
        // Sessions won't survive a restart without a configured key.
        Err(_) => Ok(tower_cookies::Key::generate()),
    }
}

#[tracing::instrument(err)]
pub async fn setup_db_pool() -> Result<SqlitePool> {
    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:bibliome.db".to_string());

    let options = SqliteConnectOptions::from_str(&database_url)
        .wrap_err("invalid DATABASE_URL")?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("../migrations").run(&pool).await?;

    Ok(pool)
}
