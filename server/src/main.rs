use color_eyre::eyre::Result;
use futures::FutureExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bibliome::oauth::db;
use bibliome::routes;
use bibliome::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let app_state = AppState::from_env().await?;

    let server = serve(app_state.clone()).boxed();
    let sweeper = sweep_expired_requests(app_state).boxed();

    futures::future::try_join_all(vec![server, sweeper]).await?;

    Ok(())
}

async fn serve(app_state: AppState) -> Result<()> {
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let app = routes::routes(app_state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Deletes expired pending authorization requests every five minutes. The
/// read path enforces the TTL too; this keeps abandoned logins from
/// accumulating.
async fn sweep_expired_requests(app_state: AppState) -> Result<()> {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));

    loop {
        interval.tick().await;
        if let Err(err) = db::cleanup_expired_requests(&app_state).await {
            error!(error = ?err, "sweep of expired authorization requests failed");
        }
    }
}
