mod monitor;
mod problem;
mod router;
mod telemetry;

use std::{net::SocketAddr, path::Path, sync::Arc};

use agency_storage::Database;
use agency_util::{load_env_file, AppConfig};
use tracing::info;

use crate::monitor::ExpiryMonitor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_file = load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;
    if let Some(path) = env_file {
        info!(stage = "config", path = %path.display(), "loaded .env file");
    }

    ensure_sqlite_dir(&config.database_url)?;
    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let store = Arc::new(database.clone());
    ExpiryMonitor::new(store.clone(), store, &config.reminders).spawn();

    let state = router::AppState::new(metrics, database, &config.reminders);

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}

/// Creates the parent directory of a file-backed SQLite URL.
fn ensure_sqlite_dir(database_url: &str) -> std::io::Result<()> {
    let Some(path) = database_url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
