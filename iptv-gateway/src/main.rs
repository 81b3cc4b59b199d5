use std::path::Path;

use iptv_gateway::api::{ApiServer, ApiServerConfig};
use iptv_gateway::config::AppConfig;
use iptv_gateway::database;
use iptv_gateway::logging::init_logging;
use iptv_gateway::services::ServiceContainer;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging; keep the guard alive so the file writer flushes on exit
    let log_dir = std::env::var("LOG_DIR").ok().filter(|dir| !dir.trim().is_empty());
    let _log_guard = init_logging(log_dir.as_deref())?;

    let config = AppConfig::from_env();
    tracing::info!(
        host = %config.server_host,
        port = config.server_port,
        health_checks = config.health_check_enabled,
        "Starting iptv-gateway"
    );

    // Initialize database
    ensure_database_dir(&config.database_url)?;
    let pool = database::init_pool(&config.database_url).await?;

    // Run migrations
    database::run_migrations(&pool).await?;

    let container = ServiceContainer::new(pool, config).await?;
    container.start_jobs();

    let server = ApiServer::new(
        ApiServerConfig::from(&container.config),
        container.app_state(),
        container.cancellation_token(),
    );

    let shutdown_token = container.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        shutdown_token.cancel();
    });

    let served = server.run().await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "API server stopped with an error");
    }

    container.shutdown().await?;
    served?;

    tracing::info!("iptv-gateway stopped");
    Ok(())
}

/// Create the parent directory of a file-backed SQLite URL.
fn ensure_database_dir(database_url: &str) -> std::io::Result<()> {
    let Some(rest) = database_url.strip_prefix("sqlite:") else {
        return Ok(());
    };
    let path = rest.split('?').next().unwrap_or_default();
    let path = path.strip_prefix("//").unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
