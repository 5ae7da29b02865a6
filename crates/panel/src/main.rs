use clap::Parser;
use proxyfleet_panel::config::PanelConfig;
use proxyfleet_panel::db;
use proxyfleet_panel::monitors::{NodesMonitor, TrafficMonitor};
use proxyfleet_panel::services::auth_service;
use proxyfleet_panel::sync::{HttpNodeClient, SyncOrchestrator};
use proxyfleet_panel::web::{self, AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    let file_appender = rolling::daily(log_dir, "panel.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let config = match PanelConfig::load(args.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Failed to load panel configuration: {e}");
            return Err(e.into());
        }
    };
    init_logging(&config.log_dir);
    info!(addr = %config.http_addr, "Starting panel, version: {}", env!("CARGO_PKG_VERSION"));

    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = match db::connect(&config.database_url()).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, path = %config.db_path, "Failed to open panel database.");
            return Err(e.into());
        }
    };
    info!(path = %config.db_path, "Database ready.");

    match auth_service::seed_admin(&db, config.admin_user.as_deref(), config.admin_pass.as_deref()).await {
        Ok(true) => {}
        Ok(false) if config.setup_token.is_none() => {
            warn!("No admin seeded and setup is disabled; an existing admin is required to log in.")
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Failed to seed admin account."),
    }

    let shutdown = CancellationToken::new();
    let client = Arc::new(HttpNodeClient::new(Duration::from_secs(config.node_request_timeout_secs))?);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        db.clone(),
        client,
        config.sync_job_keep,
        shutdown.clone(),
    ));

    let nodes_monitor = Arc::new(NodesMonitor::new(
        db.clone(),
        orchestrator.clone(),
        config.offline_threshold,
    ));
    let nodes_monitor_handle = tokio::spawn(nodes_monitor.start_periodic_check(
        Duration::from_secs(config.node_monitor_interval_secs),
        shutdown.clone(),
    ));

    let traffic_monitor = Arc::new(TrafficMonitor::new(db.clone(), orchestrator.clone()));
    let traffic_monitor_handle = tokio::spawn(traffic_monitor.start_periodic_collection(
        Duration::from_secs(config.traffic_monitor_interval_secs),
        shutdown.clone(),
    ));

    let state = Arc::new(AppState {
        db,
        config: config.clone(),
        orchestrator,
    });
    let app = web::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(addr = %config.http_addr, "Panel HTTP server listening.");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    for (name, handle) in [("nodes", nodes_monitor_handle), ("traffic", traffic_monitor_handle)] {
        if let Err(e) = handle.await {
            error!(monitor = name, error = %e, "Monitor task ended abnormally.");
        }
    }
    info!("Panel stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received.");
}
