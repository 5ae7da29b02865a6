use clap::Parser;
use proxyfleet_common::SyncPayload;
use proxyfleet_node::config::NodeConfig;
use proxyfleet_node::engine::ListenerEngineFactory;
use proxyfleet_node::runtime::Runtime;
use proxyfleet_node::sampler::InterfaceSampler;
use proxyfleet_node::tracker::InboundTracker;
use proxyfleet_node::persist;
use proxyfleet_node::web::{self, AppState};
use std::path::PathBuf;
use std::sync::Arc;
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

fn init_logging(level: &str, log_dir: &str) {
    let file_appender = rolling::daily(log_dir, "node.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

#[derive(Debug, thiserror::Error)]
enum RestoreError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Payload(#[from] proxyfleet_common::PayloadError),
    #[error(transparent)]
    Engine(#[from] proxyfleet_node::engine::EngineError),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let config = match NodeConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load node configuration: {e}");
            return Err(e.into());
        }
    };
    init_logging(&config.log_level, &config.log_dir);
    info!(addr = %config.http_addr, "Starting node agent, version: {}", env!("CARGO_PKG_VERSION"));

    let tracker = Arc::new(InboundTracker::new());
    let runtime = Arc::new(Runtime::new(Arc::new(ListenerEngineFactory), tracker.clone()));
    let state_path = PathBuf::from(&config.state_path);

    // Warm restart before the listener accepts pushes.
    let restored = persist::restore(&state_path, |bytes| {
        let runtime = runtime.clone();
        async move {
            let payload = SyncPayload::parse(&bytes)?;
            runtime.apply(&payload.inbounds, &bytes).await?;
            Ok::<(), RestoreError>(())
        }
    })
    .await;
    match restored {
        Ok(true) => info!(path = %state_path.display(), "Restored last applied configuration."),
        Ok(false) => info!("No persisted configuration, waiting for the panel."),
        Err(e) => warn!(error = %e, "Failed to restore persisted configuration."),
    }

    let state = Arc::new(AppState {
        secret_key: config.secret_key.clone(),
        state_path,
        traffic_interface: config.traffic_interface.clone(),
        runtime: runtime.clone(),
        tracker,
        sampler: InterfaceSampler::default(),
    });
    let app = web::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(addr = %config.http_addr, "Node HTTP server listening.");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = runtime.shutdown().await {
        error!(error = %e, "Failed to close proxy engine on shutdown.");
    }
    info!("Node agent stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal.");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received.");
}
