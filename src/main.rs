use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use prompt_workbench::config::{CliArgs, WorkbenchConfig};
use prompt_workbench::log_capture::{LogLevel, LogSource};
use prompt_workbench::server;
use prompt_workbench::state::{SharedState, WorkbenchState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // Console always; daily-rolling file when --log-dir is given.
    let (file_layer, _log_guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "prompt-workbench.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prompt_workbench=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    info!("Starting prompt-workbench v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkbenchConfig::from_args(args);
    info!("Data dir: {:?}", config.data_dir);
    info!("Model endpoint: {}", config.model_base_url);
    let port = config.port;

    let state: SharedState = match WorkbenchState::from_config(config) {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to initialize workbench: {}", e);
            std::process::exit(1);
        }
    };

    state
        .logs
        .emit(
            LogSource::Server,
            LogLevel::Info,
            format!("Workbench starting on port {}", port),
        )
        .await;

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Workbench listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    let live = state.live_runs.read().await.progress.len();
    if live > 0 {
        warn!(
            "{} runs still live at shutdown; they will be marked interrupted on next start",
            live
        );
    }
    info!("Workbench shutting down");
    Ok(())
}

async fn shutdown_signal(state: SharedState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }

    info!("Received shutdown signal");
    state
        .logs
        .emit(LogSource::Server, LogLevel::Info, "Shutdown signal received")
        .await;
}
