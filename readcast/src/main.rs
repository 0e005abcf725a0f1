use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info};

use readcast::api::ApiServer;
use readcast::config::AppConfig;
use readcast::logging::init_logging;
use readcast::services::ServiceContainer;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env_or_default().context("invalid configuration")?;

    let (logging_config, _log_guard) =
        init_logging(&config.log_dir).context("failed to initialize logging")?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting readcast");

    let api_config = config.api.clone();
    let container = Arc::new(
        ServiceContainer::new(config)
            .await
            .context("failed to build services")?,
    );
    logging_config.start_retention_cleanup(container.cancellation_token());

    let resumed = container.initialize().await?;
    info!(resumed, "Scheduler ready");

    let server = ApiServer::new(
        api_config,
        container.app_state().with_logging_config(logging_config),
    );
    let server_token = server.cancel_token();

    tokio::spawn(async move {
        shutdown_signal().await;
        server_token.cancel();
    });

    if let Err(e) = server.run().await {
        error!("API server error: {}", e);
    }

    container.shutdown().await?;
    info!("readcast stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
