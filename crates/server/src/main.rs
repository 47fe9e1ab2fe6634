use anyhow::Result;
use axum::serve;
use chainmux_core::{config::AppConfig, delegator::DelegatorFactory, upstream::MultiplexerBuilder};
use server::router;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over `logging.level`.
fn init_logging(config: &AppConfig) {
    let level = config.logging.level.as_str();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,chainmux_core={level},server={level}")));

    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);
        registry.with(fmt_layer).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("Configuration load failed: {e}"))?;
    config.validate().map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    init_logging(&config);
    info!(endpoints = config.endpoints.len(), hub = config.hub.backend.as_str(), "Starting chainmux");

    let registry = Arc::new(
        MultiplexerBuilder::from_config(&config, DelegatorFactory::with_defaults())
            .await
            .map_err(|e| anyhow::anyhow!("Registry initialization failed: {e}"))?
            .build(),
    );
    registry
        .load_config(&config.endpoints)
        .map_err(|e| anyhow::anyhow!("Endpoint registration failed: {e}"))?;
    registry.start_sync().await;

    let addr = config.socket_addr().map_err(|e| anyhow::anyhow!(e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Status server listening");

    let fatal = registry.fatal_signal();
    let app = router::create_router(registry.clone());
    let server = serve(listener, app).with_graceful_shutdown({
        let fatal = fatal.clone();
        async move {
            tokio::select! {
                () = shutdown_signal() => {},
                () = fatal.cancelled() => {},
            }
        }
    });

    if let Err(e) = server.await {
        error!(error = %e, "Server error occurred");
    }

    registry.stop_sync().await;

    if fatal.is_cancelled() {
        anyhow::bail!("chain status hub failed, exiting for restart");
    }
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                () = std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, stopping sync");
}
