use anyhow::Context;
use clap::Parser;
use nsdb::{api, config::Config};
use nsdb_core::{Database, Dispatcher};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();

    let db = Database::boot(&config.storage, &config.config, &config.root_password)
        .context("booting database")?;
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(RwLock::new(db)),
        config.debounce(),
    ));
    let app = api::router(api::AppState::new(dispatcher.clone()));

    let listener = TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("binding {}", config.addr()))?;
    info!(addr = %listener.local_addr()?, "nsdb listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let flusher = dispatcher.clone();
    let saved = tokio::task::spawn_blocking(move || flusher.flush_all())
        .await
        .context("final flush task")?
        .context("final flush")?;
    info!(namespaces = saved.len(), "state flushed, shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
