use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use runsh_core::config::GlobalConfig;
use runsh_core::ipc::IPCServer;
use runsh_core::profile::ProfileStore;
use runsh_core::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GlobalConfig::load().context("failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    tracing::info!("runsh daemon starting");

    let data_dir = cfg.data_dir();
    let store = ProfileStore::new(&data_dir);
    tracing::info!("Profile store: {}", store.store_path().display());

    let supervisor = Arc::new(Supervisor::new(store, cfg.supervisor_settings()));
    let registered = supervisor
        .initialize()
        .await
        .context("failed to load profiles")?;
    tracing::info!("{} profiles registered", registered);

    let ipc_server = IPCServer::new(supervisor.clone(), &cfg.ipc_listen);
    if let Err(e) = ipc_server.start(shutdown_signal()).await {
        tracing::error!("IPC server error: {}", e);
    }

    if cfg.stop_on_exit {
        let report = supervisor.shutdown().await;
        if !report.is_clean() {
            for (name, reason) in &report.failed {
                tracing::error!("[Shutdown] '{}' could not be stopped: {}", name, reason);
            }
            for name in &report.timed_out {
                tracing::warn!("[Shutdown] '{}' was still stopping at exit", name);
            }
        }
    } else {
        tracing::info!("stop_on_exit is off; leaving scripts running");
    }

    tracing::info!("runsh daemon stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
    tracing::info!("Shutdown signal received");
}
