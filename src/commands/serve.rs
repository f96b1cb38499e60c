use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::manager::BackendManager;
use crate::proxy::IngressProxy;
use crate::server::{build_router, AppState};
use crate::store::{BackendStore, FileStore};

/// Run the HTTP server until Ctrl-C or SIGTERM, then stop every backend.
pub async fn run(config: Config, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address: {bind}"))?;

    let records_dir = config.paths.records_dir();
    let store: Arc<dyn BackendStore> = Arc::new(FileStore::new(&records_dir));
    let manager = BackendManager::new(&config, store).context("Failed to set up backend launcher")?;

    // A failed reset is not fatal; status reads repair records lazily
    if let Err(e) = manager.initialize().await {
        error!(error = %e, "Failed to reset stale backend states");
    }

    let proxy = IngressProxy::new(manager.clone(), config.proxy.timeout())
        .context("Failed to build proxy client")?;
    let router = build_router(AppState::new(manager.clone(), proxy));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(
        bind = %addr,
        records = %records_dir.display(),
        scratch = %config.paths.scratch_dir().display(),
        "Starting lnfly backend server"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped accepting requests, stopping backends");
    manager.stop_all().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_invalid_bind() {
        let err = run(Config::default(), Some("not-an-address".to_string()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid bind address"));
    }
}
