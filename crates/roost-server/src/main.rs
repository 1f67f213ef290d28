use std::sync::Arc;

use anyhow::{Context, Result};
use roost_mediator::{
    ConnectionStore, GrantStore, LibSqlDeliveryQueue, MediationPolicy, Mediator,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod server;
mod telemetry;

use config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init().map_err(|e| anyhow::anyhow!("telemetry init failed: {e}"))?;

    info!("Roost mediator starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env()?;
    config.log_config();

    // One database file, one connection, shared by all three stores.
    let db = libsql::Builder::new_local(&config.db_path)
        .build()
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path))?;
    let conn = Arc::new(Mutex::new(db.connect().context("failed to connect")?));

    let queue = LibSqlDeliveryQueue::from_shared(Arc::clone(&conn));
    queue.initialize().await.context("queue schema")?;
    let grants = GrantStore::from_shared(Arc::clone(&conn));
    grants.initialize().await.context("grants schema")?;
    let connections = ConnectionStore::from_shared(conn);
    connections.initialize().await.context("connections schema")?;

    let policy = MediationPolicy::new(grants, config.mediator.default_grant_all);
    let mediator = Arc::new(Mediator::new(
        config.mediator.clone(),
        Arc::new(queue),
        policy,
        Some(connections),
    ));

    // One token stops both the sweeper and the HTTP listener.
    let shutdown = CancellationToken::new();
    let worker = mediator.delivery_worker(shutdown.clone());
    let worker_handle = tokio::spawn(worker.run());

    tokio::spawn(shutdown_signal(shutdown.clone()));

    if let Err(e) = server::start(Arc::clone(&mediator), config.http_port, shutdown.clone()).await {
        error!(error = %e, "HTTP server exited with error");
        shutdown.cancel();
        let _ = worker_handle.await;
        return Err(e);
    }

    shutdown.cancel();
    let _ = worker_handle.await;
    info!("Roost mediator stopped");
    Ok(())
}

/// Cancel the token on SIGTERM or ctrl-c.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
