//! corral host agent binary.
//!
//! Runs the host agent against an in-process coordination store and the
//! mock container runtime until interrupted.

use std::sync::Arc;

use anyhow::Result;
use corral_coord::MemoryConnection;
use corral_host_agent::config::Config;
use corral_host_agent::{HostAgent, MockRuntime};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        host_id = %config.host_id,
        pull_timeout_secs = config.pull_timeout_secs,
        soft_fail_missing_images = config.soft_fail_missing_images,
        "Starting corral host agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let conn = Arc::new(MemoryConnection::new());
    let runtime = Arc::new(MockRuntime::new());
    let agent = HostAgent::new(
        conn,
        runtime,
        config.host_id,
        config.reconciler_config(),
        config.agent_config(),
    );

    let agent_handle = tokio::spawn(async move { agent.run(shutdown_rx).await });
    tokio::pin!(agent_handle);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut agent_handle => {
            match result {
                Ok(Ok(())) => info!("Host agent exited"),
                Ok(Err(e)) => error!(error = %e, "Host agent error"),
                Err(e) => error!(error = %e, "Host agent task panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for instance reconcilers to shut down...");
    match agent_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Host agent error during shutdown"),
        Err(e) => error!(error = %e, "Host agent task panicked"),
    }

    info!("Host agent shutdown complete");
    Ok(())
}
