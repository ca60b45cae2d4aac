#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use signald::config::{Args, ServerConfig};
use signald::metrics::{start_metrics_server, HealthState};
use signald::server::ServerState;
use signald::run_with_shutdown;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    if config.origin_re.is_none() {
        info!(
            "no --origin-re given: handshakes with an Origin header whose host differs from the \
             Host header will be refused"
        );
    }

    let state = Arc::new(ServerState::new(config.clone())?);

    let listener = TcpListener::bind(config.listen).await?;
    info!(
        listen_timeout = ?config.listen_timeout,
        pipe_timeout = ?config.pipe_timeout,
        max_messages = config.max_messages,
        max_message_size = config.max_message_size,
        "bound to {}",
        config.listen
    );

    let health_state = HealthState::new();
    health_state.set_ready(true);

    tokio::spawn({
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_metrics_server(config.metrics_addr, health_state).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let server = tokio::spawn(run_with_shutdown(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    health_state.set_ready(false);
    let _ = shutdown_tx.send(());

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server error: {}", e),
        Err(e) => tracing::error!("server task failed: {}", e),
    }

    Ok(())
}
