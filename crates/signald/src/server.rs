use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::SignaldError;
use crate::origin::OriginPolicy;
use crate::pairing::Coordinator;
use crate::registry::Registry;
use crate::sweeper::spawn_sweeper;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Maximum number of WebSocket handshakes in flight at once.
pub const MAX_CONCURRENT_HANDSHAKES: usize = 1000;

/// How long shutdown waits for in-flight handshakes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for the broker.
pub struct ServerState {
    /// Listen/connect pairing over the pending-handle registry.
    pub coordinator: Coordinator<TcpStream>,
    /// Origin header policy applied to every handshake.
    pub origin: OriginPolicy,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Limits concurrent handshakes.
    pub handshake_semaphore: Semaphore,
}

impl ServerState {
    /// Build the state for `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured origin pattern is not a valid regex.
    pub fn new(config: ServerConfig) -> Result<Self, regex::Error> {
        let origin = OriginPolicy::new(config.origin_re.as_deref())?;
        Ok(Self {
            coordinator: Coordinator::new(Arc::new(Registry::new()), &config),
            origin,
            config,
            handshake_semaphore: Semaphore::new(MAX_CONCURRENT_HANDSHAKES),
        })
    }
}

/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), SignaldError> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    run_with_shutdown(listener, state, shutdown_rx).await
}

/// Run the server accept loop with an externally-controlled shutdown signal.
///
/// When a value is sent on the paired sender (or it is dropped), the accept loop
/// stops accepting new connections, stops the sweeper and waits for in-flight
/// handshakes to finish. Sessions already relaying run to their own deadline.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown_rx: tokio::sync::watch::Receiver<()>,
) -> Result<(), SignaldError> {
    let local_addr = listener.local_addr().map_err(SignaldError::Io)?;
    info!("server listening on {}", local_addr);

    let sweeper = spawn_sweeper(
        Arc::clone(state.coordinator.registry()),
        state.config.sweep_interval,
    );
    let mut handshakes = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&state);
                        handshakes.spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("connection from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
            _ = shutdown_rx.changed() => {
                info!("shutdown signal received, draining {} handshakes", handshakes.len());
                break;
            }
        }
    }

    sweeper.abort();

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while !handshakes.is_empty() {
        match tokio::time::timeout_at(deadline, handshakes.join_next()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    "drain timeout reached with {} handshakes still active",
                    handshakes.len()
                );
                handshakes.abort_all();
                break;
            }
        }
    }

    info!("server shut down gracefully");
    Ok(())
}
