//! Listen/connect pairing against the registry.

use crate::config::ServerConfig;
use crate::error::PairingError;
use crate::metrics::{counters, gauges};
use crate::registry::{Conflict, PendingEntry, Registry};
use crate::relay::{close_connection, RelaySession, SessionReport};
use signal_common::{CloseStatus, Handle};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

type Pending<S> = PendingEntry<WebSocketStream<S>>;

/// Pairs listening and connecting peers.
pub struct Coordinator<S> {
    registry: Arc<Registry<WebSocketStream<S>>>,
    listen_timeout: Duration,
    pipe_timeout: Duration,
    max_messages: u32,
}

impl<S> Coordinator<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a coordinator over `registry` using the deadlines in `config`.
    #[must_use]
    pub fn new(registry: Arc<Registry<WebSocketStream<S>>>, config: &ServerConfig) -> Self {
        Self {
            registry,
            listen_timeout: config.listen_timeout,
            pipe_timeout: config.pipe_timeout,
            max_messages: config.max_messages,
        }
    }

    /// The registry shared with the sweeper.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry<WebSocketStream<S>>> {
        &self.registry
    }

    /// Cheap pre-upgrade check so a duplicate listen can be refused with a
    /// status code instead of an upgraded-then-dropped connection.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::Conflict`] if `handle` is pending.
    pub fn check_vacant(&self, handle: &Handle) -> Result<(), PairingError> {
        if self.registry.contains(handle) {
            counters::listens_total("conflict");
            return Err(PairingError::Conflict);
        }
        Ok(())
    }

    /// Register an upgraded listening connection under `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::Conflict`] if another listener won the handle
    /// since [`check_vacant`](Self::check_vacant). The connection is then
    /// dropped without a close handshake.
    pub fn listen(&self, handle: Handle, conn: WebSocketStream<S>) -> Result<(), PairingError> {
        let deadline = Instant::now() + self.listen_timeout;
        match self.registry.insert(handle.clone(), PendingEntry::new(conn, deadline)) {
            Ok(()) => {
                counters::listens_total("pending");
                gauges::set_pending_handles(self.registry.len());
                debug!(handle = %handle, "listening");
                Ok(())
            }
            Err(Conflict(entry)) => {
                counters::listens_total("conflict");
                debug!(handle = %handle, "lost listen race, dropping connection");
                drop(entry.conn);
                Err(PairingError::Conflict)
            }
        }
    }

    /// Claim the listener pending on `handle`.
    ///
    /// The returned [`Claim`] must be [`paired`](Claim::pair) or
    /// [`released`](Claim::release).
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::NotFound`] if nobody listens on `handle`,
    /// including when a concurrent connect claimed it first.
    pub fn claim(&self, handle: &Handle) -> Result<Claim<S>, PairingError> {
        let Some(entry) = self.registry.claim(handle) else {
            counters::connects_total("not_found");
            return Err(PairingError::NotFound);
        };
        gauges::set_pending_handles(self.registry.len());
        Ok(Claim {
            handle: handle.clone(),
            entry,
            registry: Arc::clone(&self.registry),
            pipe_timeout: self.pipe_timeout,
            max_messages: self.max_messages,
        })
    }
}

/// A listener taken out of the registry for one connect attempt.
///
/// Consumed either by [`pair`](Self::pair) once the connector is upgraded,
/// or by [`release`](Self::release) when the upgrade fails.
#[must_use = "dropping a claim closes its listener; pair or release it"]
pub struct Claim<S> {
    handle: Handle,
    entry: Pending<S>,
    registry: Arc<Registry<WebSocketStream<S>>>,
    pipe_timeout: Duration,
    max_messages: u32,
}

impl<S> Claim<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// The claimed handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Pair the claimed listener with the upgraded connector and start
    /// relaying. The deadline starts now and covers both connections.
    pub fn pair(self, connector: WebSocketStream<S>) -> JoinHandle<SessionReport> {
        let Self {
            handle,
            entry,
            pipe_timeout,
            max_messages,
            ..
        } = self;

        counters::connects_total("paired");
        let deadline = Instant::now() + pipe_timeout;
        let session = RelaySession::new(entry.conn, connector, deadline, max_messages);
        info!(handle = %handle, "paired");
        tokio::spawn(async move {
            let report = session.run().await;
            info!(
                handle = %handle,
                listener = ?report.listener_status,
                connector = ?report.connector_status,
                forwarded = report.listener_to_connector.forwarded,
                returned = report.connector_to_listener.forwarded,
                "pairing ended"
            );
            report
        })
    }

    /// Put the listener back after a failed connect.
    ///
    /// If the handle was listened on again in the meantime the newer
    /// listener keeps it and this one is closed with `InternalError`.
    pub fn release(self) {
        let Self {
            handle,
            entry,
            registry,
            ..
        } = self;
        counters::connects_total("restored");
        debug!(handle = %handle, "connect failed, restoring listener");
        if let Some(stale) = registry.restore(handle.clone(), entry) {
            warn!(handle = %handle, "handle re-listened during failed connect, closing old listener");
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(close_connection(stale.conn, CloseStatus::InternalError));
                }
                Err(_) => drop(stale),
            }
        }
        gauges::set_pending_handles(registry.len());
    }
}
