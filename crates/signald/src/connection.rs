use crate::error::{PairingError, SignaldError};
use crate::pairing::Claim;
use crate::server::ServerState;
use signal_common::types::{CONNECT_PREFIX, LISTEN_PREFIX};
use signal_common::{Handle, Route};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::debug;

/// What the handshake callback agreed to before the upgrade completes.
enum Accepted<S> {
    Listen(Handle),
    Connect(Claim<S>),
}

/// Split a request path into a route, telling unknown paths apart from
/// malformed handles.
fn route(path: &str) -> Result<Route, PairingError> {
    if let Some(rest) = path.strip_prefix(LISTEN_PREFIX) {
        Ok(Route::Listen(Handle::parse(rest)?))
    } else if let Some(rest) = path.strip_prefix(CONNECT_PREFIX) {
        Ok(Route::Connect(Handle::parse(rest)?))
    } else {
        Err(PairingError::UnknownRoute)
    }
}

/// Decide on a handshake request. A connect claims its listener here, before
/// the upgrade response is written.
fn admit(req: &Request, state: &ServerState) -> Result<Accepted<TcpStream>, PairingError> {
    if !state.origin.allows(req) {
        return Err(PairingError::Forbidden);
    }
    match route(req.uri().path())? {
        Route::Listen(handle) => {
            state.coordinator.check_vacant(&handle)?;
            Ok(Accepted::Listen(handle))
        }
        Route::Connect(handle) => state.coordinator.claim(&handle).map(Accepted::Connect),
    }
}

fn reject(err: &PairingError) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(err.to_string()));
    *resp.status_mut() = err.status_code();
    resp
}

/// Where the handshake callback leaves its decision. A claim still held
/// here when the cell is dropped is released back to the registry.
struct Decision<S>(Mutex<Option<Accepted<S>>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static;

impl<S> Decision<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn new() -> Self {
        Self(Mutex::new(None))
    }

    fn set(&self, accepted: Accepted<S>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(accepted);
    }

    fn take(&self) -> Option<Accepted<S>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl<S> Drop for Decision<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(Accepted::Connect(claim)) = self.take() {
            claim.release();
        }
    }
}

/// Upgrade one TCP connection and hand it to the coordinator.
///
/// Returns once the connection is pending or paired; relaying continues in
/// its own task.
///
/// # Errors
///
/// Returns an error if the request is refused, the handshake fails or times
/// out, or a listen loses the race for its handle.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), SignaldError> {
    let _permit = state.handshake_semaphore.acquire().await.map_err(|_| {
        tracing::debug!("handshake semaphore closed");
        SignaldError::ShuttingDown
    })?;

    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_message_size),
        max_frame_size: Some(state.config.max_message_size),
        ..WebSocketConfig::default()
    };

    let accepted = Arc::new(Decision::new());
    let cell = Arc::clone(&accepted);
    let callback_state = Arc::clone(&state);
    let handshake = tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        move |req: &Request, resp: Response| match admit(req, &callback_state) {
            Ok(decision) => {
                cell.set(decision);
                Ok(resp)
            }
            Err(e) => {
                debug!(peer = %peer_addr, path = req.uri().path(), "refused: {}", e);
                Err(reject(&e))
            }
        },
        Some(ws_config),
    );

    // On the error paths a claim left in the cell is released with it.
    let ws = match timeout(state.config.handshake_timeout, handshake).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => return Err(SignaldError::WebSocket(e)),
        Err(_) => return Err(SignaldError::HandshakeTimeout),
    };

    match accepted.take() {
        Some(Accepted::Listen(handle)) => {
            state.coordinator.listen(handle, ws)?;
        }
        Some(Accepted::Connect(claim)) => {
            debug!(peer = %peer_addr, handle = %claim.handle(), "connect upgraded");
            drop(claim.pair(ws));
        }
        None => {
            return Err(PairingError::Upgrade("handshake completed without a decision".into()).into())
        }
    }
    Ok(())
}
