//! One peer's WebSocket to the broker.
//!
//! The socket is opened by a background task. Signals sent before it is
//! open are queued and flushed, in order, once the upgrade succeeds.

use crate::error::ClientError;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use signal_common::{CloseStatus, Handle, Route};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Upper bound on flushing the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Code used when a close frame carries no status.
const NO_STATUS: u16 = 1005;

/// A message exchanged with the paired peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload.
    Binary(Vec<u8>),
}

impl From<String> for Signal {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Signal {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Vec<u8>> for Signal {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }
}

impl From<Signal> for Message {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Text(text) => Message::Text(text),
            Signal::Binary(data) => Message::Binary(data),
        }
    }
}

/// How the connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseEvent {
    /// The broker refused the upgrade with this HTTP status.
    Refused(StatusCode),
    /// A close handshake completed with this code and reason.
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason text.
        reason: String,
    },
    /// The transport failed without a close frame.
    Failed(String),
}

impl CloseEvent {
    /// The WebSocket close code, if a close frame was received.
    #[must_use]
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Closed { code, .. } => Some(*code),
            Self::Refused(_) | Self::Failed(_) => None,
        }
    }

    /// The broker's close status, if the code is one the broker sends.
    #[must_use]
    pub fn status(&self) -> Option<CloseStatus> {
        self.code().and_then(CloseStatus::from_code)
    }
}

/// Lifecycle of a [`Signaller`], following the WebSocket ready states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    /// The upgrade is in progress; signals are queued.
    Connecting,
    /// Signals are sent as they are given.
    Open,
    /// [`Signaller::close`] was called; no more signals are accepted.
    Closing,
    /// The connection has ended.
    Closed(CloseEvent),
}

enum Command {
    Signal(Signal),
    Close,
}

/// A peer of the rendezvous broker.
///
/// Dropping a signaller closes its connection normally.
pub struct Signaller {
    route: Route,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<ReadyState>>,
    signals: mpsc::UnboundedReceiver<Signal>,
}

impl Signaller {
    /// Listen on `handle` at `server` (e.g. `ws://signal.example:8080`).
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if `server` is not a valid
    /// WebSocket URL.
    pub fn listen(server: &str, handle: Handle) -> Result<Self, ClientError> {
        Self::open(server, Route::Listen(handle), None)
    }

    /// Connect to the peer listening on `handle` at `server`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if `server` is not a valid
    /// WebSocket URL.
    pub fn connect(server: &str, handle: Handle) -> Result<Self, ClientError> {
        Self::open(server, Route::Connect(handle), None)
    }

    /// Open `route` at `server`, sending `origin` as the `Origin` header.
    ///
    /// Returns immediately in [`ReadyState::Connecting`]; the upgrade runs on
    /// a task spawned onto the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if the URL or origin is
    /// malformed.
    pub fn open(server: &str, route: Route, origin: Option<&str>) -> Result<Self, ClientError> {
        let url = format!("{}{}", server.trim_end_matches('/'), route.path());
        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
        if let Some(origin) = origin {
            let value = HeaderValue::from_str(origin)
                .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(header::ORIGIN, value);
        }

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let state = Arc::new(watch::Sender::new(ReadyState::Connecting));
        tokio::spawn(drive(request, commands_rx, Arc::clone(&state), signals_tx));

        Ok(Self {
            route,
            commands,
            state,
            signals,
        })
    }

    /// The route this signaller opened.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Current lifecycle state.
    pub fn ready_state(&self) -> ReadyState {
        self.state.borrow().clone()
    }

    /// Wait until the upgrade has either succeeded or failed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Refused`] with the broker's HTTP status, or
    /// [`ClientError::Failed`] if the connection could not be made.
    pub async fn opened(&self) -> Result<(), ClientError> {
        let mut states = self.state.subscribe();
        loop {
            match &*states.borrow_and_update() {
                ReadyState::Connecting => {}
                ReadyState::Closed(CloseEvent::Refused(status)) => {
                    return Err(ClientError::Refused(*status))
                }
                ReadyState::Closed(CloseEvent::Failed(reason)) => {
                    return Err(ClientError::Failed(reason.clone()))
                }
                ReadyState::Open | ReadyState::Closing | ReadyState::Closed(_) => return Ok(()),
            }
            if states.changed().await.is_err() {
                return Err(ClientError::Closed);
            }
        }
    }

    /// Send `data` to the paired peer, queueing it while still connecting.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closing`] after [`close`](Self::close) and
    /// [`ClientError::Closed`] once the connection has ended.
    pub fn signal(&self, data: impl Into<Signal>) -> Result<(), ClientError> {
        match &*self.state.borrow() {
            ReadyState::Connecting | ReadyState::Open => {}
            ReadyState::Closing => return Err(ClientError::Closing),
            ReadyState::Closed(_) => return Err(ClientError::Closed),
        }
        self.commands
            .send(Command::Signal(data.into()))
            .map_err(|_| ClientError::Closed)
    }

    /// Next signal from the paired peer; `None` once the connection ended
    /// and every received signal was returned.
    pub async fn recv(&mut self) -> Option<Signal> {
        self.signals.recv().await
    }

    /// Close the connection with a normal closure (1000). Signals still
    /// queued while connecting are discarded.
    pub fn close(&self) {
        let started = self.state.send_if_modified(|state| match state {
            ReadyState::Connecting | ReadyState::Open => {
                *state = ReadyState::Closing;
                true
            }
            ReadyState::Closing | ReadyState::Closed(_) => false,
        });
        if started {
            let _ = self.commands.send(Command::Close);
        }
    }

    /// Wait for the connection to end and report how it ended.
    pub async fn closed(&self) -> CloseEvent {
        let mut states = self.state.subscribe();
        loop {
            if let ReadyState::Closed(event) = &*states.borrow_and_update() {
                return event.clone();
            }
            if states.changed().await.is_err() {
                return CloseEvent::Failed("signaller task ended".to_string());
            }
        }
    }
}

fn normal_closure() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

async fn send_close(tx: &mut WsSink) -> Result<(), WsError> {
    tx.send(normal_closure()).await
}

async fn drive(
    request: Request,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: Arc<watch::Sender<ReadyState>>,
    signals: mpsc::UnboundedSender<Signal>,
) {
    let path = request.uri().path().to_owned();
    let ws = match tokio_tungstenite::connect_async(request).await {
        Ok((ws, _)) => ws,
        Err(WsError::Http(resp)) => {
            debug!(path = %path, status = %resp.status(), "upgrade refused");
            state.send_replace(ReadyState::Closed(CloseEvent::Refused(resp.status())));
            return;
        }
        Err(e) => {
            debug!(path = %path, "connect failed: {}", e);
            state.send_replace(ReadyState::Closed(CloseEvent::Failed(e.to_string())));
            return;
        }
    };

    let opened = state.send_if_modified(|s| {
        if *s == ReadyState::Connecting {
            *s = ReadyState::Open;
            true
        } else {
            false
        }
    });
    let (mut tx, mut rx) = ws.split();

    // Closed while connecting: the queued signals are never sent.
    let mut closing = !opened;
    if closing {
        if let Err(e) = send_close(&mut tx).await {
            debug!(path = %path, "close failed: {}", e);
        }
    }

    let event = loop {
        tokio::select! {
            command = commands.recv(), if !closing => match command {
                Some(Command::Signal(signal)) => {
                    if let Err(e) = tx.send(signal.into()).await {
                        break CloseEvent::Failed(e.to_string());
                    }
                }
                Some(Command::Close) | None => {
                    closing = true;
                    state.send_if_modified(|s| {
                        let open = *s == ReadyState::Open;
                        if open {
                            *s = ReadyState::Closing;
                        }
                        open
                    });
                    if let Err(e) = send_close(&mut tx).await {
                        break CloseEvent::Failed(e.to_string());
                    }
                }
            },
            msg = rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let _ = signals.send(Signal::Text(text));
                }
                Some(Ok(Message::Binary(data))) => {
                    let _ = signals.send(Signal::Binary(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    // Flush the close reply the transport queued.
                    let _ = timeout(CLOSE_TIMEOUT, tx.close()).await;
                    break match frame {
                        Some(frame) => CloseEvent::Closed {
                            code: u16::from(frame.code),
                            reason: frame.reason.into_owned(),
                        },
                        None => CloseEvent::Closed {
                            code: NO_STATUS,
                            reason: String::new(),
                        },
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break CloseEvent::Failed(e.to_string()),
                None => break CloseEvent::Failed("connection ended without a close frame".to_string()),
            },
        }
    };

    debug!(path = %path, event = ?event, "signaller closed");
    state.send_replace(ReadyState::Closed(event));
}
