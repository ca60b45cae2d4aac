//! Relay sessions: bidirectional forwarding between two paired connections.
//!
//! A session owns both connections for its whole life. Each direction runs
//! in its own task, bounded by one deadline shared by the pair and by a
//! per-direction message ceiling. Whichever direction stops first picks the
//! close status for both connections; closing is one-shot per connection, so
//! the later direction's close is a no-op. A direction that finds a
//! connection already closing leaves the decision to the direction that
//! caused it.

use crate::metrics::{counters, gauges, histograms};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use signal_common::CloseStatus;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsRecv<S> = SplitStream<WebSocketStream<S>>;

/// Upper bound on sending a close frame, independent of any deadline.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Builds the close frame carrying `status`.
#[must_use]
pub fn close_frame(status: CloseStatus) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(status.code()),
        reason: status.reason().into(),
    }
}

/// Close a connection that was never split, e.g. an expired listener.
/// Best effort: failures are logged and swallowed.
pub async fn close_connection<S>(mut ws: WebSocketStream<S>, status: CloseStatus)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(CLOSE_TIMEOUT, ws.close(Some(close_frame(status)))).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(status = ?status, "close failed: {}", e),
        Err(_) => debug!(status = ?status, "close timed out"),
    }
    counters::connections_closed_total(status.label());
}

/// The write side of one paired connection.
pub struct Peer<S> {
    role: &'static str,
    sink: Mutex<WsSink<S>>,
    /// Set exactly once; `None` means closed without a status of our own.
    closed: OnceLock<Option<CloseStatus>>,
}

impl<S> Peer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(role: &'static str, sink: WsSink<S>) -> Self {
        Self {
            role,
            sink: Mutex::new(sink),
            closed: OnceLock::new(),
        }
    }

    /// Returns `true` once [`close`](Self::close) has won.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    /// The status this connection was closed with, if it is closed.
    #[must_use]
    pub fn closed_with(&self) -> Option<Option<CloseStatus>> {
        self.closed.get().copied()
    }

    async fn send(&self, msg: Message) -> Result<(), WsError> {
        self.sink.lock().await.send(msg).await
    }

    /// Terminal transition for this connection.
    ///
    /// Sends a close frame with `status`, or just completes the close
    /// handshake when `status` is `None`. Only the first call does anything;
    /// it returns `true`, every later call returns `false`.
    pub async fn close(&self, status: Option<CloseStatus>) -> bool {
        if self.closed.set(status).is_err() {
            return false;
        }
        let result = timeout(CLOSE_TIMEOUT, async {
            let mut sink = self.sink.lock().await;
            if let Some(status) = status {
                sink.send(Message::Close(Some(close_frame(status)))).await?;
            }
            sink.close().await
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(peer = self.role, "close failed: {}", e),
            Err(_) => debug!(peer = self.role, "close timed out"),
        }
        counters::connections_closed_total(status.map_or("peer", CloseStatus::label));
        true
    }
}

/// How one direction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The source closed normally and the closure was passed on.
    PeerClosed,
    /// The direction hit its terminal decision with this status.
    Terminated(CloseStatus),
    /// The opposite direction had already ended the pairing.
    Superseded,
}

/// Result of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    /// Why the direction stopped.
    pub outcome: Outcome,
    /// Messages written to the destination.
    pub forwarded: u32,
}

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Listener → connector direction.
    pub listener_to_connector: Termination,
    /// Connector → listener direction.
    pub connector_to_listener: Termination,
    /// Status sent to the listener; `None` if it closed the pairing itself.
    pub listener_status: Option<CloseStatus>,
    /// Status sent to the connector; `None` if it closed the pairing itself.
    pub connector_status: Option<CloseStatus>,
}

/// Classifies why a direction stopped without a normal closure.
fn terminal_status(now: Instant, deadline: Instant, forwarded: u32, max_messages: u32) -> CloseStatus {
    if now >= deadline {
        CloseStatus::PipeTimeout
    } else if forwarded >= max_messages {
        CloseStatus::TooManyMessages
    } else {
        CloseStatus::InternalError
    }
}

/// Writing failed because the destination is already in its close
/// handshake, which only the opposite direction can have started.
fn is_closing(err: &WsError) -> bool {
    matches!(
        err,
        WsError::AlreadyClosed
            | WsError::ConnectionClosed
            | WsError::Protocol(ProtocolError::SendAfterClosing)
    )
}

enum Read {
    Data(Message),
    NormalClose,
    Failed(String),
}

/// Next text or binary message. Control frames are answered by the
/// transport and skipped here.
async fn next_data<S>(rx: &mut WsRecv<S>) -> Read
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match rx.next().await {
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => return Read::Data(msg),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(Some(frame)))) if frame.code == CloseCode::Normal => {
                return Read::NormalClose
            }
            Some(Ok(Message::Close(frame))) => {
                return Read::Failed(format!("closed with {:?}", frame.map(|f| f.code)))
            }
            Some(Err(e)) => return Read::Failed(e.to_string()),
            None => return Read::Failed("stream ended".to_string()),
        }
    }
}

/// Forward messages from `rx` (the read side of `from`) to `to`.
async fn relay<S>(
    direction: &'static str,
    mut rx: WsRecv<S>,
    from: &Peer<S>,
    to: &Peer<S>,
    deadline: Instant,
    max_messages: u32,
) -> Termination
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut forwarded = 0;
    let mut superseded = false;
    while forwarded < max_messages {
        let msg = match timeout_at(deadline, next_data(&mut rx)).await {
            Ok(Read::Data(msg)) => msg,
            Ok(Read::NormalClose) if from.is_closed() || to.is_closed() => {
                // Echo of a close the other direction sent.
                superseded = true;
                break;
            }
            Ok(Read::NormalClose) => {
                debug!(direction, forwarded, "peer closed normally");
                // Claim the destination before yielding: the opposite
                // direction's writes to `from` fail from here on.
                to.close(Some(CloseStatus::Normal)).await;
                from.close(None).await;
                return Termination {
                    outcome: Outcome::PeerClosed,
                    forwarded,
                };
            }
            Ok(Read::Failed(reason)) => {
                debug!(direction, forwarded, "read failed: {}", reason);
                break;
            }
            Err(_) => break,
        };

        let bytes = msg.len();
        match timeout_at(deadline, to.send(msg)).await {
            Ok(Ok(())) => {
                forwarded += 1;
                counters::messages_relayed_total();
                counters::payload_bytes_total(bytes as u64);
            }
            Ok(Err(e)) => {
                debug!(direction, forwarded, "write failed: {}", e);
                superseded = is_closing(&e);
                break;
            }
            Err(_) => break,
        }
    }

    if superseded || from.is_closed() || to.is_closed() {
        debug!(direction, forwarded, "relay stopped after the other direction");
        return Termination {
            outcome: Outcome::Superseded,
            forwarded,
        };
    }

    let status = terminal_status(Instant::now(), deadline, forwarded, max_messages);
    debug!(direction, forwarded, status = ?status, "relay stopped");
    from.close(Some(status)).await;
    to.close(Some(status)).await;
    Termination {
        outcome: Outcome::Terminated(status),
        forwarded,
    }
}

/// A paired listener and connector.
pub struct RelaySession<S> {
    listener: WebSocketStream<S>,
    connector: WebSocketStream<S>,
    deadline: Instant,
    max_messages: u32,
}

impl<S> RelaySession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a session whose pairing ends no later than `deadline`.
    #[must_use]
    pub fn new(
        listener: WebSocketStream<S>,
        connector: WebSocketStream<S>,
        deadline: Instant,
        max_messages: u32,
    ) -> Self {
        Self {
            listener,
            connector,
            deadline,
            max_messages,
        }
    }

    /// Relay until both directions have stopped.
    pub async fn run(self) -> SessionReport {
        let started = Instant::now();
        gauges::inc_sessions_active();

        let (listener_tx, listener_rx) = self.listener.split();
        let (connector_tx, connector_rx) = self.connector.split();
        let listener = Arc::new(Peer::new("listener", listener_tx));
        let connector = Arc::new(Peer::new("connector", connector_tx));
        let (deadline, max_messages) = (self.deadline, self.max_messages);

        let forward = tokio::spawn({
            let (from, to) = (Arc::clone(&listener), Arc::clone(&connector));
            async move {
                relay("listener->connector", listener_rx, &from, &to, deadline, max_messages).await
            }
        });
        let backward = tokio::spawn({
            let (from, to) = (Arc::clone(&connector), Arc::clone(&listener));
            async move {
                relay("connector->listener", connector_rx, &from, &to, deadline, max_messages).await
            }
        });

        let (forward, backward) = tokio::join!(forward, backward);
        let listener_to_connector = Self::joined(forward, &listener, &connector).await;
        let connector_to_listener = Self::joined(backward, &listener, &connector).await;

        let report = SessionReport {
            listener_to_connector,
            connector_to_listener,
            listener_status: listener.closed_with().flatten(),
            connector_status: connector.closed_with().flatten(),
        };

        gauges::dec_sessions_active();
        histograms::session_duration_seconds(started.elapsed().as_secs_f64());
        report
    }

    /// A panicked relay task still closes both connections.
    async fn joined(
        result: Result<Termination, tokio::task::JoinError>,
        listener: &Peer<S>,
        connector: &Peer<S>,
    ) -> Termination {
        match result {
            Ok(termination) => termination,
            Err(e) => {
                tracing::error!("relay task failed: {}", e);
                listener.close(Some(CloseStatus::InternalError)).await;
                connector.close(Some(CloseStatus::InternalError)).await;
                Termination {
                    outcome: Outcome::Terminated(CloseStatus::InternalError),
                    forwarded: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};

    type Ws = WebSocketStream<DuplexStream>;

    /// Returns (broker side, peer side).
    async fn ws_pair(config: Option<WebSocketConfig>) -> (Ws, Ws) {
        let (broker, peer) = tokio::io::duplex(64 * 1024);
        let broker = WebSocketStream::from_raw_socket(broker, Role::Server, config).await;
        let peer = WebSocketStream::from_raw_socket(peer, Role::Client, None).await;
        (broker, peer)
    }

    /// Read until the stream ends; returns data messages and close codes.
    async fn drain(ws: &mut Ws) -> (Vec<Message>, Vec<u16>) {
        let mut data = Vec::new();
        let mut closes = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Close(frame) => closes.push(frame.map_or(1005, |f| u16::from(f.code))),
                Message::Text(_) | Message::Binary(_) => data.push(msg),
                _ => {}
            }
        }
        (data, closes)
    }

    async fn start(
        max_messages: u32,
        pipe: Duration,
        config: Option<WebSocketConfig>,
    ) -> (tokio::task::JoinHandle<SessionReport>, Ws, Ws) {
        let (listener, listen_peer) = ws_pair(config).await;
        let (connector, connect_peer) = ws_pair(config).await;
        let session = RelaySession::new(listener, connector, Instant::now() + pipe, max_messages);
        (tokio::spawn(session.run()), listen_peer, connect_peer)
    }

    #[test]
    fn terminal_status_prefers_deadline() {
        let now = Instant::now();
        assert_eq!(terminal_status(now, now, 8, 8), CloseStatus::PipeTimeout);
        assert_eq!(
            terminal_status(now, now + Duration::from_secs(1), 8, 8),
            CloseStatus::TooManyMessages
        );
        assert_eq!(
            terminal_status(now, now + Duration::from_secs(1), 3, 8),
            CloseStatus::InternalError
        );
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let frame = close_frame(CloseStatus::TooManyMessages);
        assert_eq!(u16::from(frame.code), 4002);
        assert_eq!(frame.reason, "Too Many Messages");
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_both_ways_and_propagates_normal_closure() {
        let (session, mut a, mut b) = start(8, Duration::from_secs(10), None).await;

        a.send(Message::Text("offer".into())).await.unwrap();
        a.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(b.next().await.unwrap().unwrap(), Message::Text("offer".into()));
        assert_eq!(b.next().await.unwrap().unwrap(), Message::Binary(vec![1, 2, 3]));

        b.send(Message::Text("answer".into())).await.unwrap();
        assert_eq!(a.next().await.unwrap().unwrap(), Message::Text("answer".into()));

        a.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        }))
        .await
        .unwrap();

        let ((_, a_closes), (b_data, b_closes)) = tokio::join!(drain(&mut a), drain(&mut b));
        assert!(b_data.is_empty());
        assert_eq!(b_closes, vec![1000]);
        // A only sees the echo of its own close.
        assert_eq!(a_closes, vec![1000]);

        let report = session.await.unwrap();
        assert_eq!(report.listener_to_connector.outcome, Outcome::PeerClosed);
        assert_eq!(report.listener_to_connector.forwarded, 2);
        assert_eq!(report.connector_to_listener.forwarded, 1);
        assert_eq!(report.listener_status, None);
        assert_eq!(report.connector_status, Some(CloseStatus::Normal));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn normal_close_reaches_a_peer_that_is_still_sending() {
        for run in 0..100 {
            let (session, mut a, b) = start(10_000, Duration::from_secs(10), None).await;
            let (mut b_tx, mut b_rx) = b.split();
            let chatter = tokio::spawn(async move {
                for i in 0..500 {
                    if b_tx.send(Message::Text(format!("tick {i}"))).await.is_err() {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            });

            // Relaying is under way once the first tick arrives.
            assert!(matches!(a.next().await, Some(Ok(Message::Text(_)))));
            a.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await
            .unwrap();

            let b_closes = async {
                let mut closes = Vec::new();
                while let Some(Ok(msg)) = b_rx.next().await {
                    if let Message::Close(frame) = msg {
                        closes.push(frame.map_or(1005, |f| u16::from(f.code)));
                    }
                }
                closes
            };
            let ((_, a_closes), b_closes) = tokio::join!(drain(&mut a), b_closes);
            assert_eq!(b_closes, vec![1000], "run {run}");
            assert_eq!(a_closes, vec![1000], "run {run}");

            let report = session.await.unwrap();
            assert_eq!(report.listener_to_connector.outcome, Outcome::PeerClosed, "run {run}");
            assert_eq!(report.connector_to_listener.outcome, Outcome::Superseded, "run {run}");
            assert_eq!(report.connector_status, Some(CloseStatus::Normal), "run {run}");
            chatter.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ninth_message_is_never_forwarded() {
        let (session, mut a, mut b) = start(8, Duration::from_secs(10), None).await;

        for i in 0..9 {
            a.send(Message::Text(format!("msg {i}"))).await.unwrap();
        }

        let ((a_data, a_closes), (b_data, b_closes)) = tokio::join!(drain(&mut a), drain(&mut b));
        assert!(a_data.is_empty());
        assert_eq!(b_data.len(), 8);
        assert_eq!(b_data[7], Message::Text("msg 7".into()));
        assert_eq!(a_closes, vec![4002]);
        assert_eq!(b_closes, vec![4002]);

        let report = session.await.unwrap();
        assert_eq!(
            report.listener_to_connector,
            Termination {
                outcome: Outcome::Terminated(CloseStatus::TooManyMessages),
                forwarded: 8,
            }
        );
        assert_eq!(report.listener_status, Some(CloseStatus::TooManyMessages));
        assert_eq!(report.connector_status, Some(CloseStatus::TooManyMessages));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_pairing_times_out_on_both_sides() {
        let started = Instant::now();
        let (session, mut a, mut b) = start(8, Duration::from_secs(10), None).await;

        let ((_, a_closes), (_, b_closes)) = tokio::join!(drain(&mut a), drain(&mut b));
        assert_eq!(a_closes, vec![4001]);
        assert_eq!(b_closes, vec![4001]);

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "closed after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(12), "closed after {elapsed:?}");

        let report = session.await.unwrap();
        assert_eq!(report.listener_status, Some(CloseStatus::PipeTimeout));
        assert_eq!(report.connector_status, Some(CloseStatus::PipeTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_shared_not_renewed_per_message() {
        let started = Instant::now();
        let (session, mut a, mut b) = start(100, Duration::from_secs(10), None).await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            if a.send(Message::Text("tick".into())).await.is_err() {
                break;
            }
        }

        let ((_, a_closes), (b_data, b_closes)) = tokio::join!(drain(&mut a), drain(&mut b));
        assert_eq!(b_data.len(), 3);
        assert_eq!(a_closes, vec![4001]);
        assert_eq!(b_closes, vec![4001]);
        assert!(started.elapsed() < Duration::from_secs(13));
        assert_eq!(session.await.unwrap().listener_status, Some(CloseStatus::PipeTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_message_is_an_internal_error() {
        let config = WebSocketConfig {
            max_message_size: Some(16),
            max_frame_size: Some(16),
            ..WebSocketConfig::default()
        };
        let (session, mut a, mut b) = start(8, Duration::from_secs(10), Some(config)).await;

        a.send(Message::Binary(vec![0u8; 64])).await.unwrap();

        let ((_, a_closes), (b_data, b_closes)) = tokio::join!(drain(&mut a), drain(&mut b));
        assert!(b_data.is_empty());
        assert_eq!(a_closes, vec![1011]);
        assert_eq!(b_closes, vec![1011]);
        assert_eq!(
            session.await.unwrap().connector_status,
            Some(CloseStatus::InternalError)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn racing_closes_send_one_frame() {
        let (broker, mut peer) = ws_pair(None).await;
        let (tx, rx) = broker.split();
        let peer_side = Peer::new("listener", tx);

        let (first, second) = tokio::join!(
            peer_side.close(Some(CloseStatus::TooManyMessages)),
            peer_side.close(Some(CloseStatus::InternalError)),
        );
        assert!(first ^ second);
        assert!(!peer_side.close(Some(CloseStatus::PipeTimeout)).await);
        assert!(peer_side.is_closed());
        let status = peer_side.closed_with().flatten();

        drop(peer_side);
        drop(rx);
        let (_, closes) = drain(&mut peer).await;
        assert_eq!(closes.len(), 1);
        assert_eq!(CloseStatus::from_code(closes[0]), status);
    }
}
