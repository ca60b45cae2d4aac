#![allow(dead_code)]

use signal_client::{ClientError, Signal, Signaller};
use signal_common::{Handle, Route};
use signald::config::ServerConfig;
use signald::server::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        origin_re: None,
        listen_timeout: Duration::from_secs(5),
        pipe_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_millis(100),
        max_message_size: 1024,
        max_messages: 8,
        handshake_timeout: Duration::from_secs(5),
    }
}

pub fn handle(s: &str) -> Handle {
    s.parse().unwrap()
}

pub async fn start_server() -> (SocketAddr, Arc<ServerState>) {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(
    configure: impl FnOnce(&mut ServerConfig),
) -> (SocketAddr, Arc<ServerState>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = test_config(addr);
    configure(&mut config);
    let state = Arc::new(ServerState::new(config).unwrap());

    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = signald::run(listener, state_clone).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    (addr, state)
}

/// Wait until the broker has registered `handle` as pending.
pub async fn wait_pending(state: &ServerState, handle: &Handle) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !state.coordinator.registry().contains(handle) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("handle never became pending");
}

/// Status the broker answers a raw upgrade on `path` with. For paths a
/// [`Route`] cannot express.
pub async fn refused_path(addr: &SocketAddr, path: &str) -> StatusCode {
    match tokio_tungstenite::connect_async(format!("ws://{addr}{path}")).await {
        Err(WsError::Http(resp)) => resp.status(),
        Ok(_) => panic!("upgrade on {path} was accepted"),
        Err(e) => panic!("unexpected handshake error: {e}"),
    }
}

pub struct TestPeer {
    pub signaller: Signaller,
}

impl TestPeer {
    /// Open `route`, optionally with an Origin header. Returns the HTTP
    /// status if the broker refused the upgrade.
    pub async fn open(
        addr: &SocketAddr,
        route: &Route,
        origin: Option<&str>,
    ) -> Result<Self, StatusCode> {
        let signaller = Signaller::open(&format!("ws://{addr}"), route.clone(), origin).unwrap();
        let opened = tokio::time::timeout(Duration::from_secs(5), signaller.opened())
            .await
            .expect("timeout waiting for upgrade");
        match opened {
            Ok(()) => Ok(Self { signaller }),
            Err(ClientError::Refused(status)) => Err(status),
            Err(e) => panic!("unexpected handshake error: {e}"),
        }
    }

    /// Listen on `h` and wait until the broker has it pending.
    pub async fn listen(addr: &SocketAddr, state: &ServerState, h: &str) -> Self {
        let peer = Self::open(addr, &Route::Listen(handle(h)), None)
            .await
            .expect("listen refused");
        wait_pending(state, &handle(h)).await;
        peer
    }

    pub async fn connect(addr: &SocketAddr, h: &str) -> Self {
        Self::open(addr, &Route::Connect(handle(h)), None)
            .await
            .expect("connect refused")
    }

    pub fn send(&self, data: impl Into<Signal>) {
        self.signaller.signal(data).unwrap();
    }

    pub fn send_text(&self, text: &str) {
        self.send(text);
    }

    pub fn close_normally(&self) {
        self.signaller.close();
    }

    /// Next signal, failing after five seconds.
    pub async fn recv(&mut self) -> Signal {
        tokio::time::timeout(Duration::from_secs(5), self.signaller.recv())
            .await
            .expect("timeout waiting for signal")
            .expect("connection ended")
    }

    /// Read signals until the connection ends; returns them and the close
    /// code.
    pub async fn recv_until_close(&mut self) -> (Vec<Signal>, u16) {
        let mut data = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), self.signaller.recv())
                .await
                .expect("timeout waiting for close");
            match next {
                Some(signal) => data.push(signal),
                None => break,
            }
        }
        let event = self.signaller.closed().await;
        let code = event.code().unwrap_or_else(|| panic!("no close frame: {event:?}"));
        (data, code)
    }
}
