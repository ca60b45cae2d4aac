use crate::metrics::gauges;
use crate::registry::Registry;
use crate::relay::close_connection;
use signal_common::CloseStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Evict expired entries once, closing each with `ListenTimeout`.
///
/// Each close runs in its own task so a stalled peer cannot delay the
/// others. Returns the number of evicted entries.
pub fn sweep_once<S>(registry: &Registry<WebSocketStream<S>>, now: Instant) -> usize
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let evicted = registry.sweep(now);
    let count = evicted.len();
    for (handle, entry) in evicted {
        debug!(handle = %handle, "listen timeout");
        tokio::spawn(close_connection(entry.conn, CloseStatus::ListenTimeout));
    }
    count
}

/// Spawn the periodic expiry task. It runs until aborted.
pub fn spawn_sweeper<S>(registry: Arc<Registry<WebSocketStream<S>>>, period: Duration) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = sweep_once(&registry, Instant::now());
            if evicted > 0 {
                debug!(evicted, "swept expired listeners");
            }
            gauges::set_pending_handles(registry.len());
        }
    })
}
