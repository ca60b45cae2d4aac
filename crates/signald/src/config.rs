use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the broker.
#[derive(Parser, Debug, Clone)]
#[command(name = "signald")]
#[command(about = "Rendezvous and relay broker for WebSocket peers")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "SIGNALD_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "SIGNALD_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Regular expression the Origin request header must match.
    ///
    /// When unset, the handshake fails if an Origin header is present and
    /// its host differs from the Host header.
    #[arg(long, env = "SIGNALD_ORIGIN_RE")]
    pub origin_re: Option<String>,
    /// Seconds a listening connection may wait for a peer.
    #[arg(long, default_value = "60", env = "SIGNALD_LISTEN_TIMEOUT")]
    pub listen_timeout: u64,
    /// Seconds a paired connection may exchange messages.
    #[arg(long, default_value = "10", env = "SIGNALD_PIPE_TIMEOUT")]
    pub pipe_timeout: u64,
    /// Seconds between two sweeps of expired listening connections.
    #[arg(long, default_value = "5", env = "SIGNALD_SWEEP_INTERVAL")]
    pub sweep_interval: u64,
    /// Maximum size of a single message in bytes.
    #[arg(long, default_value = "1024", env = "SIGNALD_MAX_MESSAGE_SIZE")]
    pub max_message_size: usize,
    /// Maximum number of messages a peer may send during a pairing.
    #[arg(long, default_value = "8", env = "SIGNALD_MAX_MESSAGES")]
    pub max_messages: u32,
    /// WebSocket handshake timeout in seconds.
    #[arg(long, default_value = "5", env = "SIGNALD_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    pub metrics_addr: SocketAddr,
    /// Origin header pattern; `None` selects the same-origin policy.
    pub origin_re: Option<String>,
    /// How long a listening connection stays pending.
    pub listen_timeout: Duration,
    /// Shared deadline of a pairing, measured from the moment it is made.
    pub pipe_timeout: Duration,
    /// Period of the expiry sweeper.
    pub sweep_interval: Duration,
    /// Maximum size of a single message in bytes.
    pub max_message_size: usize,
    /// Per-direction message ceiling.
    pub max_messages: u32,
    /// WebSocket handshake timeout.
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.sweep_interval.is_zero() {
            return Err("sweep_interval must be greater than 0".to_string());
        }

        // Deadlines must outlast one sweep period, otherwise an entry could
        // expire and still be claimable for a whole period.
        if self.listen_timeout <= self.sweep_interval {
            return Err(format!(
                "listen_timeout must be greater than sweep_interval ({:?})",
                self.sweep_interval
            ));
        }
        if self.listen_timeout > Duration::from_secs(86_400) {
            return Err("listen_timeout exceeds reasonable limit (86400 seconds)".to_string());
        }
        if self.pipe_timeout <= self.sweep_interval {
            return Err(format!(
                "pipe_timeout must be greater than sweep_interval ({:?})",
                self.sweep_interval
            ));
        }
        if self.pipe_timeout > Duration::from_secs(86_400) {
            return Err("pipe_timeout exceeds reasonable limit (86400 seconds)".to_string());
        }

        const MAX_ALLOWED_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
        if self.max_message_size == 0 {
            return Err("max_message_size must be greater than 0".to_string());
        }
        if self.max_message_size > MAX_ALLOWED_MESSAGE_SIZE {
            return Err(format!(
                "max_message_size exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_MESSAGE_SIZE
            ));
        }

        if self.max_messages == 0 {
            return Err("max_messages must be greater than 0".to_string());
        }
        if self.max_messages > 100_000 {
            return Err("max_messages exceeds reasonable limit (100,000)".to_string());
        }

        if self.handshake_timeout.is_zero() {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > Duration::from_secs(300) {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if let Some(re) = &self.origin_re {
            if let Err(e) = regex::Regex::new(re) {
                return Err(format!("origin_re is not a valid regex: {e}"));
            }
        }
        Ok(())
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            origin_re: args.origin_re.filter(|re| !re.is_empty()),
            listen_timeout: Duration::from_secs(args.listen_timeout),
            pipe_timeout: Duration::from_secs(args.pipe_timeout),
            sweep_interval: Duration::from_secs(args.sweep_interval),
            max_message_size: args.max_message_size,
            max_messages: args.max_messages,
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
        }
    }
}
