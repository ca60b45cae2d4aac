//! Route paths and close codes for the signald protocol.

use crate::handle::Handle;

/// Path prefix a listening peer upgrades on.
pub const LISTEN_PREFIX: &str = "/listen/";
/// Path prefix a connecting peer upgrades on.
pub const CONNECT_PREFIX: &str = "/connect/";

/// WebSocket close codes sent by the broker when it ends a connection.
pub mod close_code {
    /// The peer closed the pairing normally; propagated to the other side.
    pub const NORMAL: u16 = 1000;
    /// Unclassified failure inside the pairing.
    pub const INTERNAL_ERROR: u16 = 1011;
    /// A listening connection was not claimed before its deadline.
    pub const LISTEN_TIMEOUT: u16 = 4000;
    /// The pairing's shared deadline elapsed.
    pub const PIPE_TIMEOUT: u16 = 4001;
    /// A peer reached the per-direction message ceiling.
    pub const TOO_MANY_MESSAGES: u16 = 4002;
}

/// Why the broker closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseStatus {
    /// Normal closure passed through from the other peer.
    Normal,
    /// Pending entry expired unclaimed.
    ListenTimeout,
    /// Pairing deadline elapsed.
    PipeTimeout,
    /// Message ceiling reached.
    TooManyMessages,
    /// Anything else.
    InternalError,
}

impl CloseStatus {
    /// The WebSocket close code carried on the wire.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => close_code::NORMAL,
            Self::ListenTimeout => close_code::LISTEN_TIMEOUT,
            Self::PipeTimeout => close_code::PIPE_TIMEOUT,
            Self::TooManyMessages => close_code::TOO_MANY_MESSAGES,
            Self::InternalError => close_code::INTERNAL_ERROR,
        }
    }

    /// Human-readable close reason carried next to the code.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "Normal Closure",
            Self::ListenTimeout => "Listen Timeout",
            Self::PipeTimeout => "Pipe Timeout",
            Self::TooManyMessages => "Too Many Messages",
            Self::InternalError => "Internal Error",
        }
    }

    /// Maps a received close code back to a status, if it is one of ours.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            close_code::NORMAL => Some(Self::Normal),
            close_code::LISTEN_TIMEOUT => Some(Self::ListenTimeout),
            close_code::PIPE_TIMEOUT => Some(Self::PipeTimeout),
            close_code::TOO_MANY_MESSAGES => Some(Self::TooManyMessages),
            close_code::INTERNAL_ERROR => Some(Self::InternalError),
            _ => None,
        }
    }

    /// Short label used for metrics and logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::ListenTimeout => "listen_timeout",
            Self::PipeTimeout => "pipe_timeout",
            Self::TooManyMessages => "too_many_messages",
            Self::InternalError => "internal_error",
        }
    }
}

/// The two upgrade endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/listen/{handle}`
    Listen(Handle),
    /// `/connect/{handle}`
    Connect(Handle),
}

impl Route {
    /// Parses a request path. Returns `None` for unknown paths and for
    /// handles that fail validation.
    ///
    /// # Examples
    ///
    /// ```
    /// use signal_common::Route;
    /// assert!(matches!(Route::parse("/listen/abc_12"), Some(Route::Listen(_))));
    /// assert!(Route::parse("/listen/AB").is_none());
    /// ```
    #[must_use]
    pub fn parse(path: &str) -> Option<Self> {
        if let Some(rest) = path.strip_prefix(LISTEN_PREFIX) {
            rest.parse().ok().map(Self::Listen)
        } else if let Some(rest) = path.strip_prefix(CONNECT_PREFIX) {
            rest.parse().ok().map(Self::Connect)
        } else {
            None
        }
    }

    /// The handle this route refers to.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        match self {
            Self::Listen(h) | Self::Connect(h) => h,
        }
    }

    /// Request path for this route.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            Self::Listen(h) => format!("{LISTEN_PREFIX}{h}"),
            Self::Connect(h) => format!("{CONNECT_PREFIX}{h}"),
        }
    }
}
