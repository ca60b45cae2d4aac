use signal_common::HandleError;
use thiserror::Error;
use tungstenite::http::StatusCode;

/// Errors that can occur during broker operation.
#[derive(Error, Debug)]
pub enum SignaldError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The handshake did not complete in time.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// A listen or connect request was refused.
    #[error("pairing refused: {0}")]
    Pairing(#[from] PairingError),
    /// The server stopped accepting work.
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Reasons a listen or connect request is refused before relaying starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    /// The request path is not a listen/connect route with a valid handle.
    #[error("invalid handle: {0}")]
    InvalidHandle(#[from] HandleError),
    /// The path does not name an endpoint.
    #[error("no such route")]
    UnknownRoute,
    /// The Origin header was rejected by the origin policy.
    #[error("origin not allowed")]
    Forbidden,
    /// Another peer is already listening on this handle.
    #[error("handle already pending")]
    Conflict,
    /// Nobody is listening on this handle.
    #[error("no such pending handle")]
    NotFound,
    /// The WebSocket upgrade failed after the request was accepted.
    #[error("upgrade failed: {0}")]
    Upgrade(String),
}

impl PairingError {
    /// HTTP status returned on the handshake response.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidHandle(_) | Self::UnknownRoute | Self::NotFound => StatusCode::NOT_FOUND,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Conflict => StatusCode::CONFLICT,
            Self::Upgrade(_) => StatusCode::BAD_REQUEST,
        }
    }
}
