//! Client error types.

use thiserror::Error;
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Errors returned by [`Signaller`](crate::Signaller) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The broker URL or a request header could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The broker answered the upgrade with an HTTP error.
    #[error("broker refused the upgrade: {0}")]
    Refused(StatusCode),
    /// The connection failed before the close handshake.
    #[error("connection failed: {0}")]
    Failed(String),
    /// [`close`](crate::Signaller::close) was called.
    #[error("signaller is closing")]
    Closing,
    /// The connection has ended.
    #[error("signaller is closed")]
    Closed,
}
