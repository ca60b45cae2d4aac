//! Client side of the signald rendezvous protocol.
//!
//! A [`Signaller`] opens one WebSocket on a broker, either listening on a
//! handle or connecting to a peer that listens on it, and then exchanges
//! signals with the paired peer until either side closes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod signaller;

pub use error::ClientError;
pub use signaller::{CloseEvent, ReadyState, Signal, Signaller};
