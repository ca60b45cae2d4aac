//! Common types shared by the signald broker and the peers that use it.
//!
//! This crate provides:
//! - The rendezvous handle grammar ([`handle`])
//! - Route paths and close codes ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod handle;
pub mod types;

pub use handle::{Handle, HandleError};
pub use types::{CloseStatus, Route};
