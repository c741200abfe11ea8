//! Shared types for the Watchman push-notification relay.
//!
//! This crate holds the pieces every other crate depends on: the session
//! status model for the outbound messaging channel and the broadcast fan-out
//! that pushes status transitions to dashboard observers.

pub mod error;
pub mod event;
pub mod status;

pub use error::BroadcastError;
pub use event::{StatusBroadcaster, StatusEvent, StatusSubscription};
pub use status::SessionStatus;
