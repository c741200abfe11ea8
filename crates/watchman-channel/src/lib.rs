//! Messaging channel session layer.
//!
//! Owns the lifecycle of the single outbound messaging account: pairing,
//! credential persistence, reconnection with backoff, delivery, and logout.
//! The gateway itself is reached through the [`GatewayTransport`] trait;
//! [`ws::WsGatewayTransport`] is the production WebSocket implementation.

pub mod credentials;
pub mod error;
pub mod manager;
pub mod transport;
pub mod ws;

pub use credentials::{Credentials, CredentialStore, FsCredentialStore, MemoryCredentialStore};
pub use error::{ChannelError, StoreError};
pub use manager::{ChannelManager, ChannelSnapshot};
pub use transport::{CloseReason, GatewayLink, GatewayTransport, LinkEvent, TargetInfo};
pub use ws::WsGatewayTransport;
