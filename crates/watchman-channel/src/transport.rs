//! Gateway transport abstraction.
//!
//! The messaging network is reached through a gateway connection that behaves
//! like a long-lived, externally-driven event emitter: it pushes pairing
//! challenges, session-open signals, credential rotations, and close signals
//! at its own pace. The session task consumes those events through
//! [`GatewayLink`]; [`GatewayTransport`] dials a fresh link per session.

use crate::credentials::Credentials;
use crate::error::ChannelError;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Why the gateway closed the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The account was deliberately signed out on the network side. Terminal:
    /// reconnecting with the same credentials will never succeed.
    LoggedOut,
    /// Transient loss: network error, timeout, or server-initiated drop.
    ConnectionLost(String),
}

impl CloseReason {
    pub fn is_authoritative_logout(&self) -> bool {
        matches!(self, CloseReason::LoggedOut)
    }
}

/// A joined group or chat the session can send to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    /// Channel identifier the gateway accepts as a send destination.
    pub id: String,
    /// Human-readable name, for the operator picking a target.
    pub name: String,
}

/// An event pushed by the gateway over a live link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A fresh pairing challenge to present to the operator. The link stays
    /// open while the challenge awaits confirmation on the paired device.
    PairingChallenge(String),
    /// The session is open and ready to send. Carries freshly issued
    /// credentials when this open completed a pairing cycle.
    Opened { credentials: Option<Credentials> },
    /// Incremental credential rotation. Must be persisted before the session
    /// acknowledges it.
    CredentialUpdate(Credentials),
    /// The gateway closed the session.
    Closed(CloseReason),
}

/// A live connection to the messaging gateway.
///
/// Owned exclusively by the session task; event consumption and sends are
/// serialized through that single owner, so implementations need no internal
/// locking for correctness.
pub trait GatewayLink: Send + 'static {
    /// Wait for the next gateway event. After a `Closed` event the link is
    /// dead and only `close` should be called.
    fn event(&mut self) -> impl Future<Output = LinkEvent> + Send;

    /// Deliver one message to a target channel identifier. At-most-once: an
    /// error here is reported, never retried.
    fn send(
        &mut self,
        target: &str,
        text: &str,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// List the groups and chats the session has joined, so an operator can
    /// discover valid send targets.
    fn targets(&mut self) -> impl Future<Output = Result<Vec<TargetInfo>, ChannelError>> + Send;

    /// Perform the network's authoritative sign-out for this account.
    fn logout(&mut self) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Tear the link down without signing out.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Dials the messaging gateway.
pub trait GatewayTransport: Send + Sync + 'static {
    type Link: GatewayLink;

    /// Open a new link. With credentials, the gateway resumes the existing
    /// session; without, it starts a pairing cycle and will push a
    /// [`LinkEvent::PairingChallenge`].
    fn connect(
        &self,
        credentials: Option<Credentials>,
    ) -> impl Future<Output = Result<Self::Link, ChannelError>> + Send;
}

/// Frames the client writes to the gateway socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Resume an existing session.
    Hello { credentials: Credentials },
    /// Start a pairing cycle for a fresh device.
    Pair,
    /// Deliver a message. `id` correlates the gateway's ack.
    Send {
        id: String,
        target: String,
        text: String,
    },
    /// List joined groups and chats. `id` correlates the gateway's reply.
    Targets { id: String },
    /// Authoritative sign-out for this account.
    Logout,
}

/// Frames the gateway writes back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    Challenge {
        code: String,
    },
    Open {
        #[serde(default)]
        credentials: Option<Credentials>,
    },
    Creds {
        credentials: Credentials,
    },
    Ack {
        id: String,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Targets {
        id: String,
        targets: Vec<TargetInfo>,
    },
    Close {
        reason: String,
    },
}

/// Close-frame reason string the gateway uses for an authoritative sign-out.
pub const CLOSE_REASON_LOGGED_OUT: &str = "logged-out";

impl ServerFrame {
    /// Map a close frame's reason string to a typed [`CloseReason`].
    pub fn close_reason(reason: &str) -> CloseReason {
        if reason == CLOSE_REASON_LOGGED_OUT {
            CloseReason::LoggedOut
        } else {
            CloseReason::ConnectionLost(reason.to_string())
        }
    }
}
