use thiserror::Error;
use watchman_core::SessionStatus;

/// Errors from the credential store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the channel session and its transport.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Send attempted while the session is not `Connected`. Synchronous
    /// precondition failure; no network I/O was performed.
    #[error("Channel not ready to send (status: {0})")]
    NotReady(SessionStatus),

    /// The transport rejected or timed out a send. Never retried; delivery
    /// is at-most-once by design.
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    /// No valid credentials; the network requires a fresh pairing cycle.
    #[error("Pairing required")]
    PairingRequired,

    /// The account was authoritatively signed out on the network side.
    #[error("Session signed out by the network")]
    AuthoritativeLogout,

    /// Writing credentials to the store failed. Fatal: a missed credential
    /// update strands the session on the next restart, so this must escalate
    /// instead of being swallowed.
    #[error("Credential persistence failed: {0}")]
    CredentialPersistence(#[from] StoreError),

    #[error("Invalid send argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session task is not running")]
    TaskStopped,
}

impl ChannelError {
    /// Whether reconnecting could plausibly clear this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::Transport(_)
                | ChannelError::DeliveryFailed(_)
                | ChannelError::PairingRequired
        )
    }
}
