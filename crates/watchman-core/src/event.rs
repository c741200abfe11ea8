use crate::error::BroadcastError;
use crate::status::SessionStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An event pushed to dashboard observers as the channel session evolves.
///
/// There is no history or replay: a subscriber that registers after an event
/// was emitted misses it and must catch up via an explicit status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum StatusEvent {
    /// The session moved to a new state.
    Status(SessionStatus),
    /// A fresh pairing challenge was issued by the network. Opaque payload,
    /// rendered by the dashboard as a QR-equivalent.
    PairingChallenge(String),
}

/// Fan-out of [`StatusEvent`]s to any number of transient subscribers.
///
/// Built on `tokio::sync::broadcast`: publishing never blocks and never fails
/// when nobody is listening. Slow subscribers observe a lag error and keep
/// receiving from the oldest retained event.
#[derive(Clone)]
pub struct StatusBroadcaster {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusBroadcaster {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all currently-registered subscribers.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.sender.send(event);
    }

    /// Register a new subscriber. Only events published after this call are
    /// delivered.
    pub fn subscribe(&self) -> StatusSubscription {
        StatusSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of currently-registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// A single subscriber's view of the event stream.
pub struct StatusSubscription {
    receiver: broadcast::Receiver<StatusEvent>,
}

impl StatusSubscription {
    pub async fn recv(&mut self) -> Result<StatusEvent, BroadcastError> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Closed) => Err(BroadcastError::Closed),
            Err(broadcast::error::RecvError::Lagged(count)) => Err(BroadcastError::Lagged(count)),
        }
    }
}
