use thiserror::Error;

/// Errors surfaced to status subscribers.
#[derive(Error, Debug, Clone)]
pub enum BroadcastError {
    #[error("Broadcast channel closed")]
    Closed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}
