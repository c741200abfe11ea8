//! Channel session lifecycle.
//!
//! A single task owns the gateway link, the credential store, and the
//! reconnect timer; everything else talks to it through a [`ChannelManager`]
//! handle. Status changes fan out over a broadcast channel and the latest
//! snapshot is mirrored into a watch cell so readers never have to ask the
//! task for it.

use crate::credentials::CredentialStore;
use crate::error::ChannelError;
use crate::transport::{GatewayLink, GatewayTransport, LinkEvent, TargetInfo};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use watchman_core::{SessionStatus, StatusBroadcaster, StatusEvent, StatusSubscription};

const COMMAND_QUEUE_DEPTH: usize = 32;
const INITIAL_RECONNECT_DELAY_SECONDS: u64 = 1;
const MAX_RECONNECT_DELAY_SECONDS: u64 = 60;

/// Point-in-time view of the session, mirrored by the session task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub status: SessionStatus,
    /// The most recent pairing challenge, present only while the session is
    /// `Pairing` and a challenge is awaiting confirmation.
    pub pairing_challenge: Option<String>,
}

enum Command {
    Send {
        target: String,
        text: String,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Targets {
        reply: oneshot::Sender<Result<Vec<TargetInfo>, ChannelError>>,
    },
    Logout {
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
}

/// Cloneable handle to the session task.
#[derive(Clone)]
pub struct ChannelManager {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<ChannelSnapshot>,
    broadcaster: StatusBroadcaster,
}

impl ChannelManager {
    /// Spawn the session task. It immediately begins a session: resuming with
    /// stored credentials when present, otherwise starting a pairing cycle.
    ///
    /// The returned join handle resolves only when the task dies. An `Err`
    /// from it means an unrecoverable fault (credential persistence failure)
    /// and the process should treat the channel as lost.
    pub fn spawn<T, S>(transport: T, store: S) -> (Self, JoinHandle<Result<(), ChannelError>>)
    where
        T: GatewayTransport,
        S: CredentialStore,
    {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (snapshot_tx, snapshot_rx) = watch::channel(ChannelSnapshot::default());
        let broadcaster = StatusBroadcaster::default();

        let task = SessionTask {
            transport,
            store,
            commands: command_rx,
            snapshot: snapshot_tx,
            broadcaster: broadcaster.clone(),
            link: None,
            reconnect_at: None,
            reconnect_attempt: 0,
        };
        let handle = tokio::spawn(task.run());

        (
            Self {
                commands: command_tx,
                snapshot: snapshot_rx,
                broadcaster,
            },
            handle,
        )
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to status and pairing-challenge events.
    pub fn subscribe(&self) -> StatusSubscription {
        self.broadcaster.subscribe()
    }

    /// Deliver one message to a target channel identifier.
    ///
    /// Fails fast with [`ChannelError::NotReady`] when the session is not
    /// connected, without touching the network. Delivery is at-most-once: a
    /// failure is reported to the caller and never retried internally.
    pub async fn send(&self, target: &str, text: &str) -> Result<(), ChannelError> {
        if target.is_empty() {
            return Err(ChannelError::InvalidArgument("target must not be empty"));
        }
        if text.is_empty() {
            return Err(ChannelError::InvalidArgument("text must not be empty"));
        }

        let status = self.status();
        if !status.is_connected() {
            return Err(ChannelError::NotReady(status));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                target: target.to_string(),
                text: text.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ChannelError::TaskStopped)?;
        reply_rx.await.map_err(|_| ChannelError::TaskStopped)?
    }

    /// List the groups and chats the session has joined, for target
    /// discovery. Fails fast with [`ChannelError::NotReady`] when the session
    /// is not connected.
    pub async fn targets(&self) -> Result<Vec<TargetInfo>, ChannelError> {
        let status = self.status();
        if !status.is_connected() {
            return Err(ChannelError::NotReady(status));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Targets { reply: reply_tx })
            .await
            .map_err(|_| ChannelError::TaskStopped)?;
        reply_rx.await.map_err(|_| ChannelError::TaskStopped)?
    }

    /// Sign the account out of the messaging network, purge its stored
    /// credentials, and immediately begin a fresh pairing cycle.
    pub async fn logout(&self) -> Result<(), ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Logout { reply: reply_tx })
            .await
            .map_err(|_| ChannelError::TaskStopped)?;
        reply_rx.await.map_err(|_| ChannelError::TaskStopped)?
    }
}

enum Input {
    Command(Command),
    Link(LinkEvent),
    ReconnectDue,
    HandlesDropped,
}

struct SessionTask<T, S>
where
    T: GatewayTransport,
    S: CredentialStore,
{
    transport: T,
    store: S,
    commands: mpsc::Receiver<Command>,
    snapshot: watch::Sender<ChannelSnapshot>,
    broadcaster: StatusBroadcaster,
    link: Option<T::Link>,
    reconnect_at: Option<Instant>,
    reconnect_attempt: u32,
}

impl<T, S> SessionTask<T, S>
where
    T: GatewayTransport,
    S: CredentialStore,
{
    async fn run(mut self) -> Result<(), ChannelError> {
        self.begin_session().await?;

        loop {
            let input = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Input::Command(command),
                    None => Input::HandlesDropped,
                },
                event = Self::next_link_event(self.link.as_mut()) => Input::Link(event),
                _ = Self::reconnect_timer(self.reconnect_at) => Input::ReconnectDue,
            };

            match input {
                Input::Command(Command::Send {
                    target,
                    text,
                    reply,
                }) => {
                    let result = self.handle_send(&target, &text).await;
                    let _ = reply.send(result);
                }
                Input::Command(Command::Targets { reply }) => {
                    let result = self.handle_targets().await;
                    let _ = reply.send(result);
                }
                Input::Command(Command::Logout { reply }) => {
                    self.handle_logout(reply).await?;
                }
                Input::Link(event) => self.handle_link_event(event).await?,
                Input::ReconnectDue => {
                    self.reconnect_at = None;
                    self.begin_session().await?;
                }
                Input::HandlesDropped => {
                    info!("all channel handles dropped, stopping session task");
                    if let Some(mut link) = self.link.take() {
                        link.close().await;
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Open a new session: resume when credentials exist, pair otherwise.
    /// A connect failure arms the reconnect timer instead of propagating.
    async fn begin_session(&mut self) -> Result<(), ChannelError> {
        let credentials = match self.store.load().await {
            Ok(credentials) => credentials,
            Err(error) => {
                // A corrupt or unreadable blob is recoverable by re-pairing.
                warn!(error = %error, "failed to load stored credentials, re-pairing");
                None
            }
        };

        if credentials.is_none() {
            self.set_status(SessionStatus::Pairing);
        }

        match self.transport.connect(credentials).await {
            Ok(link) => {
                debug!("gateway link established, awaiting session open");
                self.link = Some(link);
                Ok(())
            }
            Err(error) => {
                self.schedule_reconnect(&error);
                Ok(())
            }
        }
    }

    async fn handle_send(&mut self, target: &str, text: &str) -> Result<(), ChannelError> {
        let status = self.snapshot.borrow().status;
        if !status.is_connected() {
            return Err(ChannelError::NotReady(status));
        }
        let Some(link) = self.link.as_mut() else {
            return Err(ChannelError::NotReady(status));
        };
        link.send(target, text).await
    }

    async fn handle_targets(&mut self) -> Result<Vec<TargetInfo>, ChannelError> {
        let status = self.snapshot.borrow().status;
        if !status.is_connected() {
            return Err(ChannelError::NotReady(status));
        }
        let Some(link) = self.link.as_mut() else {
            return Err(ChannelError::NotReady(status));
        };
        link.targets().await
    }

    async fn handle_logout(
        &mut self,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    ) -> Result<(), ChannelError> {
        // Cancel any pending reconnect before the credentials go away, so a
        // stale timer can never resume a session we are discarding.
        self.reconnect_at = None;
        self.reconnect_attempt = 0;

        if let Some(mut link) = self.link.take() {
            if let Err(error) = link.logout().await {
                warn!(error = %error, "network sign-out failed, purging credentials anyway");
            }
            link.close().await;
        }

        if let Err(error) = self.store.clear().await {
            // Credentials we meant to destroy are still on disk. Escalate;
            // the reply sender is dropped and the caller observes the task
            // stopping.
            return Err(error.into());
        }

        self.set_status(SessionStatus::LoggedOut);
        let _ = reply.send(Ok(()));

        info!("logout complete, starting fresh pairing cycle");
        self.begin_session().await
    }

    async fn handle_link_event(&mut self, event: LinkEvent) -> Result<(), ChannelError> {
        match event {
            LinkEvent::PairingChallenge(code) => {
                info!("pairing challenge received");
                self.snapshot.send_modify(|snapshot| {
                    snapshot.status = SessionStatus::Pairing;
                    snapshot.pairing_challenge = Some(code.clone());
                });
                self.broadcaster
                    .publish(StatusEvent::Status(SessionStatus::Pairing));
                self.broadcaster.publish(StatusEvent::PairingChallenge(code));
            }
            LinkEvent::Opened { credentials } => {
                if let Some(credentials) = credentials {
                    // Freshly issued at pairing time. Persist before treating
                    // the session as open; losing them strands the account.
                    self.store.save(&credentials).await?;
                }
                self.reconnect_attempt = 0;
                self.set_status(SessionStatus::Connected);
                info!("channel session open");
            }
            LinkEvent::CredentialUpdate(credentials) => {
                self.store.save(&credentials).await?;
                debug!("persisted rotated session credentials");
            }
            LinkEvent::Closed(reason) => {
                if let Some(mut link) = self.link.take() {
                    link.close().await;
                }
                if reason.is_authoritative_logout() {
                    warn!("session signed out by the network, purging credentials");
                    self.store.clear().await?;
                    self.reconnect_at = None;
                    self.reconnect_attempt = 0;
                    self.set_status(SessionStatus::LoggedOut);
                } else {
                    let error = ChannelError::Transport(format!("session closed: {reason:?}"));
                    self.schedule_reconnect(&error);
                }
            }
        }
        Ok(())
    }

    fn schedule_reconnect(&mut self, error: &ChannelError) {
        self.link = None;
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(self.reconnect_attempt);
        warn!(
            error = %error,
            attempt = self.reconnect_attempt,
            delay_seconds = delay.as_secs(),
            "gateway session lost, reconnect scheduled"
        );
        self.reconnect_at = Some(Instant::now() + delay);
        self.set_status(SessionStatus::Disconnected);
    }

    fn set_status(&mut self, status: SessionStatus) {
        let changed = self.snapshot.borrow().status != status;
        self.snapshot.send_modify(|snapshot| {
            snapshot.status = status;
            if status != SessionStatus::Pairing {
                snapshot.pairing_challenge = None;
            }
        });
        if changed {
            self.broadcaster.publish(StatusEvent::Status(status));
        }
    }

    async fn next_link_event<L: GatewayLink>(link: Option<&mut L>) -> LinkEvent {
        match link {
            Some(link) => link.event().await,
            None => std::future::pending().await,
        }
    }

    async fn reconnect_timer(at: Option<Instant>) {
        match at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

/// Exponential reconnect backoff: 1s, 2s, 4s, ... capped at 60s.
fn reconnect_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1);
    let seconds = 1_u64.checked_shl(shift).unwrap_or(u64::MAX).clamp(
        INITIAL_RECONNECT_DELAY_SECONDS,
        MAX_RECONNECT_DELAY_SECONDS,
    );
    Duration::from_secs(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credentials, MemoryCredentialStore, CREDENTIALS_VERSION};
    use crate::error::StoreError;
    use crate::transport::CloseReason;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::time;

    #[derive(Default)]
    struct ScriptState {
        connect_outcomes: VecDeque<Result<(), ChannelError>>,
        connect_calls: u32,
        connect_credentials: Vec<Option<Credentials>>,
        sent: Vec<(String, String)>,
        logout_calls: u32,
        send_ok: bool,
        targets: Vec<TargetInfo>,
        link_events: Option<mpsc::UnboundedSender<LinkEvent>>,
    }

    #[derive(Clone)]
    struct TestTransport {
        state: Arc<Mutex<ScriptState>>,
    }

    impl TestTransport {
        fn scripted(outcomes: Vec<Result<(), ChannelError>>) -> Self {
            Self {
                state: Arc::new(Mutex::new(ScriptState {
                    connect_outcomes: outcomes.into_iter().collect(),
                    send_ok: true,
                    ..ScriptState::default()
                })),
            }
        }

        fn failing_sends(self) -> Self {
            self.state.lock().unwrap().send_ok = false;
            self
        }

        fn with_targets(self, targets: Vec<TargetInfo>) -> Self {
            self.state.lock().unwrap().targets = targets;
            self
        }

        fn connect_calls(&self) -> u32 {
            self.state.lock().unwrap().connect_calls
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.state.lock().unwrap().sent.clone()
        }

        fn logout_calls(&self) -> u32 {
            self.state.lock().unwrap().logout_calls
        }

        fn connect_credentials(&self) -> Vec<Option<Credentials>> {
            self.state.lock().unwrap().connect_credentials.clone()
        }

        fn push_event(&self, event: LinkEvent) {
            let state = self.state.lock().unwrap();
            state
                .link_events
                .as_ref()
                .expect("no live link to push events into")
                .send(event)
                .expect("session task dropped the link");
        }

        fn has_live_link(&self) -> bool {
            self.state.lock().unwrap().link_events.is_some()
        }
    }

    struct TestLink {
        events: mpsc::UnboundedReceiver<LinkEvent>,
        state: Arc<Mutex<ScriptState>>,
        send_ok: bool,
    }

    impl GatewayLink for TestLink {
        async fn event(&mut self) -> LinkEvent {
            match self.events.recv().await {
                Some(event) => event,
                // Script exhausted: stay silent rather than fabricating a
                // close.
                None => std::future::pending().await,
            }
        }

        async fn send(&mut self, target: &str, text: &str) -> Result<(), ChannelError> {
            self.state
                .lock()
                .unwrap()
                .sent
                .push((target.to_string(), text.to_string()));
            if self.send_ok {
                Ok(())
            } else {
                Err(ChannelError::DeliveryFailed("gateway rejected".into()))
            }
        }

        async fn targets(&mut self) -> Result<Vec<TargetInfo>, ChannelError> {
            Ok(self.state.lock().unwrap().targets.clone())
        }

        async fn logout(&mut self) -> Result<(), ChannelError> {
            self.state.lock().unwrap().logout_calls += 1;
            Ok(())
        }

        async fn close(&mut self) {}
    }

    impl GatewayTransport for TestTransport {
        type Link = TestLink;

        async fn connect(
            &self,
            credentials: Option<Credentials>,
        ) -> Result<Self::Link, ChannelError> {
            let mut state = self.state.lock().unwrap();
            state.connect_calls += 1;
            state.connect_credentials.push(credentials);
            match state.connect_outcomes.pop_front().unwrap_or(Ok(())) {
                Ok(()) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    state.link_events = Some(tx);
                    Ok(TestLink {
                        events: rx,
                        state: Arc::clone(&self.state),
                        send_ok: state.send_ok,
                    })
                }
                Err(error) => Err(error),
            }
        }
    }

    fn sample_credentials() -> Credentials {
        Credentials {
            version: CREDENTIALS_VERSION,
            device_id: "device-1".into(),
            noise_key: "k0".into(),
            paired_at: Utc::now(),
        }
    }

    /// Yield until the condition holds. Deterministic on a current-thread
    /// runtime; panics rather than hanging when the condition never holds.
    async fn settle(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition did not settle");
    }

    /// Give the session task a chance to process everything already queued.
    async fn drain() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn recv_event(subscription: &mut StatusSubscription) -> StatusEvent {
        time::timeout(Duration::from_millis(100), subscription.recv())
            .await
            .expect("timed out waiting for status event")
            .expect("status stream closed")
    }

    #[test]
    fn reconnect_delay_is_exponential_and_capped_at_sixty_seconds() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(6), Duration::from_secs(32));
        assert_eq!(reconnect_delay(7), Duration::from_secs(60));
        assert_eq!(reconnect_delay(99), Duration::from_secs(60));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pairing_cycle_publishes_challenge_then_connected() {
        let transport = TestTransport::scripted(vec![Ok(())]);
        let store = Arc::new(MemoryCredentialStore::new());

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), Arc::clone(&store));
        let mut events = manager.subscribe();

        settle(|| transport.has_live_link()).await;
        assert_eq!(transport.connect_credentials(), vec![None]);
        assert_eq!(
            recv_event(&mut events).await,
            StatusEvent::Status(SessionStatus::Pairing)
        );

        transport.push_event(LinkEvent::PairingChallenge("qr-payload".into()));
        assert_eq!(
            recv_event(&mut events).await,
            StatusEvent::PairingChallenge("qr-payload".into())
        );
        assert_eq!(
            manager.snapshot().pairing_challenge,
            Some("qr-payload".to_string())
        );

        transport.push_event(LinkEvent::Opened {
            credentials: Some(sample_credentials()),
        });
        assert_eq!(
            recv_event(&mut events).await,
            StatusEvent::Status(SessionStatus::Connected)
        );

        // Pairing credentials were persisted and the challenge cleared.
        assert!(store.load().await.unwrap().is_some());
        assert_eq!(manager.snapshot().pairing_challenge, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_while_not_connected_fails_fast_without_io() {
        let transport = TestTransport::scripted(vec![Err(ChannelError::Transport(
            "refused".into(),
        ))]);
        let store = MemoryCredentialStore::with_credentials(sample_credentials());

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), store);

        let result = manager.send("12345@group", "hello").await;
        assert!(matches!(
            result,
            Err(ChannelError::NotReady(SessionStatus::Disconnected))
        ));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_rejects_empty_arguments() {
        let transport = TestTransport::scripted(vec![Ok(())]);
        let (manager, _handle) =
            ChannelManager::spawn(transport, MemoryCredentialStore::new());

        assert!(matches!(
            manager.send("", "hello").await,
            Err(ChannelError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.send("12345@group", "").await,
            Err(ChannelError::InvalidArgument(_))
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn send_delivers_once_while_connected() {
        let transport = TestTransport::scripted(vec![Ok(())]);
        let store = MemoryCredentialStore::with_credentials(sample_credentials());

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), store);
        settle(|| transport.has_live_link()).await;
        transport.push_event(LinkEvent::Opened { credentials: None });
        settle(|| manager.status().is_connected()).await;

        manager.send("12345@group", "deploy finished").await.unwrap();
        assert_eq!(
            transport.sent(),
            vec![("12345@group".to_string(), "deploy finished".to_string())]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn failed_send_is_reported_and_not_retried() {
        let transport =
            TestTransport::scripted(vec![Ok(())]).failing_sends();
        let store = MemoryCredentialStore::with_credentials(sample_credentials());

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), store);
        settle(|| transport.has_live_link()).await;
        transport.push_event(LinkEvent::Opened { credentials: None });
        settle(|| manager.status().is_connected()).await;

        let result = manager.send("12345@group", "hello").await;
        assert!(matches!(result, Err(ChannelError::DeliveryFailed(_))));
        // Exactly one delivery attempt.
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn targets_lists_joined_groups_while_connected() {
        let transport = TestTransport::scripted(vec![Ok(())]).with_targets(vec![
            TargetInfo {
                id: "12345@group".into(),
                name: "Deploys".into(),
            },
            TargetInfo {
                id: "67890@group".into(),
                name: "Alerts".into(),
            },
        ]);
        let store = MemoryCredentialStore::with_credentials(sample_credentials());

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), store);
        settle(|| transport.has_live_link()).await;
        transport.push_event(LinkEvent::Opened { credentials: None });
        settle(|| manager.status().is_connected()).await;

        let targets = manager.targets().await.unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].id, "12345@group");
        assert_eq!(targets[0].name, "Deploys");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn targets_while_not_connected_fails_fast() {
        let transport = TestTransport::scripted(vec![Err(ChannelError::Transport(
            "refused".into(),
        ))]);
        let store = MemoryCredentialStore::with_credentials(sample_credentials());

        let (manager, _handle) = ChannelManager::spawn(transport, store);

        let result = manager.targets().await;
        assert!(matches!(
            result,
            Err(ChannelError::NotReady(SessionStatus::Disconnected))
        ));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn connect_failure_backs_off_exponentially() {
        let transport = TestTransport::scripted(vec![
            Err(ChannelError::Transport("refused".into())),
            Err(ChannelError::Transport("refused".into())),
            Ok(()),
        ]);
        let store = MemoryCredentialStore::with_credentials(sample_credentials());

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), store);
        settle(|| transport.connect_calls() == 1).await;
        assert_eq!(manager.status(), SessionStatus::Disconnected);

        // Nothing fires before the first backoff elapses.
        time::advance(Duration::from_millis(900)).await;
        drain().await;
        assert_eq!(transport.connect_calls(), 1);

        time::advance(Duration::from_millis(100)).await;
        settle(|| transport.connect_calls() == 2).await;

        // Second attempt failed too; the next delay doubles.
        time::advance(Duration::from_secs(1)).await;
        drain().await;
        assert_eq!(transport.connect_calls(), 2);

        time::advance(Duration::from_secs(1)).await;
        settle(|| transport.connect_calls() == 3).await;

        transport.push_event(LinkEvent::Opened { credentials: None });
        settle(|| manager.status().is_connected()).await;
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn connection_loss_reconnects_with_stored_credentials() {
        let transport = TestTransport::scripted(vec![Ok(()), Ok(())]);
        let store = MemoryCredentialStore::with_credentials(sample_credentials());

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), store);
        settle(|| transport.has_live_link()).await;
        transport.push_event(LinkEvent::Opened { credentials: None });
        settle(|| manager.status().is_connected()).await;

        transport.push_event(LinkEvent::Closed(CloseReason::ConnectionLost(
            "stream reset".into(),
        )));
        settle(|| manager.status() == SessionStatus::Disconnected).await;

        time::advance(Duration::from_secs(1)).await;
        settle(|| transport.connect_calls() == 2).await;

        let credentials = transport.connect_credentials();
        assert!(credentials[0].is_some());
        assert!(credentials[1].is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn credential_rotation_is_persisted() {
        let transport = TestTransport::scripted(vec![Ok(())]);
        let store = Arc::new(MemoryCredentialStore::with_credentials(
            sample_credentials(),
        ));

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), Arc::clone(&store));
        settle(|| transport.has_live_link()).await;
        transport.push_event(LinkEvent::Opened { credentials: None });
        settle(|| manager.status().is_connected()).await;

        let mut rotated = sample_credentials();
        rotated.noise_key = "k1".into();
        transport.push_event(LinkEvent::CredentialUpdate(rotated.clone()));

        drain().await;
        let stored = store.load().await.unwrap().unwrap();
        assert_eq!(stored.noise_key, "k1");
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn logout_purges_credentials_and_restarts_pairing() {
        let transport = TestTransport::scripted(vec![Ok(()), Ok(())]);
        let store = Arc::new(MemoryCredentialStore::with_credentials(
            sample_credentials(),
        ));

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), Arc::clone(&store));
        let mut events = manager.subscribe();
        settle(|| transport.has_live_link()).await;
        transport.push_event(LinkEvent::Opened { credentials: None });
        assert_eq!(
            recv_event(&mut events).await,
            StatusEvent::Status(SessionStatus::Connected)
        );

        manager.logout().await.unwrap();

        assert_eq!(transport.logout_calls(), 1);
        assert_eq!(store.load().await.unwrap(), None);
        assert_eq!(
            recv_event(&mut events).await,
            StatusEvent::Status(SessionStatus::LoggedOut)
        );
        assert_eq!(
            recv_event(&mut events).await,
            StatusEvent::Status(SessionStatus::Pairing)
        );

        // The fresh session starts a pairing cycle, not a resume.
        let credentials = transport.connect_credentials();
        assert_eq!(credentials.len(), 2);
        assert!(credentials[1].is_none());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn logout_during_backoff_cancels_pending_reconnect() {
        let transport = TestTransport::scripted(vec![
            Err(ChannelError::Transport("refused".into())),
            Ok(()),
        ]);
        let store = Arc::new(MemoryCredentialStore::with_credentials(
            sample_credentials(),
        ));

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), Arc::clone(&store));
        settle(|| transport.connect_calls() == 1).await;
        assert_eq!(manager.status(), SessionStatus::Disconnected);

        // Log out while the reconnect timer is armed. The stale timer must
        // not fire later and resume a session with purged credentials.
        manager.logout().await.unwrap();

        assert_eq!(store.load().await.unwrap(), None);
        let credentials = transport.connect_credentials();
        assert_eq!(credentials.len(), 2);
        assert!(credentials[1].is_none(), "fresh cycle must pair, not resume");

        time::advance(Duration::from_secs(120)).await;
        drain().await;
        assert_eq!(transport.connect_calls(), 2);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn authoritative_network_logout_stops_reconnecting() {
        let transport = TestTransport::scripted(vec![Ok(())]);
        let store = Arc::new(MemoryCredentialStore::with_credentials(
            sample_credentials(),
        ));

        let (manager, _handle) = ChannelManager::spawn(transport.clone(), Arc::clone(&store));
        settle(|| transport.has_live_link()).await;
        transport.push_event(LinkEvent::Opened { credentials: None });
        settle(|| manager.status().is_connected()).await;

        transport.push_event(LinkEvent::Closed(CloseReason::LoggedOut));
        settle(|| manager.status() == SessionStatus::LoggedOut).await;
        assert_eq!(store.load().await.unwrap(), None);

        // No automatic re-pair: the stale session must not resurrect itself.
        time::advance(Duration::from_secs(300)).await;
        drain().await;
        assert_eq!(transport.connect_calls(), 1);
    }

    struct FailingStore;

    #[async_trait]
    impl CredentialStore for FailingStore {
        async fn load(&self) -> Result<Option<Credentials>, StoreError> {
            Ok(Some(Credentials {
                version: CREDENTIALS_VERSION,
                device_id: "device-1".into(),
                noise_key: "k0".into(),
                paired_at: Utc::now(),
            }))
        }

        async fn save(&self, _credentials: &Credentials) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only fs",
            )))
        }

        async fn clear(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn credential_persistence_failure_is_fatal() {
        let transport = TestTransport::scripted(vec![Ok(())]);

        let (_manager, handle) = ChannelManager::spawn(transport.clone(), FailingStore);
        settle(|| transport.has_live_link()).await;
        transport.push_event(LinkEvent::CredentialUpdate(sample_credentials()));

        let result = time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("session task should have stopped")
            .expect("session task panicked");
        assert!(matches!(
            result,
            Err(ChannelError::CredentialPersistence(_))
        ));
    }
}
