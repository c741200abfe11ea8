//! WebSocket gateway transport.
//!
//! Speaks the gateway's JSON frame protocol over a single WebSocket: a
//! `hello`/`pair` opener, then server-pushed `challenge`/`open`/`creds`/
//! `close` frames interleaved with `ack`s for outbound `send` frames.

use crate::credentials::Credentials;
use crate::error::ChannelError;
use crate::transport::{
    ClientFrame, CloseReason, GatewayLink, GatewayTransport, LinkEvent, ServerFrame, TargetInfo,
};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials the gateway over WebSocket.
pub struct WsGatewayTransport {
    url: Url,
    io_timeout: Duration,
}

impl WsGatewayTransport {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_io_timeout(url: Url, io_timeout: Duration) -> Self {
        Self { url, io_timeout }
    }
}

impl GatewayTransport for WsGatewayTransport {
    type Link = WsGatewayLink;

    async fn connect(
        &self,
        credentials: Option<Credentials>,
    ) -> Result<Self::Link, ChannelError> {
        let (socket, _response) = timeout(self.io_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| ChannelError::Transport("gateway connect timed out".to_string()))?
            .map_err(map_ws_error)?;

        let mut link = WsGatewayLink {
            socket,
            pending: VecDeque::new(),
            io_timeout: self.io_timeout,
        };

        let opener = match credentials {
            Some(credentials) => ClientFrame::Hello { credentials },
            None => ClientFrame::Pair,
        };
        link.write_frame(&opener).await?;

        Ok(link)
    }
}

/// A live WebSocket link to the gateway.
pub struct WsGatewayLink {
    socket: WsStream,
    /// Events that arrived while a send was waiting for its ack.
    pending: VecDeque<LinkEvent>,
    io_timeout: Duration,
}

impl WsGatewayLink {
    async fn write_frame(&mut self, frame: &ClientFrame) -> Result<(), ChannelError> {
        let json = serde_json::to_string(frame)
            .map_err(|error| ChannelError::Transport(error.to_string()))?;
        timeout(self.io_timeout, self.socket.send(Message::Text(json.into())))
            .await
            .map_err(|_| ChannelError::Transport("gateway write timed out".to_string()))?
            .map_err(map_ws_error)
    }

    /// Read the next inbound frame, mapping socket-level failures to a
    /// `Closed` event.
    async fn read_event(&mut self) -> ReadOutcome {
        loop {
            match self.socket.next().await {
                None => {
                    return ReadOutcome::Event(LinkEvent::Closed(CloseReason::ConnectionLost(
                        "gateway closed the socket".to_string(),
                    )))
                }
                Some(Err(error)) => {
                    return ReadOutcome::Event(LinkEvent::Closed(CloseReason::ConnectionLost(
                        error.to_string(),
                    )))
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => match classify_frame(frame) {
                            Inbound::Event(event) => return ReadOutcome::Event(event),
                            Inbound::Ack { id, ok, error } => {
                                return ReadOutcome::Ack { id, ok, error }
                            }
                            Inbound::Targets { id, targets } => {
                                return ReadOutcome::Targets { id, targets }
                            }
                        },
                        Err(error) => {
                            warn!(error = %error, "discarding unparseable gateway frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    return ReadOutcome::Event(LinkEvent::Closed(CloseReason::ConnectionLost(
                        "gateway sent close frame".to_string(),
                    )))
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(other)) => {
                    debug!(?other, "ignoring non-text gateway frame");
                }
            }
        }
    }
}

enum ReadOutcome {
    Event(LinkEvent),
    Ack {
        id: String,
        ok: bool,
        error: Option<String>,
    },
    Targets {
        id: String,
        targets: Vec<TargetInfo>,
    },
}

enum Inbound {
    Event(LinkEvent),
    Ack {
        id: String,
        ok: bool,
        error: Option<String>,
    },
    Targets {
        id: String,
        targets: Vec<TargetInfo>,
    },
}

fn classify_frame(frame: ServerFrame) -> Inbound {
    match frame {
        ServerFrame::Challenge { code } => Inbound::Event(LinkEvent::PairingChallenge(code)),
        ServerFrame::Open { credentials } => Inbound::Event(LinkEvent::Opened { credentials }),
        ServerFrame::Creds { credentials } => {
            Inbound::Event(LinkEvent::CredentialUpdate(credentials))
        }
        ServerFrame::Close { reason } => {
            Inbound::Event(LinkEvent::Closed(ServerFrame::close_reason(&reason)))
        }
        ServerFrame::Ack { id, ok, error } => Inbound::Ack { id, ok, error },
        ServerFrame::Targets { id, targets } => Inbound::Targets { id, targets },
    }
}

fn map_ws_error(error: tokio_tungstenite::tungstenite::Error) -> ChannelError {
    ChannelError::Transport(error.to_string())
}

impl GatewayLink for WsGatewayLink {
    async fn event(&mut self) -> LinkEvent {
        if let Some(event) = self.pending.pop_front() {
            return event;
        }
        loop {
            match self.read_event().await {
                ReadOutcome::Event(event) => return event,
                ReadOutcome::Ack { id, .. } => {
                    // An ack with no waiting send: the sender already gave up.
                    debug!(id = %id, "dropping unclaimed send ack");
                }
                ReadOutcome::Targets { id, .. } => {
                    debug!(id = %id, "dropping unclaimed targets reply");
                }
            }
        }
    }

    async fn send(&mut self, target: &str, text: &str) -> Result<(), ChannelError> {
        let id = Uuid::new_v4().to_string();
        let frame = ClientFrame::Send {
            id: id.clone(),
            target: target.to_string(),
            text: text.to_string(),
        };
        self.write_frame(&frame)
            .await
            .map_err(|error| ChannelError::DeliveryFailed(error.to_string()))?;

        // Wait for the matching ack, buffering unrelated events for the next
        // event() call.
        let deadline = tokio::time::Instant::now() + self.io_timeout;
        loop {
            let outcome = timeout(
                deadline.saturating_duration_since(tokio::time::Instant::now()),
                self.read_event(),
            )
            .await
            .map_err(|_| {
                ChannelError::DeliveryFailed("timed out waiting for send ack".to_string())
            })?;

            match outcome {
                ReadOutcome::Ack { id: ack_id, ok, error } if ack_id == id => {
                    if ok {
                        return Ok(());
                    }
                    return Err(ChannelError::DeliveryFailed(
                        error.unwrap_or_else(|| "gateway rejected the send".to_string()),
                    ));
                }
                ReadOutcome::Ack { id, .. } => {
                    debug!(id = %id, "dropping stale send ack");
                }
                ReadOutcome::Targets { id, .. } => {
                    debug!(id = %id, "dropping stale targets reply");
                }
                ReadOutcome::Event(event) => {
                    let closed = matches!(event, LinkEvent::Closed(_));
                    self.pending.push_back(event);
                    if closed {
                        return Err(ChannelError::DeliveryFailed(
                            "gateway closed before acking the send".to_string(),
                        ));
                    }
                }
            }
        }
    }

    async fn targets(&mut self) -> Result<Vec<TargetInfo>, ChannelError> {
        let id = Uuid::new_v4().to_string();
        self.write_frame(&ClientFrame::Targets { id: id.clone() })
            .await?;

        let deadline = tokio::time::Instant::now() + self.io_timeout;
        loop {
            let outcome = timeout(
                deadline.saturating_duration_since(tokio::time::Instant::now()),
                self.read_event(),
            )
            .await
            .map_err(|_| {
                ChannelError::Transport("timed out waiting for targets reply".to_string())
            })?;

            match outcome {
                ReadOutcome::Targets { id: reply_id, targets } if reply_id == id => {
                    return Ok(targets);
                }
                ReadOutcome::Targets { id, .. } => {
                    debug!(id = %id, "dropping stale targets reply");
                }
                ReadOutcome::Ack { id, .. } => {
                    debug!(id = %id, "dropping unclaimed send ack");
                }
                ReadOutcome::Event(event) => {
                    let closed = matches!(event, LinkEvent::Closed(_));
                    self.pending.push_back(event);
                    if closed {
                        return Err(ChannelError::Transport(
                            "gateway closed before replying with targets".to_string(),
                        ));
                    }
                }
            }
        }
    }

    async fn logout(&mut self) -> Result<(), ChannelError> {
        self.write_frame(&ClientFrame::Logout).await
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}
