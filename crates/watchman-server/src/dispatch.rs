//! Webhook-to-channel dispatch.
//!
//! Resolves an inbound push delivery to a rule by webhook token, composes a
//! notification, and hands it to the channel. Every failure short of a server
//! bug is absorbed here: the webhook endpoint acknowledges deliveries
//! unconditionally, so a misconfigured rule or an offline channel must never
//! bounce the HTTP request.

use crate::db::RuleStore;
use crate::telemetry::metrics;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use watchman_channel::ChannelManager;

/// The subset of a push delivery payload the notification uses. Fields are
/// optional at the serde level; a payload without both a repository and a
/// pusher is not a push event and is discarded.
#[derive(Debug, Deserialize, Default)]
pub struct PushPayload {
    pub repository: Option<Repository>,
    pub pusher: Option<Pusher>,
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Pusher {
    pub name: Option<String>,
}

impl PushPayload {
    /// Repository and pusher names, when this is a push event.
    fn push_details(&self) -> Option<(&str, &str)> {
        let repository = self.repository.as_ref()?.full_name.as_deref()?;
        let pusher = self.pusher.as_ref()?.name.as_deref()?;
        Some((repository, pusher))
    }
}

/// Compose the notification text for a push.
pub fn compose_notification(rule_name: &str, repository: &str, pusher: &str) -> String {
    format!("🔔 {rule_name}: new push to {repository} by {pusher}")
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    rules: RuleStore,
    channel: ChannelManager,
}

impl NotificationDispatcher {
    pub fn new(rules: RuleStore, channel: ChannelManager) -> Self {
        Self { rules, channel }
    }

    /// Process one webhook delivery. Infallible by contract: outcomes are
    /// logged and counted, never surfaced to the webhook sender.
    #[instrument(skip_all, fields(token = %token))]
    pub async fn dispatch(&self, token: &str, body: &[u8]) {
        metrics::webhooks_received().add(1, &[]);

        let rule = match self.rules.find_by_token(token).await {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                // Unknown tokens are indistinguishable from valid ones to the
                // sender; just drop the delivery.
                debug!("no rule for webhook token, discarding delivery");
                metrics::notifications_dropped().add(1, &[]);
                return;
            }
            Err(error) => {
                warn!(error = %error, "rule lookup failed, discarding delivery");
                metrics::notifications_dropped().add(1, &[]);
                return;
            }
        };

        if !rule.is_active {
            debug!(rule_name = %rule.rule_name, "rule is inactive, discarding delivery");
            metrics::notifications_dropped().add(1, &[]);
            return;
        }

        let payload: PushPayload = serde_json::from_slice(body).unwrap_or_else(|error| {
            debug!(error = %error, "unparseable push payload");
            PushPayload::default()
        });
        let Some((repository, pusher)) = payload.push_details() else {
            // Deliveries without repository/pusher details are not push
            // events; acknowledge and move on.
            debug!(rule_name = %rule.rule_name, "payload is not a push event, discarding delivery");
            metrics::notifications_dropped().add(1, &[]);
            return;
        };
        let text = compose_notification(&rule.rule_name, repository, pusher);

        match self.channel.send(&rule.target_id, &text).await {
            Ok(()) => {
                info!(
                    rule_name = %rule.rule_name,
                    target_id = %rule.target_id,
                    "notification delivered"
                );
                metrics::notifications_delivered().add(1, &[]);
            }
            Err(error) => {
                // At-most-once: the push is gone. The sender will not retry
                // and neither do we.
                warn!(
                    rule_name = %rule.rule_name,
                    error = %error,
                    "notification dropped"
                );
                metrics::notifications_dropped().add(1, &[]);
            }
        }
    }
}
