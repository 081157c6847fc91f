//! Outbound notifications for the resilience mesh.
//!
//! The mesh hands alerts, escalations and operator messages to a [`Notifier`],
//! which fans them out to every configured [`NotifyChannel`]. Alert forwarding
//! is fire-and-forget ([`Notifier::notify`]); the `notify` remediation action
//! waits for delivery ([`Notifier::deliver`]) so a failed webhook fails the
//! action and gets retried.
//!
//! ```no_run
//! use notify::{Notifier, NotifyEvent};
//!
//! # async fn demo() {
//! let notifier = Notifier::from_env();
//! let report = notifier
//!     .deliver(NotifyEvent::Operator {
//!         entity: "api".to_string(),
//!         alert_id: None,
//!         message: "api restarted by the mesh".to_string(),
//!         timestamp: chrono::Utc::now(),
//!     })
//!     .await;
//! assert!(report.iter().all(|d| d.result.is_ok()));
//! # }
//! ```
//!
//! Environment:
//!
//! - `SLACK_WEBHOOK_URL`: enables the Slack channel
//! - `NOTIFY_MIN_SEVERITY`: drop events below `info|warning|high|critical`
//! - `NOTIFY_DISABLED`: `true` or `1` turns every channel off

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channels;
pub mod error;
pub mod events;

pub use channels::slack::SlackChannel;
pub use channels::NotifyChannel;
pub use error::ChannelError;
pub use events::{NotifyEvent, Severity};

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

const ENV_NOTIFY_DISABLED: &str = "NOTIFY_DISABLED";
const ENV_NOTIFY_MIN_SEVERITY: &str = "NOTIFY_MIN_SEVERITY";

/// Result of sending one event through one channel.
#[derive(Debug)]
pub struct Delivery {
    pub channel: &'static str,
    pub result: Result<(), ChannelError>,
}

/// Fans events out to the enabled channels.
pub struct Notifier {
    channels: Vec<Arc<dyn NotifyChannel>>,
    min_severity: Severity,
}

impl Notifier {
    /// Build from the environment. Channels that are not configured are left
    /// out, so a bare environment yields a notifier with no channels.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .is_ok_and(|v| v.eq_ignore_ascii_case("true") || v == "1");
        if disabled {
            info!("Notifications disabled via {ENV_NOTIFY_DISABLED}");
            return Self::disabled();
        }

        let slack = SlackChannel::from_env();
        let channels: Vec<Arc<dyn NotifyChannel>> = if slack.enabled() {
            vec![Arc::new(slack)]
        } else {
            Vec::new()
        };

        let min_severity = match std::env::var(ENV_NOTIFY_MIN_SEVERITY) {
            Ok(raw) => Severity::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "Ignoring unknown {ENV_NOTIFY_MIN_SEVERITY}");
                Severity::Info
            }),
            Err(_) => Severity::Info,
        };

        if channels.is_empty() {
            warn!("No notification channels configured");
        } else {
            info!(
                channels = ?channels.iter().map(|c| c.name()).collect::<Vec<_>>(),
                min_severity = min_severity.as_str(),
                "Notifications enabled"
            );
        }
        Self::with_channels(channels).with_min_severity(min_severity)
    }

    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn NotifyChannel>>) -> Self {
        Self {
            channels,
            min_severity: Severity::Info,
        }
    }

    /// Only events at or above `severity` are sent.
    #[must_use]
    pub fn with_min_severity(mut self, severity: Severity) -> Self {
        self.min_severity = severity;
        self
    }

    /// A notifier that sends nothing.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: Vec::new(),
            min_severity: Severity::Info,
        }
    }

    #[must_use]
    pub fn has_channels(&self) -> bool {
        self.channels.iter().any(|c| c.enabled())
    }

    fn targets(&self, event: &NotifyEvent) -> Vec<Arc<dyn NotifyChannel>> {
        if event.severity() < self.min_severity {
            debug!(
                entity = event.entity(),
                severity = event.severity().as_str(),
                "Below notification floor"
            );
            return Vec::new();
        }
        self.channels
            .iter()
            .filter(|c| c.enabled())
            .map(Arc::clone)
            .collect()
    }

    /// Send in the background. Must be called inside a Tokio runtime;
    /// failures are logged.
    pub fn notify(&self, event: NotifyEvent) {
        let targets = self.targets(&event);
        if targets.is_empty() {
            return;
        }
        let event = Arc::new(event);
        for channel in targets {
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                match channel.send(&event).await {
                    Ok(()) => debug!(channel = channel.name(), entity = event.entity(), "Notification sent"),
                    Err(e) => warn!(
                        channel = channel.name(),
                        entity = event.entity(),
                        error = %e,
                        "Notification failed"
                    ),
                }
            });
        }
    }

    /// Send to every channel concurrently and report each outcome. Empty
    /// when no channel took the event.
    pub async fn deliver(&self, event: NotifyEvent) -> Vec<Delivery> {
        let targets = self.targets(&event);
        join_all(targets.iter().map(|channel| {
            let event = &event;
            async move {
                Delivery {
                    channel: channel.name(),
                    result: channel.send(event).await,
                }
            }
        }))
        .await
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingChannel {
        name: &'static str,
        sent: AtomicUsize,
        fail: bool,
    }

    impl CountingChannel {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                sent: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl NotifyChannel for CountingChannel {
        fn name(&self) -> &'static str {
            self.name
        }

        fn enabled(&self) -> bool {
            true
        }

        async fn send(&self, _event: &NotifyEvent) -> Result<(), ChannelError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ChannelError::MissingConfig("TEST_WEBHOOK"))
            } else {
                Ok(())
            }
        }
    }

    fn operator_event() -> NotifyEvent {
        NotifyEvent::Operator {
            entity: "api".to_string(),
            alert_id: Some("a-1".to_string()),
            message: "restarted".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_disabled_notifier_has_no_channels() {
        assert!(!Notifier::disabled().has_channels());
    }

    #[test]
    fn test_severity_floor_parsing() {
        assert_eq!(Severity::parse("HIGH"), Some(Severity::High));
        assert_eq!(Severity::parse(" warn "), Some(Severity::Warning));
        assert_eq!(Severity::parse("loud"), None);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_event_titles_and_severity() {
        let event = NotifyEvent::AlertRaised {
            alert_id: "a-1".to_string(),
            entity: "api".to_string(),
            category: "rate_limit".to_string(),
            severity: Severity::High,
            message: "flood".to_string(),
            context: std::collections::HashMap::new(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(event.title(), "Alert: rate_limit on api");
        assert_eq!(event.severity(), Severity::High);

        let event = NotifyEvent::Escalation {
            alert_id: "a-2".to_string(),
            original_alert_id: "a-1".to_string(),
            entity: "api".to_string(),
            reason: "restart failed".to_string(),
            timestamp: chrono::Utc::now(),
        };
        assert_eq!(event.title(), "Escalation: api");
        assert_eq!(event.severity(), Severity::Critical);
    }

    #[tokio::test]
    async fn test_deliver_reports_each_channel() {
        let ok = CountingChannel::new("ok", false);
        let bad = CountingChannel::new("bad", true);
        let channels: Vec<Arc<dyn NotifyChannel>> = vec![ok.clone(), bad.clone()];
        let notifier = Notifier::with_channels(channels);

        let report = notifier.deliver(operator_event()).await;
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].channel, "ok");
        assert!(report[0].result.is_ok());
        assert_eq!(report[1].channel, "bad");
        assert!(report[1].result.is_err());
        assert_eq!(ok.sent.load(Ordering::SeqCst), 1);
        assert_eq!(bad.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_events_below_floor_are_dropped() {
        let channel = CountingChannel::new("ok", false);
        let channels: Vec<Arc<dyn NotifyChannel>> = vec![channel.clone()];
        let notifier = Notifier::with_channels(channels).with_min_severity(Severity::High);

        // Operator messages are warnings.
        assert!(notifier.deliver(operator_event()).await.is_empty());
        assert_eq!(channel.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_deliver_is_empty() {
        assert!(Notifier::disabled().deliver(operator_event()).await.is_empty());
    }
}
