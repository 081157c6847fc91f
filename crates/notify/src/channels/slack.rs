//! Slack webhook notification channel.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::events::{NotifyEvent, Severity};
use crate::NotifyChannel;

/// Environment variable for Slack webhook URL.
const ENV_SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";

/// Slack webhook notification channel.
pub struct SlackChannel {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackChannel {
    /// Create a new Slack channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let webhook_url = std::env::var(ENV_SLACK_WEBHOOK_URL)
            .ok()
            .filter(|url| !url.is_empty());

        if webhook_url.is_none() {
            debug!("Slack notifications disabled (SLACK_WEBHOOK_URL not set)");
        }

        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    /// Create a Slack channel with a specific webhook URL.
    #[must_use]
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url: Some(webhook_url),
            client: reqwest::Client::new(),
        }
    }

    fn format_payload(event: &NotifyEvent) -> SlackPayload {
        let color = match event.severity() {
            Severity::Info => "#3498db",
            Severity::Warning => "#f39c12",
            Severity::High => "#e67e22",
            Severity::Critical => "#e74c3c",
        };

        let fields = Self::format_fields(event)
            .into_iter()
            .map(|(title, value)| SlackField {
                title,
                value,
                short: true,
            })
            .collect();

        let attachment = SlackAttachment {
            fallback: event.title(),
            color: color.to_string(),
            author_name: Some("Resilience Mesh".to_string()),
            title: event.title(),
            text: Self::format_description(event),
            fields,
            footer: Some(format!(
                "{} | {}",
                event.severity().as_str(),
                event.timestamp().format("%Y-%m-%d %H:%M:%S UTC")
            )),
            ts: Some(event.timestamp().timestamp()),
        };

        SlackPayload {
            attachments: vec![attachment],
        }
    }

    fn format_description(event: &NotifyEvent) -> String {
        match event {
            NotifyEvent::AlertRaised { message, .. } | NotifyEvent::Operator { message, .. } => {
                message.clone()
            }

            NotifyEvent::Escalation { entity, reason, .. } => {
                format!("Automated remediation of `{entity}` gave up\n*Reason:* {reason}")
            }
        }
    }

    fn format_fields(event: &NotifyEvent) -> Vec<(String, String)> {
        match event {
            NotifyEvent::AlertRaised {
                alert_id,
                severity,
                context,
                ..
            } => {
                let mut fields = vec![
                    ("Alert ID".to_string(), alert_id.clone()),
                    ("Severity".to_string(), severity.as_str().to_string()),
                ];
                let mut extra: Vec<_> = context.iter().collect();
                extra.sort();
                for (key, value) in extra {
                    fields.push((key.clone(), value.clone()));
                }
                fields
            }

            NotifyEvent::Escalation {
                alert_id,
                original_alert_id,
                ..
            } => vec![
                ("Alert ID".to_string(), alert_id.clone()),
                ("Original Alert".to_string(), original_alert_id.clone()),
            ],

            NotifyEvent::Operator {
                entity, alert_id, ..
            } => {
                let mut fields = vec![("Entity".to_string(), entity.clone())];
                if let Some(alert_id) = alert_id {
                    fields.push(("Alert ID".to_string(), alert_id.clone()));
                }
                fields
            }
        }
    }
}

#[async_trait]
impl NotifyChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let webhook_url = self
            .webhook_url
            .as_ref()
            .ok_or(ChannelError::MissingConfig(ENV_SLACK_WEBHOOK_URL))?;

        let payload = Self::format_payload(event);

        debug!(channel = "slack", title = %event.title(), "Sending notification");

        let response = self.client.post(webhook_url).json(&payload).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(1);
            return Err(ChannelError::Throttled { retry_after_secs });
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            channel = "slack",
            status = %status,
            body = %body,
            "Slack webhook request failed"
        );

        Err(ChannelError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Debug, Serialize)]
struct SlackPayload {
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    fallback: String,
    color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_name: Option<String>,
    title: String,
    text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fields: Vec<SlackField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ts: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}
