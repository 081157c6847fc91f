//! Canonical event envelope and the raw records it is built from.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{MeshError, Result};

/// Longest entity name accepted from the outside.
const MAX_ENTITY_LEN: usize = 256;

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Heartbeat,
    Traffic,
    Log,
}

impl EventCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Traffic => "traffic",
            Self::Log => "log",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable canonical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub source_entity: String,
    pub category: EventCategory,
    pub attributes: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Build an event directly; used by tests and internal producers.
    #[must_use]
    pub fn new(
        source_entity: impl Into<String>,
        category: EventCategory,
        attributes: Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_entity: source_entity.into(),
            category,
            attributes,
            timestamp,
        }
    }

    /// Normalize a raw record. `now` stamps records that carry no timestamp.
    pub fn from_record(record: RawRecord, now: DateTime<Utc>) -> Result<Self> {
        match record {
            RawRecord::Heartbeat { entity, timestamp } => {
                let entity = validate_entity(&entity)?;
                Ok(Self::new(
                    entity,
                    EventCategory::Heartbeat,
                    Map::new(),
                    timestamp.unwrap_or(now),
                ))
            }
            RawRecord::Traffic {
                entity,
                direction,
                channel,
                body,
                timestamp,
                metrics,
            } => {
                let entity = validate_entity(entity.as_deref().unwrap_or(&channel))?;
                let mut attributes = Map::new();
                attributes.insert("direction".into(), Value::from(direction.as_str()));
                attributes.insert("channel".into(), Value::from(channel));
                attributes.insert("message".into(), Value::from(body.clone()));
                attributes.insert("body".into(), Value::from(body));
                insert_metrics(&mut attributes, metrics)?;
                Ok(Self::new(
                    entity,
                    EventCategory::Traffic,
                    attributes,
                    timestamp.unwrap_or(now),
                ))
            }
            RawRecord::Log {
                entity,
                line,
                level,
                timestamp,
                metrics,
            } => {
                let entity = validate_entity(&entity)?;
                let mut attributes = Map::new();
                attributes.insert("message".into(), Value::from(line));
                if let Some(level) = level {
                    attributes.insert("level".into(), Value::from(level.to_ascii_lowercase()));
                }
                insert_metrics(&mut attributes, metrics)?;
                Ok(Self::new(
                    entity,
                    EventCategory::Log,
                    attributes,
                    timestamp.unwrap_or(now),
                ))
            }
        }
    }

    /// Attribute rendered as text; numbers and booleans are stringified.
    #[must_use]
    pub fn attribute_text(&self, name: &str) -> Option<Cow<'_, str>> {
        match self.attributes.get(name)? {
            Value::String(s) => Some(Cow::Borrowed(s.as_str())),
            Value::Number(n) => Some(Cow::Owned(n.to_string())),
            Value::Bool(b) => Some(Cow::Owned(b.to_string())),
            _ => None,
        }
    }

    /// Numeric attribute, if present and finite.
    #[must_use]
    pub fn metric(&self, name: &str) -> Option<f64> {
        let value = match self.attributes.get(name)? {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        value.is_finite().then_some(value)
    }
}

pub(crate) fn validate_entity(raw: &str) -> Result<String> {
    let entity = raw.trim();
    if entity.is_empty() {
        return Err(MeshError::Malformed("empty entity".to_string()));
    }
    if entity.len() > MAX_ENTITY_LEN {
        return Err(MeshError::Malformed(format!(
            "entity longer than {MAX_ENTITY_LEN} bytes"
        )));
    }
    if entity.chars().any(char::is_control) {
        return Err(MeshError::Malformed(
            "entity contains control characters".to_string(),
        ));
    }
    Ok(entity.to_string())
}

fn insert_metrics(attributes: &mut Map<String, Value>, metrics: HashMap<String, f64>) -> Result<()> {
    for (name, value) in metrics {
        let number = serde_json::Number::from_f64(value)
            .ok_or_else(|| MeshError::Malformed(format!("metric {name} is not finite")))?;
        attributes.insert(name, Value::Number(number));
    }
    Ok(())
}

/// Traffic direction relative to the observed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(alias = "in", alias = "request")]
    Inbound,
    #[serde(alias = "out", alias = "response")]
    Outbound,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Heterogeneous input record, tagged by `source`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RawRecord {
    /// Periodic liveness pulse
    #[serde(alias = "pulse")]
    Heartbeat {
        entity: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Mirrored request/response traffic
    Traffic {
        /// Defaults to the channel name
        #[serde(default)]
        entity: Option<String>,
        direction: Direction,
        channel: String,
        #[serde(default)]
        body: String,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        /// Numeric measurements such as `latency_ms`
        #[serde(default)]
        metrics: HashMap<String, f64>,
    },

    /// One application log line
    Log {
        entity: String,
        line: String,
        #[serde(default)]
        level: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default)]
        metrics: HashMap<String, f64>,
    },
}

impl RawRecord {
    /// Parse a JSON value into a record.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| MeshError::Malformed(e.to_string()))
    }

    /// Parse one JSON line.
    pub fn from_json_line(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).map_err(|e| MeshError::Malformed(e.to_string()))
    }

    /// Entity the record claims to come from, before validation.
    #[must_use]
    pub fn entity(&self) -> &str {
        match self {
            Self::Heartbeat { entity, .. } | Self::Log { entity, .. } => entity,
            Self::Traffic {
                entity, channel, ..
            } => entity.as_deref().unwrap_or(channel),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_traffic_record_normalizes() {
        let record = RawRecord::from_value(json!({
            "source": "traffic",
            "direction": "inbound",
            "channel": "chat",
            "body": "hello",
            "metrics": { "latency_ms": 12.5 }
        }))
        .unwrap();
        let now = Utc::now();
        let event = Event::from_record(record, now).unwrap();

        assert_eq!(event.source_entity, "chat");
        assert_eq!(event.category, EventCategory::Traffic);
        assert_eq!(event.timestamp, now);
        assert_eq!(event.attribute_text("message").as_deref(), Some("hello"));
        assert_eq!(event.attribute_text("direction").as_deref(), Some("inbound"));
        assert_eq!(event.metric("latency_ms"), Some(12.5));
        assert_eq!(event.metric("message"), None);
    }

    #[test]
    fn test_heartbeat_keeps_timestamp() {
        let at: DateTime<Utc> = "2026-01-01T00:00:00Z".parse().unwrap();
        let record = RawRecord::from_json_line(
            r#"{"source":"heartbeat","entity":"api","timestamp":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let event = Event::from_record(record, Utc::now()).unwrap();
        assert_eq!(event.source_entity, "api");
        assert_eq!(event.timestamp, at);
    }

    #[test]
    fn test_malformed_records_rejected() {
        assert!(matches!(
            RawRecord::from_value(json!({"source": "telepathy"})),
            Err(MeshError::Malformed(_))
        ));
        assert!(matches!(
            RawRecord::from_json_line("{not json"),
            Err(MeshError::Malformed(_))
        ));

        let blank = RawRecord::Heartbeat {
            entity: "   ".to_string(),
            timestamp: None,
        };
        assert!(matches!(
            Event::from_record(blank, Utc::now()),
            Err(MeshError::Malformed(_))
        ));
    }

    #[test]
    fn test_log_level_lowercased() {
        let record = RawRecord::Log {
            entity: "worker".to_string(),
            line: "disk full".to_string(),
            level: Some("ERROR".to_string()),
            timestamp: None,
            metrics: HashMap::new(),
        };
        let event = Event::from_record(record, Utc::now()).unwrap();
        assert_eq!(event.attribute_text("level").as_deref(), Some("error"));
    }
}
