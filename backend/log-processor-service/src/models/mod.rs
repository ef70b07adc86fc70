//! Records flowing through the pipeline: stream entry → verdict → stored row

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const UNKNOWN_SERVICE: &str = "unknown";
pub const UNKNOWN_LEVEL: &str = "unknown";

/// Stands in for bytes the store cannot hold (NUL) or that were not UTF-8.
pub const REPLACEMENT_CHAR: char = '\u{FFFD}';

/// Redis stream entry id (`<milliseconds>-<sequence>`), ordered as the stream orders it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub ms: u64,
    pub seq: u64,
}

impl EventId {
    pub const fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream entry id {0:?}")]
pub struct InvalidEventId(pub String);

impl FromStr for EventId {
    type Err = InvalidEventId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s.split_once('-').unwrap_or((s, "0"));
        match (ms.parse(), seq.parse()) {
            (Ok(ms), Ok(seq)) => Ok(Self { ms, seq }),
            _ => Err(InvalidEventId(s.to_string())),
        }
    }
}

/// One entry read from the log stream.
///
/// Every field is optional; producers are not validated at this layer. Use the
/// accessors to get the documented defaults for absent values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEvent {
    pub id: EventId,
    pub service: Option<String>,
    pub level: Option<String>,
    pub message: Option<String>,
    /// Unix seconds stamped by the ingestion side, when present
    pub timestamp: Option<i64>,
}

impl LogEvent {
    pub fn service(&self) -> &str {
        self.service.as_deref().unwrap_or(UNKNOWN_SERVICE)
    }

    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or(UNKNOWN_LEVEL)
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

/// Ingress schema of a log line, as appended by producers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLogEvent {
    pub service: String,
    pub level: String,
    pub message: String,
}

/// Classifier output for one message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyVerdict {
    pub anomalous: bool,
    pub score: f64,
}

impl AnomalyVerdict {
    pub fn normal(score: f64) -> Self {
        Self {
            anomalous: false,
            score,
        }
    }

    pub fn anomalous(score: f64) -> Self {
        Self {
            anomalous: true,
            score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Delivered to this consumer, still in the group's pending-entry list
    Pending,
    Acknowledged,
}

/// Tracks one delivered entry for the length of a single processing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub event_id: EventId,
    pub state: DeliveryState,
}

impl DeliveryHandle {
    pub fn pending(event_id: EventId) -> Self {
        Self {
            event_id,
            state: DeliveryState::Pending,
        }
    }

    pub fn mark_acknowledged(&mut self) {
        self.state = DeliveryState::Acknowledged;
    }

    pub fn is_acknowledged(&self) -> bool {
        self.state == DeliveryState::Acknowledged
    }
}

/// Row written to the `logs` table. `log_id` is the natural key.
///
/// PostgreSQL text columns reject NUL; it is replaced in every text field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedRecord {
    pub log_id: String,
    pub service: String,
    pub level: String,
    pub message: String,
    pub is_anomaly: bool,
}

impl PersistedRecord {
    pub fn from_scored(event: &LogEvent, verdict: &AnomalyVerdict) -> Self {
        Self {
            log_id: event.id.to_string(),
            service: storable_text(event.service()),
            level: storable_text(event.level()),
            message: storable_text(event.message()),
            is_anomaly: verdict.anomalous,
        }
    }
}

fn storable_text(raw: &str) -> String {
    if raw.contains('\0') {
        raw.replace('\0', &REPLACEMENT_CHAR.to_string())
    } else {
        raw.to_string()
    }
}

/// A `logs` row read back, newest-first listings use `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StoredLog {
    pub id: i64,
    pub log_id: String,
    pub service: String,
    pub level: String,
    pub message: String,
    pub is_anomaly: bool,
    pub created_at: DateTime<Utc>,
}
