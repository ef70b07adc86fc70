//! Redis Streams consumer-group access for the log stream
//!
//! Delivery state lives in Redis: `XREADGROUP` moves the group cursor and puts
//! each delivered entry on the pending-entry list (PEL) of the reading
//! consumer; only `XACK` takes it off again. Anything left on the PEL by a
//! consumer that died is recovered with `XPENDING ... IDLE` + `XCLAIM`.

use crate::error::{is_busy_group, ProcessorError, Result};
use crate::models::{EventId, LogEvent, NewLogEvent};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of creating the consumer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Created,
    /// The group was already there; its cursor is left untouched
    AlreadyExists,
}

/// Consumer-group operations the processing loop relies on.
///
/// Implementations are bound to one stream, one group and one consumer name.
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Create the consumer group starting at `start_id` (`0` = stream origin).
    /// An existing group is a success.
    async fn ensure_group(&self, start_id: &str) -> Result<GroupStatus>;

    /// Read up to `max_count` entries never delivered to any consumer of the
    /// group, waiting up to `block` for the first one. Timeout yields an empty batch.
    async fn pull_batch(&self, max_count: usize, block: Duration) -> Result<Vec<LogEvent>>;

    /// Remove one entry from the pending-entry list. Returns `false` if it was
    /// not pending (already acknowledged), which is not an error.
    async fn acknowledge(&self, id: &EventId) -> Result<bool>;

    /// Claim up to `max_count` pending entries idle for at least `min_idle`
    /// for this consumer, in stream order.
    async fn reclaim_stale(&self, min_idle: Duration, max_count: usize) -> Result<Vec<LogEvent>>;

    /// Number of entries delivered to the group but not yet acknowledged.
    async fn pending_count(&self) -> Result<usize>;

    /// Consumer name this stream handle reads as.
    fn consumer_name(&self) -> &str;
}

/// Names binding a [`RedisEventStream`] to its stream, group and consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBinding {
    pub stream_key: String,
    pub group: String,
    pub consumer: String,
}

#[derive(Clone)]
pub struct RedisEventStream {
    conn: ConnectionManager,
    binding: StreamBinding,
}

impl RedisEventStream {
    pub fn new(conn: ConnectionManager, binding: StreamBinding) -> Self {
        Self { conn, binding }
    }

    /// Producer side: append one log line with a server-assigned id.
    pub async fn append(&self, event: &NewLogEvent) -> Result<EventId> {
        let mut conn = self.conn.clone();
        let timestamp = chrono::Utc::now().timestamp().to_string();

        let id: String = conn
            .xadd(
                &self.binding.stream_key,
                "*",
                &[
                    ("service", event.service.as_str()),
                    ("level", event.level.as_str()),
                    ("message", event.message.as_str()),
                    ("timestamp", timestamp.as_str()),
                ],
            )
            .await?;

        parse_entry_id(&id)
    }
}

#[async_trait]
impl EventStream for RedisEventStream {
    async fn ensure_group(&self, start_id: &str) -> Result<GroupStatus> {
        let mut conn = self.conn.clone();

        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.binding.stream_key)
            .arg(&self.binding.group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(
                    stream = %self.binding.stream_key,
                    group = %self.binding.group,
                    start_id,
                    "Consumer group created"
                );
                Ok(GroupStatus::Created)
            }
            Err(e) if is_busy_group(&e) => {
                debug!(group = %self.binding.group, "Consumer group already exists");
                Ok(GroupStatus::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_batch(&self, max_count: usize, block: Duration) -> Result<Vec<LogEvent>> {
        let mut conn = self.conn.clone();
        let opts = StreamReadOptions::default()
            .group(&self.binding.group, &self.binding.consumer)
            .count(max_count)
            .block(block.as_millis() as usize);

        // BLOCK timeout comes back as a nil reply
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.binding.stream_key], &[">"], &opts)
            .await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        reply
            .keys
            .into_iter()
            .filter(|key| key.key == self.binding.stream_key)
            .flat_map(|key| key.ids)
            .map(|entry| event_from_entry(&entry))
            .collect()
    }

    async fn acknowledge(&self, id: &EventId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .xack(
                &self.binding.stream_key,
                &self.binding.group,
                &[id.to_string()],
            )
            .await?;
        Ok(removed > 0)
    }

    async fn reclaim_stale(&self, min_idle: Duration, max_count: usize) -> Result<Vec<LogEvent>> {
        let mut conn = self.conn.clone();
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.binding.stream_key)
            .arg(&self.binding.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max_count)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = pending.ids.iter().map(|p| p.id.clone()).collect();
        for entry in &pending.ids {
            debug!(
                event_id = %entry.id,
                previous_consumer = %entry.consumer,
                idle_ms = entry.last_delivered_ms,
                times_delivered = entry.times_delivered,
                "Claiming stale pending entry"
            );
        }

        // XCLAIM re-checks the idle time, so an entry acknowledged or claimed
        // by someone else in between is skipped.
        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.binding.stream_key,
                &self.binding.group,
                &self.binding.consumer,
                min_idle_ms,
                ids.as_slice(),
            )
            .await?;

        let mut events = claimed
            .ids
            .iter()
            .map(event_from_entry)
            .collect::<Result<Vec<_>>>()?;
        events.sort_by_key(|event| event.id);

        if !events.is_empty() {
            info!(
                consumer = %self.binding.consumer,
                claimed = events.len(),
                "Reclaimed stale pending entries"
            );
        }

        Ok(events)
    }

    async fn pending_count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn
            .xpending(&self.binding.stream_key, &self.binding.group)
            .await?;
        Ok(reply.count())
    }

    fn consumer_name(&self) -> &str {
        &self.binding.consumer
    }
}

fn parse_entry_id(raw: &str) -> Result<EventId> {
    raw.parse().map_err(|e: crate::models::InvalidEventId| ProcessorError::MalformedEntry {
        id: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Missing fields are absent; an unparsable `timestamp` is absent too.
fn event_from_entry(entry: &StreamId) -> Result<LogEvent> {
    Ok(LogEvent {
        id: parse_entry_id(&entry.id)?,
        service: text_field(entry, "service"),
        level: text_field(entry, "level"),
        message: text_field(entry, "message"),
        timestamp: entry.get("timestamp"),
    })
}

/// Invalid UTF-8 is decoded lossily (U+FFFD) so the rest of the payload survives.
fn text_field(entry: &StreamId, key: &str) -> Option<String> {
    match entry.map.get(key)? {
        redis::Value::Data(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => Some(text.to_owned()),
            Err(e) => {
                warn!(
                    event_id = %entry.id,
                    field = key,
                    valid_up_to = e.valid_up_to(),
                    "Stream field is not valid UTF-8; replacing invalid bytes"
                );
                Some(String::from_utf8_lossy(bytes).into_owned())
            }
        },
        redis::Value::Status(text) => Some(text.clone()),
        redis::Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(id: &str, fields: &[(&str, &str)]) -> StreamId {
        let map: HashMap<String, redis::Value> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), redis::Value::Data(v.as_bytes().to_vec())))
            .collect();
        StreamId {
            id: id.to_string(),
            map,
        }
    }

    #[test]
    fn test_event_from_complete_entry() {
        let event = event_from_entry(&entry(
            "1700000000000-0",
            &[
                ("service", "auth-service"),
                ("level", "warn"),
                ("message", "token expired"),
                ("timestamp", "1700000000"),
            ],
        ))
        .unwrap();

        assert_eq!(event.id, EventId::new(1700000000000, 0));
        assert_eq!(event.service(), "auth-service");
        assert_eq!(event.level(), "warn");
        assert_eq!(event.message(), "token expired");
        assert_eq!(event.timestamp, Some(1700000000));
    }

    #[test]
    fn test_event_from_sparse_entry_is_best_effort() {
        let event = event_from_entry(&entry(
            "5-1",
            &[("message", "hello"), ("timestamp", "yesterday"), ("extra", "x")],
        ))
        .unwrap();

        assert_eq!(event.service, None);
        assert_eq!(event.service(), "unknown");
        assert_eq!(event.message(), "hello");
        assert_eq!(event.timestamp, None);
    }

    #[test]
    fn test_invalid_utf8_message_is_decoded_lossily() {
        let mut raw = entry("9-0", &[("service", "edge")]);
        raw.map.insert(
            "message".to_string(),
            redis::Value::Data(b"caf\xe9 overflow at 0x41414141 in handler".to_vec()),
        );

        let event = event_from_entry(&raw).unwrap();
        assert_eq!(
            event.message(),
            "caf\u{FFFD} overflow at 0x41414141 in handler"
        );
        assert_eq!(event.service(), "edge");
    }

    #[test]
    fn test_event_with_bad_id_is_malformed() {
        let err = event_from_entry(&entry("not-an-id", &[])).unwrap_err();
        assert!(matches!(err, ProcessorError::MalformedEntry { ref id, .. } if id == "not-an-id"));
    }
}
