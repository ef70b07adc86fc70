//! In-memory stand-ins for the Redis stream and the PostgreSQL store
#![allow(dead_code)]

use async_trait::async_trait;
use log_processor_service::error::{ProcessorError, Result};
use log_processor_service::models::{EventId, LogEvent, PersistedRecord};
use log_processor_service::services::classifier::{LengthClassifier, ModelSource};
use log_processor_service::services::persistence::{RecordStore, WriteOutcome};
use log_processor_service::services::stream_consumer::{EventStream, GroupStatus};
use log_processor_service::services::supervisor::{ReclaimPolicy, SupervisorConfig};
use log_processor_service::AppContext;
use resilience::RetryConfig;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn connection_refused() -> ProcessorError {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
    ProcessorError::Stream(redis::RedisError::from(io))
}

fn response_error(desc: &'static str) -> ProcessorError {
    ProcessorError::Stream(redis::RedisError::from((
        redis::ErrorKind::ResponseError,
        desc,
    )))
}

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub consumer: String,
    pub delivered_at: Instant,
    pub deliveries: u32,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<LogEvent>,
    next_ms: u64,
    /// Index of the next entry never delivered to the group; `None` until created
    cursor: Option<usize>,
    pending: BTreeMap<EventId, PendingEntry>,
    acked: Vec<EventId>,
    ensure_calls: usize,
    fail_ensure: usize,
    fail_ensure_fatal: bool,
    fail_pulls: usize,
    fail_acks: usize,
}

/// Single stream with one consumer group. Handles made with [`InMemoryStream::consumer`]
/// share the group, like several workers pointed at one Redis.
#[derive(Clone)]
pub struct InMemoryStream {
    state: Arc<Mutex<StreamState>>,
    consumer: String,
}

impl InMemoryStream {
    pub fn new(consumer: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState {
                next_ms: 1,
                ..Default::default()
            })),
            consumer: consumer.to_string(),
        }
    }

    /// Another consumer of the same stream and group.
    pub fn consumer(&self, name: &str) -> Self {
        Self {
            state: self.state.clone(),
            consumer: name.to_string(),
        }
    }

    pub fn append(&self, service: Option<&str>, level: Option<&str>, message: Option<&str>) -> EventId {
        let mut state = self.state.lock().unwrap();
        let id = EventId::new(state.next_ms, 0);
        state.next_ms += 1;
        state.entries.push(LogEvent {
            id,
            service: service.map(str::to_string),
            level: level.map(str::to_string),
            message: message.map(str::to_string),
            timestamp: None,
        });
        id
    }

    pub fn append_message(&self, message: &str) -> EventId {
        self.append(Some("test-service"), Some("info"), Some(message))
    }

    pub fn pending_ids(&self) -> Vec<EventId> {
        self.state.lock().unwrap().pending.keys().copied().collect()
    }

    pub fn pending_entry(&self, id: &EventId) -> Option<PendingEntry> {
        self.state.lock().unwrap().pending.get(id).cloned()
    }

    pub fn acked(&self) -> Vec<EventId> {
        self.state.lock().unwrap().acked.clone()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.state.lock().unwrap().cursor
    }

    pub fn ensure_calls(&self) -> usize {
        self.state.lock().unwrap().ensure_calls
    }

    pub fn fail_next_ensures(&self, count: usize) {
        self.state.lock().unwrap().fail_ensure = count;
    }

    pub fn fail_ensure_permanently(&self) {
        self.state.lock().unwrap().fail_ensure_fatal = true;
    }

    pub fn fail_next_pulls(&self, count: usize) {
        self.state.lock().unwrap().fail_pulls = count;
    }

    pub fn fail_next_acks(&self, count: usize) {
        self.state.lock().unwrap().fail_acks = count;
    }

    /// Age every pending entry as if it had been idle for `by`.
    pub fn age_pending(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        for entry in state.pending.values_mut() {
            if let Some(earlier) = entry.delivered_at.checked_sub(by) {
                entry.delivered_at = earlier;
            }
        }
    }
}

#[async_trait]
impl EventStream for InMemoryStream {
    async fn ensure_group(&self, start_id: &str) -> Result<GroupStatus> {
        let mut state = self.state.lock().unwrap();
        state.ensure_calls += 1;

        if state.fail_ensure_fatal {
            return Err(response_error("NOPERM this user has no permissions"));
        }
        if state.fail_ensure > 0 {
            state.fail_ensure -= 1;
            return Err(connection_refused());
        }
        if state.cursor.is_some() {
            return Ok(GroupStatus::AlreadyExists);
        }

        let cursor = if start_id == "$" {
            state.entries.len()
        } else {
            let start: EventId = start_id.parse().unwrap_or(EventId::new(0, 0));
            state
                .entries
                .iter()
                .position(|e| e.id > start)
                .unwrap_or(state.entries.len())
        };
        state.cursor = Some(cursor);
        Ok(GroupStatus::Created)
    }

    async fn pull_batch(&self, max_count: usize, block: Duration) -> Result<Vec<LogEvent>> {
        let batch = {
            let mut state = self.state.lock().unwrap();
            if state.fail_pulls > 0 {
                state.fail_pulls -= 1;
                return Err(connection_refused());
            }
            let Some(cursor) = state.cursor else {
                return Err(response_error("NOGROUP No such consumer group"));
            };

            let end = (cursor + max_count).min(state.entries.len());
            let batch: Vec<LogEvent> = state.entries[cursor..end].to_vec();
            state.cursor = Some(end);

            let now = Instant::now();
            for event in &batch {
                state.pending.insert(
                    event.id,
                    PendingEntry {
                        consumer: self.consumer.clone(),
                        delivered_at: now,
                        deliveries: 1,
                    },
                );
            }
            batch
        };

        if batch.is_empty() {
            tokio::time::sleep(block).await;
        }
        Ok(batch)
    }

    async fn acknowledge(&self, id: &EventId) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.fail_acks > 0 {
            state.fail_acks -= 1;
            return Err(connection_refused());
        }
        let removed = state.pending.remove(id).is_some();
        if removed {
            state.acked.push(*id);
        }
        Ok(removed)
    }

    async fn reclaim_stale(&self, min_idle: Duration, max_count: usize) -> Result<Vec<LogEvent>> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let stale: Vec<EventId> = state
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .take(max_count)
            .collect();

        let mut claimed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(entry) = state.pending.get_mut(&id) {
                entry.consumer = self.consumer.clone();
                entry.delivered_at = now;
                entry.deliveries += 1;
            }
            if let Some(event) = state.entries.iter().find(|e| e.id == id) {
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.state.lock().unwrap().pending.len())
    }

    fn consumer_name(&self) -> &str {
        &self.consumer
    }
}

#[derive(Default)]
struct StoreState {
    rows: HashMap<String, PersistedRecord>,
    /// `log_id` of every successful write, in call order
    writes: Vec<String>,
    fail_next: usize,
    fail_once: HashSet<String>,
    fail_always: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&self, log_id: &str) -> Option<PersistedRecord> {
        self.state.lock().unwrap().rows.get(log_id).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().unwrap().rows.len()
    }

    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().unwrap().fail_next = count;
    }

    pub fn fail_once_for(&self, id: EventId) {
        self.state.lock().unwrap().fail_once.insert(id.to_string());
    }

    pub fn fail_always_for(&self, id: EventId) {
        self.state.lock().unwrap().fail_always.insert(id.to_string());
    }

    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_next = 0;
        state.fail_once.clear();
        state.fail_always.clear();
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn write(&self, record: &PersistedRecord) -> Result<WriteOutcome> {
        let mut state = self.state.lock().unwrap();

        let injected = state.fail_next > 0
            || state.fail_always.contains(&record.log_id)
            || state.fail_once.remove(&record.log_id);
        if injected {
            state.fail_next = state.fail_next.saturating_sub(1);
            return Err(ProcessorError::Database(sqlx::Error::PoolTimedOut));
        }

        // PostgreSQL text columns reject NUL outright
        let text = [&record.service, &record.level, &record.message];
        if text.iter().any(|field| field.contains('\0')) {
            return Err(ProcessorError::Database(sqlx::Error::Protocol(
                "invalid byte sequence for encoding \"UTF8\": 0x00".into(),
            )));
        }

        state.writes.push(record.log_id.clone());
        Ok(match state.rows.insert(record.log_id.clone(), record.clone()) {
            None => WriteOutcome::Inserted,
            Some(_) => WriteOutcome::Updated,
        })
    }
}

pub fn length_classifier() -> LengthClassifier {
    LengthClassifier::new(ModelSource::Reference(Default::default()))
}

pub fn context(stream: &InMemoryStream, store: &InMemoryStore) -> AppContext {
    AppContext::new(
        Arc::new(stream.clone()),
        length_classifier(),
        Arc::new(store.clone()),
    )
    .expect("reference classifier should fit")
}

/// Fast timings; reclaim only picks up entries that were aged explicitly.
pub fn test_config() -> SupervisorConfig {
    SupervisorConfig {
        group_start_id: "0".to_string(),
        batch_size: 10,
        block_timeout: Duration::from_millis(5),
        fault_backoff: Duration::from_millis(10),
        startup_retry: RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        },
        reclaim: Some(ReclaimPolicy {
            min_idle: Duration::from_secs(60),
            interval: Duration::from_millis(20),
            batch_size: 100,
        }),
    }
}
