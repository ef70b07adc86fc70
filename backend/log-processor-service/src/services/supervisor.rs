//! Crash-tolerant control loop: pull → score → persist → acknowledge
//!
//! An entry is acknowledged only after its own write succeeded. A failed write
//! leaves the entry on the pending-entry list, where a later reclaim pass (by
//! this worker or any other member of the group) picks it up again.

use crate::context::AppContext;
use crate::error::{is_missing_group, ProcessorError, Result};
use crate::metrics;
use crate::models::{DeliveryHandle, LogEvent, PersistedRecord};
use crate::services::stream_consumer::GroupStatus;
use resilience::{with_retry_if, RetryConfig};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    GroupReady,
    Polling,
    ProcessingBatch,
    /// Waiting out the fault backoff before polling again
    Faulted,
}

/// Recovery of entries abandoned on the pending-entry list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimPolicy {
    /// Only entries idle at least this long are claimed
    pub min_idle: Duration,
    /// Time between reclaim passes in [`ProcessingSupervisor::run`]
    pub interval: Duration,
    pub batch_size: usize,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            min_idle: Duration::from_secs(60),
            interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Group start position on first creation (`0` = stream origin)
    pub group_start_id: String,
    pub batch_size: usize,
    pub block_timeout: Duration,
    pub fault_backoff: Duration,
    /// Retry policy for establishing the consumer group at startup
    pub startup_retry: RetryConfig,
    /// `None` disables reclaiming
    pub reclaim: Option<ReclaimPolicy>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            group_start_id: "0".to_string(),
            batch_size: 10,
            block_timeout: Duration::from_millis(2000),
            fault_backoff: Duration::from_millis(1000),
            startup_retry: RetryConfig {
                max_retries: 5,
                initial_backoff: Duration::from_millis(500),
                ..Default::default()
            },
            reclaim: Some(ReclaimPolicy::default()),
        }
    }
}

/// What happened to a single delivered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Acknowledged {
        anomalous: bool,
        /// The entry was no longer pending when acknowledged (duplicate delivery)
        was_stale: bool,
    },
    /// The write failed; the entry stays pending
    PersistFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub delivered: usize,
    pub acknowledged: usize,
    pub persist_failed: usize,
    pub anomalies: usize,
    /// Shutdown was requested before every entry was attempted
    pub interrupted: bool,
}

impl BatchReport {
    fn merge(&mut self, other: &BatchReport) {
        self.delivered += other.delivered;
        self.acknowledged += other.acknowledged;
        self.persist_failed += other.persist_failed;
        self.anomalies += other.anomalies;
        self.interrupted |= other.interrupted;
    }
}

pub struct ProcessingSupervisor {
    ctx: AppContext,
    config: SupervisorConfig,
    state: SupervisorState,
    shutdown: Option<watch::Receiver<bool>>,
    totals: BatchReport,
}

impl ProcessingSupervisor {
    pub fn new(ctx: AppContext, config: SupervisorConfig) -> Self {
        Self {
            ctx,
            config,
            state: SupervisorState::Starting,
            shutdown: None,
            totals: BatchReport::default(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Counters accumulated over every batch this supervisor processed.
    pub fn totals(&self) -> &BatchReport {
        &self.totals
    }

    /// Make [`process_batch`](Self::process_batch) stop between events once
    /// `shutdown` turns `true`. [`run`](Self::run) installs this itself.
    pub fn set_shutdown(&mut self, shutdown: watch::Receiver<bool>) {
        self.shutdown = Some(shutdown);
    }

    /// Establish the consumer group, retrying transient failures.
    ///
    /// Exhausting the startup retry budget, or any non-transient error, is a
    /// [`ProcessorError::Startup`]. A shutdown signalled while retrying ends
    /// the attempt with [`ProcessorError::ShutdownRequested`].
    pub async fn start(&mut self) -> Result<GroupStatus> {
        self.transition(SupervisorState::Starting);

        let stream = &self.ctx.stream;
        let start_id = self.config.group_start_id.as_str();
        let retry = with_retry_if(
            self.config.startup_retry.clone(),
            || async move { stream.ensure_group(start_id).await },
            ProcessorError::is_transient,
        );

        let outcome = match self.shutdown.clone() {
            Some(mut shutdown) => {
                tokio::select! {
                    outcome = retry => outcome,
                    _ = shutdown_signalled(&mut shutdown) => {
                        info!("Shutdown requested while establishing consumer group");
                        return Err(ProcessorError::ShutdownRequested);
                    }
                }
            }
            None => retry.await,
        };

        let status = outcome.map_err(|e| {
            ProcessorError::Startup(format!(
                "could not establish consumer group: {}",
                e.into_inner()
            ))
        })?;

        info!(
            consumer = %self.ctx.stream.consumer_name(),
            group_status = ?status,
            "Consumer group ready"
        );
        self.transition(SupervisorState::GroupReady);
        Ok(status)
    }

    /// Pull one batch of new entries and process it.
    pub async fn poll_once(&mut self) -> Result<BatchReport> {
        self.transition(SupervisorState::Polling);

        let events = self
            .ctx
            .stream
            .pull_batch(self.config.batch_size, self.config.block_timeout)
            .await?;
        if events.is_empty() {
            return Ok(BatchReport::default());
        }

        metrics::record_batch();
        debug!(count = events.len(), "Pulled batch");
        self.run_batch(events).await
    }

    /// Claim stale pending entries and process them. No-op without a reclaim policy.
    pub async fn reclaim_once(&mut self) -> Result<BatchReport> {
        let Some(policy) = self.config.reclaim.clone() else {
            return Ok(BatchReport::default());
        };

        let events = self
            .ctx
            .stream
            .reclaim_stale(policy.min_idle, policy.batch_size)
            .await?;
        if events.is_empty() {
            return Ok(BatchReport::default());
        }

        metrics::record_reclaimed(events.len());
        self.run_batch(events).await
    }

    async fn run_batch(&mut self, events: Vec<LogEvent>) -> Result<BatchReport> {
        self.transition(SupervisorState::ProcessingBatch);
        let report = self.process_batch(events).await?;
        self.totals.merge(&report);
        self.transition(SupervisorState::Polling);
        Ok(report)
    }

    /// Process entries in delivery order. A failed write does not stop the
    /// batch; a failed acknowledge does (the stream itself is in trouble).
    pub async fn process_batch(&self, events: Vec<LogEvent>) -> Result<BatchReport> {
        let mut report = BatchReport {
            delivered: events.len(),
            ..Default::default()
        };

        for event in &events {
            if self.shutdown_requested() {
                info!(
                    remaining = report.delivered - report.acknowledged - report.persist_failed,
                    "Shutdown requested; leaving remaining entries pending"
                );
                report.interrupted = true;
                break;
            }

            match self.process_event(event).await? {
                EventOutcome::Acknowledged { anomalous, .. } => {
                    report.acknowledged += 1;
                    if anomalous {
                        report.anomalies += 1;
                    }
                }
                EventOutcome::PersistFailed => report.persist_failed += 1,
            }
        }

        Ok(report)
    }

    /// Score, persist and (only if persisted) acknowledge one entry.
    pub async fn process_event(&self, event: &LogEvent) -> Result<EventOutcome> {
        let mut handle = DeliveryHandle::pending(event.id);
        let verdict = self.ctx.classifier.score(event.message());
        let record = PersistedRecord::from_scored(event, &verdict);

        if let Err(e) = self.ctx.store.write(&record).await {
            warn!(
                event_id = %event.id,
                service = %event.service(),
                error = %e,
                transient = e.is_transient(),
                "Failed to persist event; leaving it pending for redelivery"
            );
            metrics::record_outcome("persist_failed");
            return Ok(EventOutcome::PersistFailed);
        }

        let removed = self.ctx.stream.acknowledge(&handle.event_id).await?;
        handle.mark_acknowledged();

        if removed {
            metrics::record_outcome("acknowledged");
        } else {
            debug!(event_id = %event.id, "Entry was no longer pending when acknowledged");
            metrics::record_outcome("ack_stale");
        }

        if verdict.anomalous {
            metrics::record_anomaly(event.level());
            info!(
                event_id = %event.id,
                service = %event.service(),
                level = %event.level(),
                message_len = event.message().chars().count(),
                score = verdict.score,
                "Anomaly detected"
            );
        } else {
            debug!(
                event_id = %event.id,
                service = %event.service(),
                score = verdict.score,
                "Event normal"
            );
        }

        Ok(EventOutcome::Acknowledged {
            anomalous: verdict.anomalous,
            was_stale: !removed,
        })
    }

    /// Run until `shutdown` turns `true`.
    ///
    /// Only a startup failure is returned as an error; everything after that
    /// goes through the faulted state and backoff. Shutdown during startup
    /// returns `Ok`.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.shutdown = Some(shutdown);
        match self.start().await {
            Ok(_) => {}
            Err(ProcessorError::ShutdownRequested) => return Ok(()),
            Err(e) => return Err(e),
        }

        // Entries a previous incarnation of this worker left behind
        let mut last_reclaim = Instant::now();
        if self.config.reclaim.is_some() {
            self.reclaim_pass().await;
        }

        while !self.shutdown_requested() {
            let reclaim_due = self
                .config
                .reclaim
                .as_ref()
                .is_some_and(|policy| last_reclaim.elapsed() >= policy.interval);
            if reclaim_due {
                last_reclaim = Instant::now();
                self.reclaim_pass().await;
                continue;
            }

            if let Err(e) = self.poll_once().await {
                self.fault(e).await;
            }
        }

        info!(
            acknowledged = self.totals.acknowledged,
            persist_failed = self.totals.persist_failed,
            anomalies = self.totals.anomalies,
            "Supervisor stopped"
        );
        Ok(())
    }

    async fn reclaim_pass(&mut self) {
        match self.reclaim_once().await {
            Ok(report) if report.delivered > 0 => {
                info!(
                    reclaimed = report.delivered,
                    acknowledged = report.acknowledged,
                    persist_failed = report.persist_failed,
                    "Reclaim pass finished"
                );
            }
            Ok(_) => {}
            Err(e) => {
                self.fault(e).await;
                return;
            }
        }

        match self.ctx.stream.pending_count().await {
            Ok(count) => metrics::set_pending(count),
            Err(e) => debug!(error = %e, "Failed to read pending-entry count"),
        }
    }

    async fn fault(&mut self, err: ProcessorError) {
        self.transition(SupervisorState::Faulted);
        metrics::record_fault();
        error!(
            error = %err,
            transient = err.is_transient(),
            backoff_ms = self.config.fault_backoff.as_millis() as u64,
            "Processing loop fault"
        );

        if let ProcessorError::Stream(redis_err) = &err {
            if is_missing_group(redis_err) {
                warn!("Consumer group disappeared; recreating it");
                if let Err(e) = self
                    .ctx
                    .stream
                    .ensure_group(&self.config.group_start_id)
                    .await
                {
                    error!(error = %e, "Failed to recreate consumer group");
                }
            }
        }

        match self.shutdown.clone() {
            Some(mut shutdown) => {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.fault_backoff) => {}
                    _ = shutdown_signalled(&mut shutdown) => {}
                }
            }
            None => tokio::time::sleep(self.config.fault_backoff).await,
        }

        self.transition(SupervisorState::Polling);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|shutdown| *shutdown.borrow())
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Supervisor state transition");
            self.state = next;
        }
    }
}

/// Resolves once the flag is `true`; never resolves if the sender is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
