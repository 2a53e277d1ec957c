// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch writer workers: drain the queue and commit envelopes to the backend.
//!
//! ```text
//!   dequeue_batch ──> bulk_write ──┬─ Ok(outcomes) ──> Committed / Failed(Rejected)
//!                        ^         ├─ transient ──> backoff ──┘ (until max_attempts)
//!                        │         └─ permanent ──> Failed(Rejected) for the envelope
//!                        └── retries re-send the whole envelope; ids make it idempotent
//! ```
//!
//! Exhausted retries mark the whole envelope `Failed(BackendUnavailable)` and
//! drop it. Every attempt feeds the [`HealthMonitor`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backend::{StorageBackend, WriteOutcome};
use crate::error::BackendError;
use crate::health::HealthMonitor;
use crate::queue::{BatchLimits, QueueReceiver};
use crate::record::{BatchEnvelope, RecordId};
use crate::tracker::{DeliveryStatus, DeliveryTracker, FailureReason};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BATCH_MAX_RECORDS: usize = 500;
pub const DEFAULT_BATCH_MAX_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_BATCH_MAX_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per envelope, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure: `base * 2^(attempt-1)`, capped at
    /// `max_delay`, plus up to a quarter of that as jitter.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
        delay + Duration::from_millis(fastrand::u64(0..=spread))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    pub limits: BatchLimits,
    pub max_wait: Duration,
    pub retry: RetryPolicy,
    /// Upper bound on a single `bulk_write` call. Expiry counts as a transient failure.
    pub commit_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            limits: BatchLimits {
                max_count: DEFAULT_BATCH_MAX_RECORDS,
                max_bytes: DEFAULT_BATCH_MAX_BYTES,
            },
            max_wait: DEFAULT_BATCH_MAX_WAIT,
            retry: RetryPolicy::default(),
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
        }
    }
}

/// Result of committing one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    /// The backend answered; per-record outcomes were applied.
    Completed {
        committed: usize,
        rejected: usize,
        attempts: u32,
    },
    /// Every record of the envelope was marked `Failed(reason)`.
    Failed {
        reason: FailureReason,
        records: usize,
        attempts: u32,
    },
}

#[derive(Clone)]
pub struct BatchWriter {
    backend: Arc<dyn StorageBackend>,
    tracker: Arc<DeliveryTracker>,
    health: Arc<HealthMonitor>,
    config: WriterConfig,
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchWriter {
    #[must_use]
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        tracker: Arc<DeliveryTracker>,
        health: Arc<HealthMonitor>,
        config: WriterConfig,
    ) -> Self {
        Self {
            backend,
            tracker,
            health,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Spawns `workers` tasks sharing `receiver`.
    ///
    /// Workers exit once `draining` is cancelled and the queue is empty. Cancelling
    /// `abort` interrupts in-flight commits, which are then marked
    /// `Failed(ShutdownDrainTimeout)`.
    pub fn spawn(
        &self,
        workers: usize,
        receiver: &QueueReceiver,
        draining: &CancellationToken,
        abort: &CancellationToken,
    ) -> JoinSet<()> {
        let mut set = JoinSet::new();
        for worker in 0..workers.max(1) {
            let writer = self.clone();
            let receiver = receiver.clone();
            let draining = draining.clone();
            let abort = abort.clone();
            set.spawn(async move { writer.run(worker, receiver, draining, abort).await });
        }
        set
    }

    pub async fn run(
        self,
        worker: usize,
        receiver: QueueReceiver,
        draining: CancellationToken,
        abort: CancellationToken,
    ) {
        debug!(worker, "WRITER | Worker started");
        loop {
            if abort.is_cancelled() {
                break;
            }
            let envelope = receiver
                .dequeue_batch(self.config.limits, self.config.max_wait, &draining)
                .await;
            if envelope.is_empty() {
                if draining.is_cancelled() || receiver.is_closed() {
                    break;
                }
                continue;
            }
            self.commit(envelope, &abort).await;
        }
        debug!(worker, "WRITER | Worker stopped");
    }

    /// Writes `envelope` to the backend, retrying transient failures, and records
    /// the outcome of every record in the tracker.
    pub async fn commit(&self, envelope: BatchEnvelope, abort: &CancellationToken) -> CommitResult {
        let records = envelope.into_records();
        let ids: Vec<RecordId> = records.iter().map(|r| r.id).collect();
        let timeout_ms = self.config.commit_timeout.as_millis();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                () = abort.cancelled() => {
                    return self.fail_all(&ids, FailureReason::ShutdownDrainTimeout, attempts);
                }
                result = tokio::time::timeout(
                    self.config.commit_timeout,
                    self.backend.bulk_write(&records),
                ) => result.unwrap_or(Err(BackendError::Timeout(timeout_ms))),
            };

            match result {
                Ok(outcomes) => {
                    self.health.record_success();
                    return self.apply(outcomes, &ids, attempts);
                }
                Err(e) if e.is_retryable() => {
                    self.health.record_failure();
                    if attempts >= self.config.retry.max_attempts {
                        error!(
                            records = ids.len(),
                            attempts,
                            "WRITER | Dropping envelope after exhausting retries: {e}"
                        );
                        return self.fail_all(&ids, FailureReason::BackendUnavailable, attempts);
                    }
                    let delay = self.config.retry.backoff(attempts);
                    warn!(
                        records = ids.len(),
                        attempt = attempts,
                        "WRITER | Commit failed, retrying in {} ms: {e}",
                        delay.as_millis()
                    );
                    tokio::select! {
                        biased;
                        () = abort.cancelled() => {
                            return self.fail_all(&ids, FailureReason::ShutdownDrainTimeout, attempts);
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    // The backend answered, so it is reachable even though it refused the request.
                    self.health.record_success();
                    error!(
                        records = ids.len(),
                        "WRITER | Backend refused envelope: {e}"
                    );
                    return self.fail_all(&ids, FailureReason::Rejected(e.to_string()), attempts);
                }
            }
        }
    }

    fn apply(&self, outcomes: Vec<WriteOutcome>, ids: &[RecordId], attempts: u32) -> CommitResult {
        let mut seen = HashSet::with_capacity(outcomes.len());
        let mut committed = 0;
        let mut rejected = 0;
        for outcome in outcomes {
            seen.insert(outcome.id());
            match outcome {
                WriteOutcome::Written(id) => {
                    self.transition(id, DeliveryStatus::Committed);
                    committed += 1;
                }
                WriteOutcome::Rejected { id, reason } => {
                    self.transition(id, DeliveryStatus::Failed(FailureReason::Rejected(reason)));
                    rejected += 1;
                }
            }
        }
        for id in ids.iter().filter(|id| !seen.contains(*id)) {
            self.transition(
                *id,
                DeliveryStatus::Failed(FailureReason::Rejected(
                    "missing from backend response".to_string(),
                )),
            );
            rejected += 1;
        }
        debug!(committed, rejected, attempts, "WRITER | Envelope committed");
        CommitResult::Completed {
            committed,
            rejected,
            attempts,
        }
    }

    fn fail_all(&self, ids: &[RecordId], reason: FailureReason, attempts: u32) -> CommitResult {
        let refused = self
            .tracker
            .record_all(ids.iter().copied(), &DeliveryStatus::Failed(reason.clone()));
        for e in &refused {
            warn!("WRITER | {e}");
        }
        CommitResult::Failed {
            reason,
            records: ids.len(),
            attempts,
        }
    }

    fn transition(&self, id: RecordId, status: DeliveryStatus) {
        if let Err(e) = self.tracker.record(id, status) {
            warn!(%id, "WRITER | {e}");
        }
    }
}

/// Logs how a worker pool ended. Used by the pipeline after joining the workers.
pub(crate) fn log_worker_exit(result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => debug!("WRITER | Worker cancelled"),
        Err(e) => error!("WRITER | Worker panicked: {e}"),
    }
}
