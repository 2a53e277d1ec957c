// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owns the queue, the tracker and the writer workers, and drives their lifecycle.
//!
//! ```text
//!   new ──> initialize ──> start ──> shutdown(grace)
//!   Created   Ready         Running   Stopping ──> Stopped
//! ```
//!
//! Shutdown stops admission first, lets the workers drain the queue until the
//! grace deadline, then interrupts them and fails whatever is left with
//! `ShutdownDrainTimeout`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{SearchPage, StorageBackend};
use crate::error::{AdmissionError, BackendError, PipelineError};
use crate::health::{HealthMonitor, HealthReport, DEFAULT_HEALTH_WINDOW, DEFAULT_MIN_SUCCESS_RATIO};
use crate::queue::{self, QueueReceiver, QueueSender};
use crate::record::{RawLogRecord, RecordId};
use crate::search::{SearchGateway, DEFAULT_SEARCH_MAX_LIMIT};
use crate::tracker::{DeliveryStatus, DeliveryTracker, FailureReason, Transition, DEFAULT_STATUS_TTL};
use crate::validator::{Validator, ValidatorLimits};
use crate::writer::{log_worker_exit, BatchWriter, WriterConfig};

pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub writer: WriterConfig,
    pub validator: ValidatorLimits,
    pub status_ttl: Duration,
    pub health_window: usize,
    pub health_min_success_ratio: f64,
    pub search_max_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            writer: WriterConfig::default(),
            validator: ValidatorLimits::default(),
            status_ttl: DEFAULT_STATUS_TTL,
            health_window: DEFAULT_HEALTH_WINDOW,
            health_min_success_ratio: DEFAULT_MIN_SUCCESS_RATIO,
            search_max_limit: DEFAULT_SEARCH_MAX_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Backend index not initialized yet.
    Created,
    /// Index initialized, workers not running.
    Ready,
    Running,
    Stopping,
    Stopped,
}

/// How a shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The grace deadline expired before the workers drained the queue.
    pub timed_out: bool,
    /// Records marked `Failed(ShutdownDrainTimeout)`, in flight or still queued.
    pub abandoned: usize,
}

struct RunningTasks {
    workers: JoinSet<()>,
    sweeper: JoinHandle<()>,
}

struct Lifecycle {
    state: PipelineState,
    tasks: Option<RunningTasks>,
}

pub struct IngestPipeline {
    config: PipelineConfig,
    validator: Validator,
    sender: QueueSender,
    receiver: QueueReceiver,
    tracker: Arc<DeliveryTracker>,
    health: Arc<HealthMonitor>,
    backend: Arc<dyn StorageBackend>,
    writer: BatchWriter,
    search: SearchGateway,
    sequence: AtomicU64,
    draining: CancellationToken,
    abort: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("queued", &self.sender.len())
            .finish_non_exhaustive()
    }
}

impl IngestPipeline {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, config: PipelineConfig) -> Self {
        let (sender, receiver) = queue::bounded(config.queue_capacity);
        let tracker = Arc::new(DeliveryTracker::new(config.status_ttl));
        let health = Arc::new(HealthMonitor::new(
            config.health_window,
            config.health_min_success_ratio,
        ));
        let writer = BatchWriter::new(
            Arc::clone(&backend),
            Arc::clone(&tracker),
            Arc::clone(&health),
            config.writer,
        );
        let search = SearchGateway::new(Arc::clone(&backend), config.search_max_limit);
        Self {
            validator: Validator::new(config.validator),
            config,
            sender,
            receiver,
            tracker,
            health,
            backend,
            writer,
            search,
            sequence: AtomicU64::new(0),
            draining: CancellationToken::new(),
            abort: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: PipelineState::Created,
                tasks: None,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.lifecycle().state
    }

    /// Creates the backend index if it is missing and resumes the admission sequence
    /// after the highest one already stored. Must succeed before [`start`](Self::start).
    pub async fn initialize(&self) -> Result<(), PipelineError> {
        let ready = match self.backend.ensure_index().await {
            Ok(()) => self.backend.max_sequence().await,
            Err(e) => Err(e),
        };
        match ready {
            Ok(stored) => {
                if let Some(max) = stored {
                    let next = max.saturating_add(1);
                    self.sequence.fetch_max(next, Ordering::Relaxed);
                    debug!("PIPELINE | Resuming admission sequence at {next}");
                }
                self.health.record_success();
                let mut lifecycle = self.lifecycle();
                if lifecycle.state == PipelineState::Created {
                    lifecycle.state = PipelineState::Ready;
                }
                info!("PIPELINE | Storage backend initialized");
                Ok(())
            }
            Err(e) => {
                self.health.record_failure();
                error!("PIPELINE | Failed to initialize storage backend: {e}");
                Err(PipelineError::Initialization(e))
            }
        }
    }

    /// Spawns the writer workers and the status eviction sweeper.
    pub fn start(&self) -> Result<(), PipelineError> {
        let mut lifecycle = self.lifecycle();
        match lifecycle.state {
            PipelineState::Created => return Err(PipelineError::NotInitialized),
            PipelineState::Running => return Err(PipelineError::AlreadyStarted),
            PipelineState::Stopping | PipelineState::Stopped => {
                return Err(PipelineError::NotRunning)
            }
            PipelineState::Ready => {}
        }

        let workers = self
            .writer
            .spawn(self.config.workers, &self.receiver, &self.draining, &self.abort);
        let sweeper = tokio::spawn(sweep_expired(
            Arc::clone(&self.tracker),
            self.draining.clone(),
        ));
        lifecycle.tasks = Some(RunningTasks { workers, sweeper });
        lifecycle.state = PipelineState::Running;
        info!(
            workers = self.config.workers.max(1),
            capacity = self.sender.capacity(),
            "PIPELINE | Started"
        );
        Ok(())
    }

    /// Validates and enqueues `raw`. The returned id can be passed to [`status`](Self::status).
    ///
    /// Returns as soon as the record is queued; durability is reported through the tracker.
    pub fn submit(&self, raw: RawLogRecord) -> Result<RecordId, AdmissionError> {
        if self.sender.is_closed() {
            return Err(AdmissionError::ShuttingDown);
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let record = self.validator.validate(raw, sequence)?;
        let id = record.id;

        // Registered before the send so a worker never commits an unknown id.
        self.register(id);
        match self.sender.enqueue(record) {
            Ok(()) => Ok(id),
            Err((e, _)) => {
                self.tracker.discard(&id);
                debug!(%id, "PIPELINE | Admission refused: {e}");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn status(&self, id: &RecordId) -> Option<DeliveryStatus> {
        self.tracker.lookup(id)
    }

    #[must_use]
    pub fn history(&self, id: &RecordId) -> Option<Vec<Transition>> {
        self.tracker.history(id)
    }

    pub async fn search(&self, text: Option<&str>, limit: usize) -> Result<SearchPage, BackendError> {
        self.search.search(text, limit).await
    }

    #[must_use]
    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !self.sender.is_closed()
    }

    #[must_use]
    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    /// Stops admission and drains the queue for at most `grace`.
    ///
    /// Returns [`PipelineError::NotRunning`] when the workers were never started or
    /// shutdown already ran; queued records are failed in either case.
    pub async fn shutdown(&self, grace: Duration) -> Result<ShutdownReport, PipelineError> {
        self.sender.close();
        self.draining.cancel();

        let tasks = {
            let mut lifecycle = self.lifecycle();
            let tasks = lifecycle.tasks.take();
            if tasks.is_some() {
                lifecycle.state = PipelineState::Stopping;
            }
            tasks
        };
        let Some(mut tasks) = tasks else {
            let abandoned = self.fail_remaining().await;
            self.lifecycle().state = PipelineState::Stopped;
            if abandoned > 0 {
                return Ok(ShutdownReport {
                    timed_out: false,
                    abandoned,
                });
            }
            return Err(PipelineError::NotRunning);
        };

        info!(
            queued = self.sender.len(),
            "PIPELINE | Shutting down, draining for up to {} ms",
            grace.as_millis()
        );
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = tasks.workers.join_next().await {
                log_worker_exit(result);
            }
        })
        .await;

        let timed_out = drained.is_err();
        if timed_out {
            warn!("PIPELINE | Shutdown grace period expired, abandoning undelivered records");
            self.abort.cancel();
            while let Some(result) = tasks.workers.join_next().await {
                log_worker_exit(result);
            }
        }
        if let Err(e) = tasks.sweeper.await {
            debug!("PIPELINE | Sweeper ended abnormally: {e}");
        }

        // Records interrupted mid-commit were already failed by their worker.
        let in_flight = self.count_failed_by_shutdown();
        let abandoned = in_flight + self.fail_remaining().await;
        self.lifecycle().state = PipelineState::Stopped;
        info!(timed_out, abandoned, "PIPELINE | Stopped");
        Ok(ShutdownReport {
            timed_out,
            abandoned,
        })
    }

    fn register(&self, id: RecordId) {
        for status in [DeliveryStatus::Admitted, DeliveryStatus::Queued] {
            if let Err(e) = self.tracker.record(id, status) {
                warn!(%id, "PIPELINE | {e}");
            }
        }
    }

    async fn fail_remaining(&self) -> usize {
        let remaining = self.receiver.drain_remaining().await;
        if remaining.is_empty() {
            return 0;
        }
        error!(
            records = remaining.len(),
            "PIPELINE | Queued records not committed before the shutdown deadline"
        );
        let refused = self.tracker.record_all(
            remaining.iter().map(|r| r.id),
            &DeliveryStatus::Failed(FailureReason::ShutdownDrainTimeout),
        );
        for e in &refused {
            warn!("PIPELINE | {e}");
        }
        remaining.len() - refused.len()
    }

    fn count_failed_by_shutdown(&self) -> usize {
        if !self.abort.is_cancelled() {
            return 0;
        }
        self.tracker
            .count_with_status(&DeliveryStatus::Failed(FailureReason::ShutdownDrainTimeout))
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Periodically evicts expired terminal entries until `stop` is cancelled.
async fn sweep_expired(tracker: Arc<DeliveryTracker>, stop: CancellationToken) {
    let period = (tracker.ttl() / 4).clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
    let mut interval = tokio::time::interval(period);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = interval.tick() => {
                tracker.evict_expired(std::time::Instant::now());
            }
        }
    }
}
