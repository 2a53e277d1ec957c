// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded ingestion queue between HTTP handlers and batch writer workers.
//!
//! Producers hold cloneable [`QueueSender`]s and never wait: a full queue is
//! reported immediately as backpressure. Workers share a single [`QueueReceiver`]
//! and take whole envelopes from it, so each record goes to exactly one worker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AdmissionError;
use crate::record::{BatchEnvelope, LogRecord};

/// Creates a queue holding at most `capacity` records.
#[must_use]
pub fn bounded(capacity: usize) -> (QueueSender, QueueReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let closed = Arc::new(AtomicBool::new(false));
    let pending = Arc::new(AtomicUsize::new(0));
    let sender = QueueSender {
        tx,
        capacity,
        closed: Arc::clone(&closed),
        pending: Arc::clone(&pending),
    };
    let receiver = QueueReceiver {
        inner: Arc::new(Mutex::new(ReceiverState { rx, carry: None })),
        closed,
        pending,
    };
    (sender, receiver)
}

#[derive(Clone, Debug)]
pub struct QueueSender {
    tx: mpsc::Sender<LogRecord>,
    capacity: usize,
    closed: Arc<AtomicBool>,
    /// Records admitted and not yet handed to an envelope, the carried one included.
    pending: Arc<AtomicUsize>,
}

impl QueueSender {
    /// Adds `record` to the tail of the queue without waiting.
    ///
    /// On failure the record is handed back with the reason.
    #[allow(clippy::result_large_err)]
    pub fn enqueue(&self, record: LogRecord) -> Result<(), (AdmissionError, LogRecord)> {
        if self.closed.load(Ordering::Acquire) {
            return Err((AdmissionError::ShuttingDown, record));
        }
        let reserved = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err((AdmissionError::QueueFull, record));
        }
        self.tx.try_send(record).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            match e {
                mpsc::error::TrySendError::Full(record) => (AdmissionError::QueueFull, record),
                mpsc::error::TrySendError::Closed(record) => (AdmissionError::ShuttingDown, record),
            }
        })
    }

    /// Stops admission. Records already queued stay available to the workers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of records currently waiting in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug)]
struct ReceiverState {
    rx: mpsc::Receiver<LogRecord>,
    /// Record taken off the channel that did not fit the previous envelope.
    carry: Option<LogRecord>,
}

/// Envelope bounds used by [`QueueReceiver::dequeue_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_count: usize,
    pub max_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct QueueReceiver {
    inner: Arc<Mutex<ReceiverState>>,
    closed: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
}

impl QueueReceiver {
    /// Waits until `limits.max_count` records are available or `max_wait` elapses,
    /// whichever comes first, and returns what was collected in FIFO order.
    ///
    /// Once `draining` is cancelled the call stops waiting and returns whatever is
    /// already buffered; an empty envelope then means the queue is exhausted.
    pub async fn dequeue_batch(
        &self,
        limits: BatchLimits,
        max_wait: Duration,
        draining: &CancellationToken,
    ) -> BatchEnvelope {
        let max_count = limits.max_count.max(1);
        let mut state = self.inner.lock().await;
        let deadline = Instant::now() + max_wait;
        let mut envelope = BatchEnvelope::with_capacity(max_count.min(1024));

        if let Some(record) = state.carry.take() {
            self.release(1);
            envelope.push(record);
        }

        while envelope.len() < max_count {
            let next = match state.rx.try_recv() {
                Ok(record) => Some(record),
                Err(mpsc::error::TryRecvError::Disconnected) => break,
                Err(mpsc::error::TryRecvError::Empty) => {
                    if draining.is_cancelled() {
                        break;
                    }
                    tokio::select! {
                        biased;
                        received = state.rx.recv() => match received {
                            Some(record) => Some(record),
                            None => break,
                        },
                        () = tokio::time::sleep_until(deadline) => break,
                        () = draining.cancelled() => None,
                    }
                }
            };

            let Some(record) = next else { continue };
            if envelope.fits(&record, max_count, limits.max_bytes) {
                self.release(1);
                envelope.push(record);
            } else {
                state.carry = Some(record);
                break;
            }
        }

        if !envelope.is_empty() {
            debug!(
                "QUEUE | Dequeued envelope of {} records ({} bytes)",
                envelope.len(),
                envelope.bytes()
            );
        }
        envelope
    }

    /// Closes the channel and removes every record still buffered.
    ///
    /// Sends racing with this call either land before the close and are returned
    /// here, or fail with `ShuttingDown`.
    pub async fn drain_remaining(&self) -> Vec<LogRecord> {
        let mut state = self.inner.lock().await;
        state.rx.close();
        let mut remaining: Vec<LogRecord> = state.carry.take().into_iter().collect();
        // After `close`, `recv` yields `None` only once in-progress sends have landed.
        while let Some(record) = state.rx.recv().await {
            remaining.push(record);
        }
        self.release(remaining.len());
        remaining
    }

    fn release(&self, count: usize) {
        if count > 0 {
            self.pending.fetch_sub(count, Ordering::AcqRel);
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::record_at;

    const WIDE: BatchLimits = BatchLimits {
        max_count: 100,
        max_bytes: usize::MAX,
    };

    #[tokio::test]
    async fn test_enqueue_fails_fast_when_full() {
        let (sender, _receiver) = bounded(3);
        for i in 0..3 {
            assert!(sender.enqueue(record_at("ok", 1, i)).is_ok());
        }
        let (error, returned) = sender.enqueue(record_at("overflow", 1, 3)).unwrap_err();
        assert_eq!(error, AdmissionError::QueueFull);
        assert_eq!(returned.message, "overflow");
        assert_eq!(sender.len(), 3);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_with_shutting_down() {
        let (sender, receiver) = bounded(3);
        sender.enqueue(record_at("before", 1, 0)).unwrap();
        sender.close();
        assert!(receiver.is_closed());
        let (error, _) = sender.enqueue(record_at("after", 1, 1)).unwrap_err();
        assert_eq!(error, AdmissionError::ShuttingDown);

        let envelope = receiver
            .dequeue_batch(WIDE, Duration::from_millis(10), &CancellationToken::new())
            .await;
        assert_eq!(envelope.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_preserves_fifo_order() {
        let (sender, receiver) = bounded(10);
        for i in 0..5 {
            sender.enqueue(record_at(&format!("m{i}"), 1, i)).unwrap();
        }
        let envelope = receiver
            .dequeue_batch(WIDE, Duration::from_millis(10), &CancellationToken::new())
            .await;
        let sequences: Vec<u64> = envelope.records().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_dequeue_returns_at_max_count_without_waiting() {
        let (sender, receiver) = bounded(10);
        for i in 0..5 {
            sender.enqueue(record_at("m", 1, i)).unwrap();
        }
        let limits = BatchLimits {
            max_count: 2,
            max_bytes: usize::MAX,
        };
        let started = std::time::Instant::now();
        let envelope = receiver
            .dequeue_batch(limits, Duration::from_secs(30), &CancellationToken::new())
            .await;
        assert_eq!(envelope.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(sender.len(), 3);
    }

    #[tokio::test]
    async fn test_dequeue_returns_partial_batch_after_max_wait() {
        let (sender, receiver) = bounded(10);
        sender.enqueue(record_at("only", 1, 0)).unwrap();
        let envelope = receiver
            .dequeue_batch(WIDE, Duration::from_millis(50), &CancellationToken::new())
            .await;
        assert_eq!(envelope.len(), 1);

        let empty = receiver
            .dequeue_batch(WIDE, Duration::from_millis(20), &CancellationToken::new())
            .await;
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_wakes_for_late_records() {
        let (sender, receiver) = bounded(10);
        let producer = sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(record_at("late", 1, 0)).unwrap();
        });
        let limits = BatchLimits {
            max_count: 1,
            max_bytes: usize::MAX,
        };
        let envelope = receiver
            .dequeue_batch(limits, Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert_eq!(envelope.records()[0].message, "late");
    }

    #[tokio::test]
    async fn test_byte_limit_carries_record_to_next_envelope() {
        let (sender, receiver) = bounded(10);
        for i in 0..3 {
            sender.enqueue(record_at("payload", 1, i)).unwrap();
        }
        let one_record = record_at("payload", 1, 0).encoded_len();
        let limits = BatchLimits {
            max_count: 10,
            max_bytes: one_record * 2,
        };
        let draining = CancellationToken::new();
        let first = receiver
            .dequeue_batch(limits, Duration::from_millis(10), &draining)
            .await;
        let second = receiver
            .dequeue_batch(limits, Duration::from_millis(10), &draining)
            .await;
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second.records()[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_draining_stops_waiting() {
        let (_sender, receiver) = bounded(10);
        let draining = CancellationToken::new();
        draining.cancel();
        let started = std::time::Instant::now();
        let envelope = receiver
            .dequeue_batch(WIDE, Duration::from_secs(30), &draining)
            .await;
        assert!(envelope.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_concurrent_workers_never_share_records() {
        let (sender, receiver) = bounded(1000);
        for i in 0..1000 {
            sender.enqueue(record_at("m", 1, i)).unwrap();
        }
        let limits = BatchLimits {
            max_count: 7,
            max_bytes: usize::MAX,
        };
        let draining = CancellationToken::new();
        draining.cancel();

        let mut workers = Vec::new();
        for _ in 0..4 {
            let receiver = receiver.clone();
            let draining = draining.clone();
            workers.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                loop {
                    let envelope = receiver
                        .dequeue_batch(limits, Duration::from_millis(5), &draining)
                        .await;
                    if envelope.is_empty() {
                        break taken;
                    }
                    taken.extend(envelope.records().iter().map(|r| r.sequence));
                }
            }));
        }

        let mut all = Vec::new();
        for worker in workers {
            all.extend(worker.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_carried_record_counts_against_capacity() {
        let (sender, receiver) = bounded(2);
        sender.enqueue(record_at("payload", 1, 0)).unwrap();
        sender.enqueue(record_at("payload", 1, 1)).unwrap();
        let limits = BatchLimits {
            max_count: 10,
            max_bytes: record_at("payload", 1, 0).encoded_len(),
        };
        let envelope = receiver
            .dequeue_batch(limits, Duration::from_millis(10), &CancellationToken::new())
            .await;
        assert_eq!(envelope.len(), 1);

        // One slot is free again; the carried record still holds the other.
        assert_eq!(sender.len(), 1);
        sender.enqueue(record_at("payload", 1, 2)).unwrap();
        let (error, _) = sender.enqueue(record_at("payload", 1, 3)).unwrap_err();
        assert_eq!(error, AdmissionError::QueueFull);

        let remaining = receiver.drain_remaining().await;
        let sequences: Vec<u64> = remaining.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert!(sender.is_empty());
    }

    #[tokio::test]
    async fn test_sends_after_drain_are_refused() {
        let (sender, receiver) = bounded(10);
        sender.enqueue(record_at("queued", 1, 0)).unwrap();
        assert_eq!(receiver.drain_remaining().await.len(), 1);

        // The closed flag is still unset, as for a producer that checked it before close.
        assert!(!sender.is_closed());
        let (error, _) = sender.enqueue(record_at("late", 1, 1)).unwrap_err();
        assert_eq!(error, AdmissionError::ShuttingDown);
        assert!(sender.is_empty());
    }

    #[tokio::test]
    async fn test_drain_remaining_empties_queue() {
        let (sender, receiver) = bounded(10);
        for i in 0..4 {
            sender.enqueue(record_at("m", 1, i)).unwrap();
        }
        let remaining = receiver.drain_remaining().await;
        assert_eq!(remaining.len(), 4);
        assert!(sender.is_empty());
    }
}
