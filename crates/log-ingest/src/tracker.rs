// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-record delivery lifecycle, keyed by record id.
//!
//! ```text
//!   Admitted ──> Queued ──> Committed
//!       │          │
//!       └──────────┴──────> Failed(reason)
//! ```
//!
//! Each id keeps an append-only transition history. Only forward moves are
//! accepted. Terminal entries are evicted once their last transition is older
//! than the configured TTL; a lookup on an evicted id returns `None` (unknown),
//! which is distinct from `Failed`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use crate::error::TransitionError;
use crate::record::RecordId;

pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(3600);

/// Why a record ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail")]
pub enum FailureReason {
    /// The backend refused this record (e.g. mapping violation).
    Rejected(String),
    /// Retries were exhausted against an unreachable backend.
    BackendUnavailable,
    /// The shutdown grace deadline expired before the record was committed.
    ShutdownDrainTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Rejected(reason) => write!(f, "Rejected: {reason}"),
            FailureReason::BackendUnavailable => f.write_str("BackendUnavailable"),
            FailureReason::ShutdownDrainTimeout => f.write_str("ShutdownDrainTimeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Admitted,
    Queued,
    Committed,
    Failed(FailureReason),
}

impl DeliveryStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Committed | DeliveryStatus::Failed(_))
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            DeliveryStatus::Admitted => "admitted",
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Committed => "committed",
            DeliveryStatus::Failed(_) => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Admitted => 0,
            DeliveryStatus::Queued => 1,
            DeliveryStatus::Committed | DeliveryStatus::Failed(_) => 2,
        }
    }

    /// Forward moves only; nothing leaves a terminal state.
    fn can_move_to(&self, next: &DeliveryStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryStatus::Failed(FailureReason::Rejected(_)) => f.write_str("failed(Rejected)"),
            DeliveryStatus::Failed(reason) => write!(f, "failed({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// One entry of a record's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub status: DeliveryStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    history: Vec<Transition>,
    last_update: Instant,
}

impl Entry {
    fn current(&self) -> Option<&DeliveryStatus> {
        self.history.last().map(|t| &t.status)
    }
}

#[derive(Debug)]
pub struct DeliveryTracker {
    entries: Mutex<HashMap<RecordId, Entry>>,
    ttl: Duration,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_TTL)
    }
}

impl DeliveryTracker {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Appends `status` to the history of `id`.
    ///
    /// The first status recorded for an id must be `Admitted`.
    pub fn record(&self, id: RecordId, status: DeliveryStatus) -> Result<(), TransitionError> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get_mut(&id) {
            Some(entry) => {
                let Some(current) = entry.current() else {
                    return Err(TransitionError {
                        from: DeliveryStatus::Admitted,
                        to: status,
                    });
                };
                if !current.can_move_to(&status) {
                    return Err(TransitionError {
                        from: current.clone(),
                        to: status,
                    });
                }
                if let DeliveryStatus::Failed(reason) = &status {
                    error!(%id, reason = %reason, "TRACKER | Record delivery failed");
                }
                entry.history.push(Transition {
                    status,
                    at: Utc::now(),
                });
                entry.last_update = now;
                Ok(())
            }
            None if status == DeliveryStatus::Admitted => {
                entries.insert(
                    id,
                    Entry {
                        history: vec![Transition {
                            status,
                            at: Utc::now(),
                        }],
                        last_update: now,
                    },
                );
                Ok(())
            }
            None => Err(TransitionError {
                from: DeliveryStatus::Admitted,
                to: status,
            }),
        }
    }

    /// Records the same status for many ids. Returns the refused transitions.
    pub fn record_all<I>(&self, ids: I, status: &DeliveryStatus) -> Vec<TransitionError>
    where
        I: IntoIterator<Item = RecordId>,
    {
        ids.into_iter()
            .filter_map(|id| self.record(id, status.clone()).err())
            .collect()
    }

    /// Current status of `id`, or `None` when it was never seen or has been evicted.
    #[must_use]
    pub fn lookup(&self, id: &RecordId) -> Option<DeliveryStatus> {
        self.lock().get(id).and_then(|e| e.current().cloned())
    }

    /// Full transition history of `id`, oldest first.
    #[must_use]
    pub fn history(&self, id: &RecordId) -> Option<Vec<Transition>> {
        self.lock().get(id).map(|e| e.history.clone())
    }

    /// Drops an id whose admission was refused after it was registered.
    pub fn discard(&self, id: &RecordId) {
        self.lock().remove(id);
    }

    /// Evicts terminal entries whose last transition happened more than `ttl` before `now`.
    /// Returns the number of evicted entries.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let terminal = entry.current().is_some_and(DeliveryStatus::is_terminal);
            !(terminal && now.saturating_duration_since(entry.last_update) > ttl)
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("TRACKER | Evicted {evicted} expired delivery entries");
        }
        evicted
    }

    /// Number of tracked ids whose current status equals `status`.
    #[must_use]
    pub fn count_with_status(&self, status: &DeliveryStatus) -> usize {
        self.lock()
            .values()
            .filter(|e| e.current() == Some(status))
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RecordId, Entry>> {
        // Entries are only ever pushed whole, so a poisoned map is still consistent.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
