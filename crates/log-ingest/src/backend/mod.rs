// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Storage backend capability consumed by the writer and the search gateway.
//!
//! - **[`elasticsearch`]**: HTTP client for an Elasticsearch index
//! - **[`memory`]**: process-local store with the same ordering rules

use async_trait::async_trait;

use crate::error::BackendError;
use crate::record::{LogRecord, RecordId};

pub mod elasticsearch;
pub mod memory;

/// Per-record result of a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(RecordId),
    Rejected { id: RecordId, reason: String },
}

impl WriteOutcome {
    #[must_use]
    pub fn id(&self) -> RecordId {
        match self {
            WriteOutcome::Written(id) | WriteOutcome::Rejected { id, .. } => *id,
        }
    }
}

/// Filter and size of a search. Results are always ordered by timestamp
/// descending, then by admission sequence ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// Text matched against `message`; `None` matches everything.
    pub text: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    /// Number of matching records, independent of `limit`.
    pub total: u64,
    pub records: Vec<LogRecord>,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Creates the index if missing. Must be idempotent.
    async fn ensure_index(&self) -> Result<(), BackendError>;

    /// Writes `records` keyed by their id, so a repeated write overwrites identically.
    ///
    /// `Err` means the whole request failed and nothing can be assumed written.
    /// `Ok` carries one outcome per record.
    async fn bulk_write(&self, records: &[LogRecord]) -> Result<Vec<WriteOutcome>, BackendError>;

    async fn query(&self, query: &SearchQuery) -> Result<SearchPage, BackendError>;

    /// Highest admission `sequence` already stored, used to resume numbering after a restart.
    /// Backends that cannot tell report `None`.
    async fn max_sequence(&self) -> Result<Option<u64>, BackendError> {
        Ok(None)
    }
}
