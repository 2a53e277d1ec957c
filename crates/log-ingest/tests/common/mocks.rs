// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Storage backend doubles with scripted failure behavior

use async_trait::async_trait;
use log_ingest::backend::memory::InMemoryBackend;
use log_ingest::backend::{SearchPage, SearchQuery, StorageBackend, WriteOutcome};
use log_ingest::error::BackendError;
use log_ingest::record::LogRecord;
use std::sync::atomic::{AtomicU32, Ordering};

fn unavailable() -> BackendError {
    BackendError::Unavailable("connection refused".to_string())
}

/// Fails the first `failures` bulk writes, then stores into an in-memory backend.
pub struct FlakyBackend {
    failures: u32,
    calls: AtomicU32,
    pub store: InMemoryBackend,
}

impl FlakyBackend {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            store: InMemoryBackend::new(),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for FlakyBackend {
    async fn ensure_index(&self) -> Result<(), BackendError> {
        self.store.ensure_index().await
    }

    async fn bulk_write(&self, records: &[LogRecord]) -> Result<Vec<WriteOutcome>, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(unavailable());
        }
        self.store.bulk_write(records).await
    }

    async fn query(&self, query: &SearchQuery) -> Result<SearchPage, BackendError> {
        self.store.query(query).await
    }
}

/// Backend whose writes and queries always fail as unreachable.
#[derive(Default)]
pub struct DownBackend {
    calls: AtomicU32,
    index_reachable: bool,
}

impl DownBackend {
    /// Unreachable from the start, index creation included.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index creation succeeds, then the backend goes away.
    pub fn after_initialization() -> Self {
        Self {
            calls: AtomicU32::new(0),
            index_reachable: true,
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for DownBackend {
    async fn ensure_index(&self) -> Result<(), BackendError> {
        if self.index_reachable {
            Ok(())
        } else {
            Err(unavailable())
        }
    }

    async fn bulk_write(&self, _records: &[LogRecord]) -> Result<Vec<WriteOutcome>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(unavailable())
    }

    async fn query(&self, _query: &SearchQuery) -> Result<SearchPage, BackendError> {
        Err(unavailable())
    }
}

/// Rejects every record whose message contains `needle`, stores the rest.
pub struct PartialRejectBackend {
    needle: String,
    pub store: InMemoryBackend,
}

impl PartialRejectBackend {
    pub fn new(needle: &str) -> Self {
        Self {
            needle: needle.to_string(),
            store: InMemoryBackend::new(),
        }
    }
}

#[async_trait]
impl StorageBackend for PartialRejectBackend {
    async fn ensure_index(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn bulk_write(&self, records: &[LogRecord]) -> Result<Vec<WriteOutcome>, BackendError> {
        let (rejected, accepted): (Vec<&LogRecord>, Vec<&LogRecord>) = records
            .iter()
            .partition(|r| r.message.contains(self.needle.as_str()));
        let accepted: Vec<LogRecord> = accepted.into_iter().cloned().collect();
        self.store.bulk_write(&accepted).await?;

        Ok(records
            .iter()
            .map(|r| {
                if rejected.iter().any(|x| x.id == r.id) {
                    WriteOutcome::Rejected {
                        id: r.id,
                        reason: "mapper_parsing_exception: failed to parse".to_string(),
                    }
                } else {
                    WriteOutcome::Written(r.id)
                }
            })
            .collect())
    }

    async fn query(&self, query: &SearchQuery) -> Result<SearchPage, BackendError> {
        self.store.query(query).await
    }
}

/// Accepts the index call, then never answers a bulk write.
#[derive(Default)]
pub struct HangingBackend {
    calls: AtomicU32,
}

impl HangingBackend {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for HangingBackend {
    async fn ensure_index(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn bulk_write(&self, _records: &[LogRecord]) -> Result<Vec<WriteOutcome>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }

    async fn query(&self, _query: &SearchQuery) -> Result<SearchPage, BackendError> {
        std::future::pending().await
    }
}
