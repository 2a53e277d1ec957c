// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::debug;

use crate::backend::{SearchPage, SearchQuery, StorageBackend, WriteOutcome};
use crate::error::BackendError;
use crate::record::{LogRecord, RecordId};

/// Process-local backend. Message matching is a case-insensitive substring test.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    documents: RwLock<HashMap<RecordId, LogRecord>>,
    index_created: AtomicBool,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, id: &RecordId) -> Option<LogRecord> {
        self.read().get(id).cloned()
    }

    #[must_use]
    pub fn index_created(&self) -> bool {
        self.index_created.load(Ordering::Acquire)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<RecordId, LogRecord>> {
        self.documents
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn ensure_index(&self) -> Result<(), BackendError> {
        if !self.index_created.swap(true, Ordering::AcqRel) {
            debug!("MEMORY | Created in-memory index");
        }
        Ok(())
    }

    async fn bulk_write(&self, records: &[LogRecord]) -> Result<Vec<WriteOutcome>, BackendError> {
        let mut documents = self
            .documents
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(records
            .iter()
            .map(|record| {
                documents.insert(record.id, record.clone());
                WriteOutcome::Written(record.id)
            })
            .collect())
    }

    async fn query(&self, query: &SearchQuery) -> Result<SearchPage, BackendError> {
        let needle = query
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);
        let documents = self.read();
        let mut matches: Vec<&LogRecord> = documents
            .values()
            .filter(|record| match &needle {
                Some(needle) => record.message.to_lowercase().contains(needle.as_str()),
                None => true,
            })
            .collect();
        matches.sort_by(|a, b| LogRecord::search_order(a, b));

        Ok(SearchPage {
            total: matches.len() as u64,
            records: matches.into_iter().take(query.limit).cloned().collect(),
        })
    }

    async fn max_sequence(&self) -> Result<Option<u64>, BackendError> {
        Ok(self.read().values().map(|r| r.sequence).max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::record_at;

    #[tokio::test]
    async fn test_max_sequence_tracks_stored_records() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.max_sequence().await.unwrap(), None);
        backend
            .bulk_write(&[record_at("a", 10, 7), record_at("b", 10, 3)])
            .await
            .unwrap();
        assert_eq!(backend.max_sequence().await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_repeated_write_overwrites() {
        let backend = InMemoryBackend::new();
        let record = record_at("Database connection lost", 10, 0);
        backend.bulk_write(&[record.clone()]).await.unwrap();
        backend.bulk_write(&[record.clone()]).await.unwrap();
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.get(&record.id), Some(record));
    }

    #[tokio::test]
    async fn test_query_orders_and_limits() {
        let backend = InMemoryBackend::new();
        let a = record_at("a", 10, 0);
        let c = record_at("c", 10, 1);
        let b = record_at("b", 20, 2);
        backend.bulk_write(&[a, c, b]).await.unwrap();

        let page = backend
            .query(&SearchQuery {
                text: None,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        let messages: Vec<_> = page.records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_query_matches_message_case_insensitively() {
        let backend = InMemoryBackend::new();
        backend
            .bulk_write(&[
                record_at("External API timeout", 1, 0),
                record_at("Status check ok", 2, 1),
                record_at("Retrying external API", 3, 2),
            ])
            .await
            .unwrap();

        let page = backend
            .query(&SearchQuery {
                text: Some("EXTERNAL api".into()),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.records[0].message, "Retrying external API");
        assert_eq!(page.records[1].message, "External API timeout");
    }

    #[tokio::test]
    async fn test_ensure_index_is_idempotent() {
        let backend = InMemoryBackend::new();
        backend.ensure_index().await.unwrap();
        backend.ensure_index().await.unwrap();
        assert!(backend.index_created());
    }
}
