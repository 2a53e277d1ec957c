// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-through search over the storage backend. No caching.

use std::sync::Arc;
use tracing::debug;

use crate::backend::{SearchPage, SearchQuery, StorageBackend};
use crate::error::BackendError;

pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const DEFAULT_SEARCH_MAX_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct SearchGateway {
    backend: Arc<dyn StorageBackend>,
    max_limit: usize,
}

impl std::fmt::Debug for SearchGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchGateway")
            .field("max_limit", &self.max_limit)
            .finish_non_exhaustive()
    }
}

impl SearchGateway {
    #[must_use]
    pub fn new(backend: Arc<dyn StorageBackend>, max_limit: usize) -> Self {
        Self {
            backend,
            max_limit: max_limit.max(1),
        }
    }

    /// Most recent records first, ties in admission order. Blank `text` is the
    /// same as no text. `limit` is clamped to `1..=max_limit`.
    pub async fn search(&self, text: Option<&str>, limit: usize) -> Result<SearchPage, BackendError> {
        let query = SearchQuery {
            text: text
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            limit: limit.clamp(1, self.max_limit),
        };
        let page = self.backend.query(&query).await?;
        debug!(
            total = page.total,
            returned = page.records.len(),
            "SEARCH | Query {:?} served",
            query.text
        );
        Ok(page)
    }
}
