// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record shapes shared by the validator, the writer and the search gateway.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier assigned at admission. Also used as the backend document key,
/// which makes re-issued writes idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Closed set of accepted severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Level {
    pub const ALL: [Level; 5] = [
        Level::Debug,
        Level::Info,
        Level::Warning,
        Level::Error,
        Level::Fatal,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warning => "WARNING",
            Level::Error => "ERROR",
            Level::Fatal => "FATAL",
        }
    }

    /// Case-insensitive lookup against the closed set.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Level> {
        let raw = raw.trim();
        Level::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as described by a caller, before validation.
///
/// `meta` is accepted as an alias of `metadata` and `timestamp` is kept as text so the
/// validator can report a bad value instead of the whole body failing to decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawLogRecord {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, alias = "meta")]
    pub metadata: Option<Map<String, Value>>,
}

/// One admitted log event. Immutable once built by the validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: RecordId,
    pub service: String,
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Process-wide admission order, the tie-break for identical timestamps.
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// Approximate encoded size, used to bound envelope bytes.
    #[serde(skip)]
    pub(crate) encoded_len: usize,
}

impl LogRecord {
    /// Approximate size of the record once encoded for the backend.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// Ordering used for every search result: newest first, then admission order.
    #[must_use]
    pub fn search_order(a: &LogRecord, b: &LogRecord) -> std::cmp::Ordering {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.sequence.cmp(&b.sequence))
    }
}

/// An ordered group of records collected for a single write attempt.
///
/// Bounded by both count and bytes. Records keep their dequeue (FIFO) order.
#[derive(Debug, Clone, Default)]
pub struct BatchEnvelope {
    records: Vec<LogRecord>,
    bytes: usize,
}

impl BatchEnvelope {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
            bytes: 0,
        }
    }

    /// Returns true when `record` can join without crossing either bound. An empty
    /// envelope always accepts, so oversized records still make progress.
    #[must_use]
    pub fn fits(&self, record: &LogRecord, max_count: usize, max_bytes: usize) -> bool {
        if self.records.is_empty() {
            return true;
        }
        self.records.len() < max_count && self.bytes + record.encoded_len() <= max_bytes
    }

    pub fn push(&mut self, record: LogRecord) {
        self.bytes += record.encoded_len();
        self.records.push(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[must_use]
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.records.iter().map(|r| r.id)
    }

    #[must_use]
    pub fn into_records(self) -> Vec<LogRecord> {
        self.records
    }
}
