// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Normalizes and validates caller-supplied records before admission.
//!
//! Validation does no I/O: the only inputs are the raw record, the admission
//! sequence number and the clock reading used for a missing timestamp.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::record::{Level, LogRecord, RawLogRecord, RecordId};

pub const DEFAULT_MAX_SERVICE_BYTES: usize = 128;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_METADATA_DEPTH: usize = 8;
pub const DEFAULT_MAX_METADATA_BYTES: usize = 16 * 1024;

/// Fixed per-record overhead added to the field sizes when estimating encoded length.
const RECORD_OVERHEAD_BYTES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorLimits {
    pub max_service_bytes: usize,
    pub max_message_bytes: usize,
    pub max_metadata_depth: usize,
    pub max_metadata_bytes: usize,
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        Self {
            max_service_bytes: DEFAULT_MAX_SERVICE_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_metadata_depth: DEFAULT_MAX_METADATA_DEPTH,
            max_metadata_bytes: DEFAULT_MAX_METADATA_BYTES,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Validator {
    limits: ValidatorLimits,
}

impl Validator {
    #[must_use]
    pub fn new(limits: ValidatorLimits) -> Self {
        Self { limits }
    }

    #[must_use]
    pub fn limits(&self) -> &ValidatorLimits {
        &self.limits
    }

    /// Validates `raw`, defaulting a missing timestamp to the current time.
    pub fn validate(&self, raw: RawLogRecord, sequence: u64) -> Result<LogRecord, ValidationError> {
        self.validate_at(raw, sequence, Utc::now())
    }

    /// Same as [`Validator::validate`] with an explicit admission time.
    pub fn validate_at(
        &self,
        raw: RawLogRecord,
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<LogRecord, ValidationError> {
        let service = raw.service.trim().to_string();
        if service.is_empty() {
            return Err(ValidationError::EmptyService);
        }
        if service.len() > self.limits.max_service_bytes {
            return Err(ValidationError::ServiceTooLong {
                max: self.limits.max_service_bytes,
            });
        }

        if raw.message.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        if raw.message.len() > self.limits.max_message_bytes {
            return Err(ValidationError::MessageTooLarge {
                max: self.limits.max_message_bytes,
            });
        }

        let level =
            Level::parse(&raw.level).ok_or_else(|| ValidationError::InvalidLevel(raw.level.clone()))?;

        let timestamp = match raw.timestamp.as_deref().map(str::trim) {
            None | Some("") => now,
            Some(text) => parse_timestamp(text)
                .ok_or_else(|| ValidationError::InvalidTimestamp(text.to_string()))?,
        };

        let metadata_bytes = match &raw.metadata {
            Some(metadata) => self.check_metadata(metadata)?,
            None => 0,
        };

        let encoded_len =
            RECORD_OVERHEAD_BYTES + service.len() + raw.message.len() + metadata_bytes;

        Ok(LogRecord {
            id: RecordId::new_random(),
            service,
            level,
            message: raw.message,
            timestamp,
            sequence,
            metadata: raw.metadata,
            encoded_len,
        })
    }

    fn check_metadata(&self, metadata: &Map<String, Value>) -> Result<usize, ValidationError> {
        // The map itself is one level.
        if 1 + max_depth_of_map(metadata) > self.limits.max_metadata_depth {
            return Err(ValidationError::MetadataTooDeep {
                max: self.limits.max_metadata_depth,
            });
        }
        let bytes = serde_json::to_vec(metadata)
            .map(|encoded| encoded.len())
            .unwrap_or(usize::MAX);
        if bytes > self.limits.max_metadata_bytes {
            return Err(ValidationError::MetadataTooLarge {
                max: self.limits.max_metadata_bytes,
            });
        }
        Ok(bytes)
    }
}

/// Accepts RFC 3339 and naive ISO-8601 date-times. Naive values are taken as UTC.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .map(|naive| naive.and_utc())
}

fn max_depth_of_map(map: &Map<String, Value>) -> usize {
    map.values().map(depth_of).max().unwrap_or(0)
}

fn depth_of(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + max_depth_of_map(map),
        Value::Array(items) => 1 + items.iter().map(depth_of).max().unwrap_or(0),
        _ => 0,
    }
}
