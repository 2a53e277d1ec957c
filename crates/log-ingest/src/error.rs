// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::tracker::DeliveryStatus;

/// Bad input, rejected at admission and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("service must not be empty")]
    EmptyService,

    #[error("service is longer than {max} bytes")]
    ServiceTooLong { max: usize },

    #[error("message must not be empty")]
    EmptyMessage,

    #[error("message is larger than {max} bytes")]
    MessageTooLarge { max: usize },

    #[error("level '{0}' is not one of DEBUG, INFO, WARNING, ERROR, FATAL")]
    InvalidLevel(String),

    #[error("timestamp '{0}' is not a valid RFC 3339 or ISO-8601 date-time")]
    InvalidTimestamp(String),

    #[error("metadata nests deeper than {max} levels")]
    MetadataTooDeep { max: usize },

    #[error("metadata is larger than {max} bytes")]
    MetadataTooLarge { max: usize },
}

/// Outcome of a rejected admission, surfaced synchronously to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("ingestion queue is full")]
    QueueFull,

    #[error("ingestion is shutting down")]
    ShuttingDown,
}

impl AdmissionError {
    /// Name used on the wire for the rejection kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::Validation(_) => "ValidationError",
            AdmissionError::QueueFull => "QueueFull",
            AdmissionError::ShuttingDown => "ShuttingDown",
        }
    }
}

/// Failures reported by a storage backend for a whole request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend request timed out after {0} ms")]
    Timeout(u128),

    #[error("backend rejected request: {0}")]
    Rejected(String),

    #[error("backend returned a malformed response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Transient failures are retried by the writer, the others fail the envelope at once.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Timeout(_))
    }
}

/// Attempt to move a delivery backwards or sideways in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal delivery transition {from} -> {to}")]
pub struct TransitionError {
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to initialize storage backend: {0}")]
    Initialization(#[source] BackendError),

    #[error("Pipeline already started")]
    AlreadyStarted,

    #[error("Pipeline not initialized")]
    NotInitialized,

    #[error("Pipeline not running")]
    NotRunning,
}
