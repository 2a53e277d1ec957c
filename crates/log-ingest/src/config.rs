// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::backend::elasticsearch::ElasticsearchConfig;
use crate::error::ConfigError;
use crate::health::{DEFAULT_HEALTH_WINDOW, DEFAULT_MIN_SUCCESS_RATIO};
use crate::pipeline::{
    PipelineConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_SHUTDOWN_GRACE, DEFAULT_WORKERS,
};
use crate::queue::BatchLimits;
use crate::search::DEFAULT_SEARCH_MAX_LIMIT;
use crate::server::DEFAULT_MAX_REQUEST_BYTES;
use crate::tracker::DEFAULT_STATUS_TTL;
use crate::validator::{
    ValidatorLimits, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_METADATA_BYTES,
    DEFAULT_MAX_METADATA_DEPTH, DEFAULT_MAX_SERVICE_BYTES,
};
use crate::writer::{
    RetryPolicy, WriterConfig, DEFAULT_BASE_DELAY, DEFAULT_BATCH_MAX_BYTES,
    DEFAULT_BATCH_MAX_RECORDS, DEFAULT_BATCH_MAX_WAIT, DEFAULT_COMMIT_TIMEOUT,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
};

const DEFAULT_ADDR: &str = "0.0.0.0:8000";
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Which storage backend the server writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Elasticsearch,
    Memory,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "elasticsearch" | "elastic" => Ok(BackendKind::Elasticsearch),
            "memory" | "in-memory" => Ok(BackendKind::Memory),
            other => Err(ConfigError::Invalid(format!(
                "Unknown backend '{other}'. Must be one of: elasticsearch, memory"
            ))),
        }
    }
}

/// Server configuration, read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub backend: BackendKind,
    pub elastic_scheme: String,
    pub elastic_host: String,
    pub elastic_port: u16,
    pub index: String,
    pub elastic_timeout: Duration,
    pub elastic_refresh: bool,
    pub queue_capacity: usize,
    pub workers: usize,
    pub batch_max_records: usize,
    pub batch_max_bytes: usize,
    pub batch_max_wait: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub commit_timeout: Duration,
    pub status_ttl: Duration,
    pub shutdown_grace: Duration,
    pub metadata_max_depth: usize,
    pub metadata_max_bytes: usize,
    pub message_max_bytes: usize,
    pub max_request_bytes: usize,
    pub search_max_limit: usize,
    pub health_window: usize,
    pub health_min_success_ratio: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            log_level: "info".to_string(),
            backend: BackendKind::Elasticsearch,
            elastic_scheme: "http".to_string(),
            elastic_host: "elasticsearch".to_string(),
            elastic_port: 9200,
            index: "logs-0001".to_string(),
            elastic_timeout: Duration::from_secs(10),
            elastic_refresh: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            workers: DEFAULT_WORKERS,
            batch_max_records: DEFAULT_BATCH_MAX_RECORDS,
            batch_max_bytes: DEFAULT_BATCH_MAX_BYTES,
            batch_max_wait: DEFAULT_BATCH_MAX_WAIT,
            retry_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: DEFAULT_BASE_DELAY,
            retry_max_delay: DEFAULT_MAX_DELAY,
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            status_ttl: DEFAULT_STATUS_TTL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            metadata_max_depth: DEFAULT_MAX_METADATA_DEPTH,
            metadata_max_bytes: DEFAULT_MAX_METADATA_BYTES,
            message_max_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            search_max_limit: DEFAULT_SEARCH_MAX_LIMIT,
            health_window: DEFAULT_HEALTH_WINDOW,
            health_min_success_ratio: DEFAULT_MIN_SUCCESS_RATIO,
        }
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn millis_or(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

fn secs_or(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

impl Config {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let addr = env::var("LOG_INGEST_ADDR")
            .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("LOG_INGEST_ADDR: {e}")))?;
        let log_level = env::var("LOG_INGEST_LOG_LEVEL")
            .map(|val| val.trim().to_lowercase())
            .unwrap_or(defaults.log_level);
        let backend = match env::var("LOG_INGEST_BACKEND") {
            Ok(val) => val.parse::<BackendKind>()?,
            Err(_) => defaults.backend,
        };
        let elastic_refresh = env::var("ELASTIC_REFRESH")
            .map(|val| matches!(val.trim().to_lowercase().as_str(), "true" | "1" | "wait_for"))
            .unwrap_or(defaults.elastic_refresh);

        let config = Self {
            addr,
            log_level,
            backend,
            elastic_scheme: env::var("ELASTIC_SCHEME").unwrap_or(defaults.elastic_scheme),
            elastic_host: env::var("ELASTIC_HOST").unwrap_or(defaults.elastic_host),
            elastic_port: parse_or("ELASTIC_PORT", defaults.elastic_port),
            index: env::var("LOG_INDEX").unwrap_or(defaults.index),
            elastic_timeout: secs_or("ELASTIC_TIMEOUT_SECS", defaults.elastic_timeout),
            elastic_refresh,
            queue_capacity: parse_or("LOG_INGEST_QUEUE_CAPACITY", defaults.queue_capacity),
            workers: parse_or("LOG_INGEST_WORKERS", defaults.workers),
            batch_max_records: parse_or("LOG_INGEST_BATCH_MAX_RECORDS", defaults.batch_max_records),
            batch_max_bytes: parse_or("LOG_INGEST_BATCH_MAX_BYTES", defaults.batch_max_bytes),
            batch_max_wait: millis_or("LOG_INGEST_BATCH_MAX_WAIT_MS", defaults.batch_max_wait),
            retry_max_attempts: parse_or(
                "LOG_INGEST_RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts,
            ),
            retry_base_delay: millis_or("LOG_INGEST_RETRY_BASE_DELAY_MS", defaults.retry_base_delay),
            retry_max_delay: millis_or("LOG_INGEST_RETRY_MAX_DELAY_MS", defaults.retry_max_delay),
            commit_timeout: secs_or("LOG_INGEST_COMMIT_TIMEOUT_SECS", defaults.commit_timeout),
            status_ttl: secs_or("LOG_INGEST_STATUS_TTL_SECS", defaults.status_ttl),
            shutdown_grace: secs_or("LOG_INGEST_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace),
            metadata_max_depth: parse_or(
                "LOG_INGEST_METADATA_MAX_DEPTH",
                defaults.metadata_max_depth,
            ),
            metadata_max_bytes: parse_or(
                "LOG_INGEST_METADATA_MAX_BYTES",
                defaults.metadata_max_bytes,
            ),
            message_max_bytes: parse_or("LOG_INGEST_MESSAGE_MAX_BYTES", defaults.message_max_bytes),
            max_request_bytes: parse_or("LOG_INGEST_MAX_REQUEST_BYTES", defaults.max_request_bytes),
            search_max_limit: parse_or("LOG_INGEST_SEARCH_MAX_LIMIT", defaults.search_max_limit),
            health_window: parse_or("LOG_INGEST_HEALTH_WINDOW", defaults.health_window),
            health_min_success_ratio: parse_or(
                "LOG_INGEST_HEALTH_MIN_SUCCESS_RATIO",
                defaults.health_min_success_ratio,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.backend == BackendKind::Elasticsearch {
            if !matches!(self.elastic_scheme.as_str(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "ELASTIC_SCHEME must be http or https, got '{}'",
                    self.elastic_scheme
                )));
            }
            if self.elastic_host.trim().is_empty() {
                return Err(ConfigError::Invalid("ELASTIC_HOST cannot be empty".to_string()));
            }
            if self.elastic_port == 0 {
                return Err(ConfigError::Invalid(
                    "ELASTIC_PORT must be greater than 0".to_string(),
                ));
            }
            if self.index.trim().is_empty() || self.index.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "LOG_INDEX '{}' is not a valid index name",
                    self.index
                )));
            }
        }

        for (name, value) in [
            ("LOG_INGEST_QUEUE_CAPACITY", self.queue_capacity),
            ("LOG_INGEST_WORKERS", self.workers),
            ("LOG_INGEST_BATCH_MAX_RECORDS", self.batch_max_records),
            ("LOG_INGEST_BATCH_MAX_BYTES", self.batch_max_bytes),
            ("LOG_INGEST_MAX_REQUEST_BYTES", self.max_request_bytes),
            ("LOG_INGEST_SEARCH_MAX_LIMIT", self.search_max_limit),
            ("LOG_INGEST_HEALTH_WINDOW", self.health_window),
            ("LOG_INGEST_MESSAGE_MAX_BYTES", self.message_max_bytes),
            ("LOG_INGEST_METADATA_MAX_DEPTH", self.metadata_max_depth),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.retry_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "LOG_INGEST_RETRY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::Invalid(
                "LOG_INGEST_RETRY_BASE_DELAY_MS cannot exceed LOG_INGEST_RETRY_MAX_DELAY_MS"
                    .to_string(),
            ));
        }
        if self.commit_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "LOG_INGEST_COMMIT_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health_min_success_ratio) {
            return Err(ConfigError::Invalid(format!(
                "LOG_INGEST_HEALTH_MIN_SUCCESS_RATIO must be within 0.0..=1.0, got {}",
                self.health_min_success_ratio
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn elasticsearch(&self) -> ElasticsearchConfig {
        ElasticsearchConfig {
            url: format!(
                "{}://{}:{}",
                self.elastic_scheme, self.elastic_host, self.elastic_port
            ),
            index: self.index.clone(),
            timeout: self.elastic_timeout,
            refresh: self.elastic_refresh,
        }
    }

    #[must_use]
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.queue_capacity,
            workers: self.workers,
            writer: WriterConfig {
                limits: BatchLimits {
                    max_count: self.batch_max_records,
                    max_bytes: self.batch_max_bytes,
                },
                max_wait: self.batch_max_wait,
                retry: RetryPolicy {
                    max_attempts: self.retry_max_attempts,
                    base_delay: self.retry_base_delay,
                    max_delay: self.retry_max_delay,
                    jitter: true,
                },
                commit_timeout: self.commit_timeout,
            },
            validator: ValidatorLimits {
                max_service_bytes: DEFAULT_MAX_SERVICE_BYTES,
                max_message_bytes: self.message_max_bytes,
                max_metadata_depth: self.metadata_max_depth,
                max_metadata_bytes: self.metadata_max_bytes,
            },
            status_ttl: self.status_ttl,
            health_window: self.health_window,
            health_min_success_ratio: self.health_min_success_ratio,
            search_max_limit: self.search_max_limit,
        }
    }
}
