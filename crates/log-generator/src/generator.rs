// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synthetic log records and the loop that posts them to the ingestion server.

use chrono::Utc;
use reqwest::StatusCode;
use serde::Serialize;
use std::env;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8000/logs";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const SERVICES: [&str; 4] = [
    "auth-service",
    "payment-service",
    "mail-service",
    "gateway-service",
];
pub const LEVELS: [&str; 3] = ["INFO", "WARNING", "ERROR"];
pub const DEVICES: [&str; 4] = ["android", "ios", "windows", "linux"];

#[must_use]
pub fn messages_for(level: &str) -> &'static [&'static str] {
    match level {
        "INFO" => &[
            "Operation completed successfully",
            "Background task executed",
            "User navigation recorded",
            "Status check ok",
        ],
        "WARNING" => &[
            "User reached rate limit",
            "Slow response detected",
            "Retrying external API",
        ],
        "ERROR" => &[
            "Login failed for user",
            "Database connection lost",
            "Payment processing error",
            "External API timeout",
            "Unexpected server exception",
        ],
        _ => &[],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorConfig {
    pub backend_url: String,
    pub interval: Duration,
    /// Stop after this many records. Runs until interrupted when `None`.
    pub count: Option<u64>,
    pub log_level: String,
}

impl GeneratorConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            backend_url: env::var("BACKEND_URL").unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_string()),
            interval: env::var("INTERVAL")
                .ok()
                .and_then(|val| val.trim().parse::<u64>().ok())
                .map_or(DEFAULT_INTERVAL, Duration::from_secs),
            count: env::var("GENERATOR_COUNT")
                .ok()
                .and_then(|val| val.trim().parse::<u64>().ok()),
            log_level: env::var("GENERATOR_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or_else(|_| "info".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub user_id: u32,
    pub ip: String,
    pub device: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeneratedLog {
    pub service: &'static str,
    pub level: &'static str,
    pub message: &'static str,
    /// Naive UTC ISO-8601 with microseconds.
    pub timestamp: String,
    pub meta: Meta,
}

fn pick<T: Copy>(rng: &mut fastrand::Rng, items: &[T]) -> Option<T> {
    (!items.is_empty()).then(|| items[rng.usize(..items.len())])
}

/// Builds one random record. Always `Some` with the built-in catalog.
pub fn generate_log(rng: &mut fastrand::Rng) -> Option<GeneratedLog> {
    let level = pick(rng, &LEVELS)?;
    Some(GeneratedLog {
        service: pick(rng, &SERVICES)?,
        level,
        message: pick(rng, messages_for(level))?,
        timestamp: Utc::now()
            .naive_utc()
            .format("%Y-%m-%dT%H:%M:%S%.6f")
            .to_string(),
        meta: Meta {
            user_id: rng.u32(1..=9999),
            ip: format!("192.168.1.{}", rng.u8(2..=254)),
            device: pick(rng, &DEVICES)?,
        },
    })
}

#[derive(Debug, Clone)]
pub struct LogSender {
    client: reqwest::Client,
    url: String,
}

impl LogSender {
    pub fn new(url: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, url })
    }

    pub async fn send(&self, log: &GeneratedLog) -> Result<StatusCode, reqwest::Error> {
        let response = self.client.post(&self.url).json(log).send().await?;
        Ok(response.status())
    }
}

/// Posts one record every `interval` until `cancel` fires or `count` records were sent.
/// Returns the number of records attempted.
pub async fn run(
    sender: &LogSender,
    config: &GeneratorConfig,
    cancel: &CancellationToken,
    rng: &mut fastrand::Rng,
) -> u64 {
    let mut attempted = 0;
    while config.count.map_or(true, |count| attempted < count) {
        if cancel.is_cancelled() {
            break;
        }
        let Some(log) = generate_log(rng) else { break };
        attempted += 1;
        match sender.send(&log).await {
            Ok(status) if status == StatusCode::SERVICE_UNAVAILABLE => {
                warn!(
                    "GENERATOR | Backpressure: {} - {} - {} -> {status}",
                    log.level, log.service, log.message
                );
            }
            Ok(status) => {
                info!(
                    "GENERATOR | Sent {} - {} - {} -> {status}",
                    log.level, log.service, log.message
                );
            }
            Err(e) => error!("GENERATOR | Failed to send log: {e}"),
        }

        if config.count.is_some_and(|count| attempted >= count) {
            break;
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(config.interval) => {}
        }
    }
    attempted
}
