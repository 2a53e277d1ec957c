// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use log_ingest::pipeline::{IngestPipeline, PipelineConfig};
use log_ingest::queue::BatchLimits;
use log_ingest::record::{RawLogRecord, RecordId};
use log_ingest::tracker::DeliveryStatus;
use log_ingest::writer::{RetryPolicy, WriterConfig};
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;

/// Pipeline settings with short waits and backoff so tests finish quickly.
pub fn fast_config(queue_capacity: usize, max_attempts: u32) -> PipelineConfig {
    PipelineConfig {
        queue_capacity,
        workers: 2,
        writer: WriterConfig {
            limits: BatchLimits {
                max_count: 50,
                max_bytes: 1024 * 1024,
            },
            max_wait: Duration::from_millis(10),
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            commit_timeout: Duration::from_secs(2),
        },
        ..PipelineConfig::default()
    }
}

pub fn raw_record(service: &str, level: &str, message: &str, timestamp: Option<&str>) -> RawLogRecord {
    RawLogRecord {
        service: service.to_string(),
        level: level.to_string(),
        message: message.to_string(),
        timestamp: timestamp.map(str::to_string),
        metadata: None,
    }
}

/// Polls until every id has reached a terminal status or `limit` elapses.
pub async fn wait_for_terminal(pipeline: &IngestPipeline, ids: &[RecordId], limit: Duration) {
    let _ = timeout(limit, async {
        loop {
            let done = ids.iter().all(|id| {
                pipeline
                    .status(id)
                    .is_some_and(|status| status.is_terminal())
            });
            if done {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

pub fn statuses(pipeline: &IngestPipeline, ids: &[RecordId]) -> Vec<Option<DeliveryStatus>> {
    ids.iter().map(|id| pipeline.status(id)).collect()
}

/// Send an HTTP request over TCP and return the response
pub async fn send_tcp_request(
    port: u16,
    uri: &str,
    method: &str,
    body: Option<Vec<u8>>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(format!("127.0.0.1:{port}")),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Content-Type", "application/json");

    let request = match body {
        Some(body_data) => {
            request_builder = request_builder.header("Content-Length", body_data.len().to_string());
            request_builder.body(Full::new(Bytes::from(body_data)))?
        }
        None => request_builder.body(Full::new(Bytes::new()))?,
    };

    Ok(timeout(Duration::from_secs(2), sender.send_request(request)).await??)
}

pub async fn response_json(response: Response<hyper::body::Incoming>) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read response body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("Response body is not JSON")
}
