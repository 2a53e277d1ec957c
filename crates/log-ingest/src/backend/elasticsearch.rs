// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Elasticsearch storage backend over the REST API.
//!
//! - `ensure_index`: `HEAD /{index}`, then `PUT /{index}` with the log mapping
//! - `bulk_write`: `POST /{index}/_bulk` with one `index` action per record, `_id` = record id
//! - `query`: `POST /{index}/_search`, `match_phrase` on `message` or `match_all`
//! - `max_sequence`: `POST /{index}/_search` with a `max` aggregation on `sequence`
//!
//! Connection errors, timeouts, 429 and 5xx responses are reported as transient;
//! other 4xx responses are permanent rejections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{SearchPage, SearchQuery, StorageBackend, WriteOutcome};
use crate::error::BackendError;
use crate::record::{Level, LogRecord, RecordId};

const INDEX_ALREADY_EXISTS: &str = "resource_already_exists_exception";
/// Per-record overhead used when re-estimating sizes of records read back.
const RECORD_OVERHEAD_BYTES: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticsearchConfig {
    /// Base URL, e.g. `http://elasticsearch:9200`.
    pub url: String,
    pub index: String,
    pub timeout: Duration,
    /// Ask for `refresh=wait_for` on bulk writes so records are searchable on return.
    pub refresh: bool,
}

#[derive(Debug, Clone)]
pub struct ElasticsearchBackend {
    client: reqwest::Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchBackend {
    pub fn new(config: ElasticsearchConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    #[must_use]
    pub fn index(&self) -> &str {
        &self.config.index
    }

    fn index_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            self.config.index
        )
    }

    fn transport_error(&self, e: &reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout(self.config.timeout.as_millis())
        } else {
            BackendError::Unavailable(e.to_string())
        }
    }

    async fn create_index(&self) -> Result<(), BackendError> {
        let mapping = json!({
            "mappings": {
                "properties": {
                    "id": {"type": "keyword"},
                    "service": {"type": "keyword"},
                    "level": {"type": "keyword"},
                    "message": {"type": "text"},
                    "timestamp": {"type": "date"},
                    "sequence": {"type": "long"},
                    "metadata": {"type": "object"}
                }
            }
        });
        let resp = self
            .client
            .put(self.index_url())
            .json(&mapping)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = resp.status();
        if status.is_success() {
            info!("ELASTIC | Created index {}", self.config.index);
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains(INDEX_ALREADY_EXISTS) {
            debug!("ELASTIC | Index {} created concurrently", self.config.index);
            return Ok(());
        }
        Err(status_error(status, &body))
    }
}

fn status_error(status: StatusCode, body: &str) -> BackendError {
    let detail = format!("{status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BackendError::Unavailable(detail)
    } else {
        BackendError::Rejected(detail)
    }
}

/// Document body stored under `_id = record.id`.
#[derive(Debug, Serialize)]
struct DocumentRef<'a> {
    id: RecordId,
    service: &'a str,
    level: Level,
    message: &'a str,
    timestamp: DateTime<Utc>,
    sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<&'a Map<String, Value>>,
}

impl<'a> From<&'a LogRecord> for DocumentRef<'a> {
    fn from(record: &'a LogRecord) -> Self {
        Self {
            id: record.id,
            service: &record.service,
            level: record.level,
            message: &record.message,
            timestamp: record.timestamp,
            sequence: record.sequence,
            metadata: record.metadata.as_ref(),
        }
    }
}

/// Stored document as read back. Tolerates documents written without `sequence`
/// and with the `meta` field name.
#[derive(Debug, Deserialize)]
struct StoredDocument {
    service: String,
    level: String,
    message: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    sequence: u64,
    #[serde(default, alias = "meta")]
    metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<BulkItemError>,
}

#[derive(Debug, Deserialize)]
struct BulkItemError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    total: SearchTotal,
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct MaxSequenceResponse {
    aggregations: MaxSequenceAggregations,
}

#[derive(Debug, Deserialize)]
struct MaxSequenceAggregations {
    max_sequence: MaxValue,
}

/// `value` is `null` when no document has a `sequence`.
#[derive(Debug, Deserialize)]
struct MaxValue {
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SearchTotal {
    value: u64,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source")]
    source: StoredDocument,
}

impl SearchHit {
    fn into_record(self) -> Result<LogRecord, BackendError> {
        let id: RecordId = self
            .id
            .parse()
            .map_err(|e| BackendError::Malformed(format!("document id '{}': {e}", self.id)))?;
        let doc = self.source;
        let level = Level::parse(&doc.level).ok_or_else(|| {
            BackendError::Malformed(format!("document {id} has unknown level '{}'", doc.level))
        })?;
        let encoded_len = RECORD_OVERHEAD_BYTES + doc.service.len() + doc.message.len();
        Ok(LogRecord {
            id,
            service: doc.service,
            level,
            message: doc.message,
            timestamp: doc.timestamp,
            sequence: doc.sequence,
            metadata: doc.metadata,
            encoded_len,
        })
    }
}

fn bulk_body(index: &str, records: &[LogRecord]) -> Result<String, BackendError> {
    let mut body = String::new();
    for record in records {
        let action = json!({"index": {"_index": index, "_id": record.id}});
        let document = serde_json::to_string(&DocumentRef::from(record))
            .map_err(|e| BackendError::Malformed(format!("failed to encode {}: {e}", record.id)))?;
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&document);
        body.push('\n');
    }
    Ok(body)
}

fn search_body(query: &SearchQuery) -> Value {
    let matcher = match query.text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(text) => json!({"match_phrase": {"message": text}}),
        None => json!({"match_all": {}}),
    };
    json!({
        "query": matcher,
        "size": query.limit,
        "track_total_hits": true,
        "sort": [
            {"timestamp": {"order": "desc"}},
            {"sequence": {"order": "asc", "unmapped_type": "long"}}
        ]
    })
}

#[async_trait]
impl StorageBackend for ElasticsearchBackend {
    async fn ensure_index(&self) -> Result<(), BackendError> {
        let resp = self
            .client
            .head(self.index_url())
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        match resp.status() {
            status if status.is_success() => {
                debug!("ELASTIC | Index {} already exists", self.config.index);
                Ok(())
            }
            StatusCode::NOT_FOUND => self.create_index().await,
            status => Err(status_error(status, "index existence check failed")),
        }
    }

    async fn bulk_write(&self, records: &[LogRecord]) -> Result<Vec<WriteOutcome>, BackendError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let body = bulk_body(&self.config.index, records)?;
        let mut url = format!("{}/_bulk", self.index_url());
        if self.config.refresh {
            url.push_str("?refresh=wait_for");
        }

        let resp = self
            .client
            .post(url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(&e))?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: BulkResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::Malformed(format!("bulk response: {e}")))?;
        if parsed.items.len() != records.len() {
            return Err(BackendError::Malformed(format!(
                "bulk response has {} items for {} records",
                parsed.items.len(),
                records.len()
            )));
        }

        let outcomes: Vec<WriteOutcome> = records
            .iter()
            .zip(parsed.items)
            .map(|(record, item)| {
                // Each item map holds a single entry keyed by the action name.
                let item = item.into_values().next();
                match item {
                    Some(item) if (200..300).contains(&item.status) => {
                        WriteOutcome::Written(record.id)
                    }
                    Some(item) => {
                        let reason = match item.error {
                            Some(error) => format!("{}: {}", error.kind, error.reason),
                            None => format!("status {}", item.status),
                        };
                        WriteOutcome::Rejected {
                            id: record.id,
                            reason,
                        }
                    }
                    None => WriteOutcome::Rejected {
                        id: record.id,
                        reason: "empty bulk item".to_string(),
                    },
                }
            })
            .collect();

        let rejected = outcomes
            .iter()
            .filter(|o| matches!(o, WriteOutcome::Rejected { .. }))
            .count();
        if rejected > 0 {
            warn!(
                "ELASTIC | Bulk write rejected {rejected} of {} records",
                records.len()
            );
        }
        Ok(outcomes)
    }

    async fn query(&self, query: &SearchQuery) -> Result<SearchPage, BackendError> {
        let resp = self
            .client
            .post(format!("{}/_search", self.index_url()))
            .json(&search_body(query))
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(&e))?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: SearchResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::Malformed(format!("search response: {e}")))?;
        let records = parsed
            .hits
            .hits
            .into_iter()
            .map(SearchHit::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SearchPage {
            total: parsed.hits.total.value,
            records,
        })
    }

    async fn max_sequence(&self) -> Result<Option<u64>, BackendError> {
        let body = json!({
            "size": 0,
            "aggs": {"max_sequence": {"max": {"field": "sequence"}}}
        });
        let resp = self
            .client
            .post(format!("{}/_search", self.index_url()))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(&e))?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        let parsed: MaxSequenceResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::Malformed(format!("max sequence response: {e}")))?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let max = parsed
            .aggregations
            .max_sequence
            .value
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64);
        Ok(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_support::record_at;
    use mockito::{Matcher, Server};

    fn backend_for(url: String) -> ElasticsearchBackend {
        ElasticsearchBackend::new(ElasticsearchConfig {
            url,
            index: "logs-test".to_string(),
            timeout: Duration::from_secs(2),
            refresh: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_index_creates_missing_index() {
        let mut server = Server::new_async().await;
        let head = server
            .mock("HEAD", "/logs-test")
            .with_status(404)
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/logs-test")
            .match_body(Matcher::PartialJson(json!({
                "mappings": {"properties": {"message": {"type": "text"}, "sequence": {"type": "long"}}}
            })))
            .with_status(200)
            .with_body(r#"{"acknowledged":true}"#)
            .create_async()
            .await;

        backend_for(server.url()).ensure_index().await.unwrap();
        head.assert_async().await;
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_index_skips_existing_index() {
        let mut server = Server::new_async().await;
        server
            .mock("HEAD", "/logs-test")
            .with_status(200)
            .create_async()
            .await;
        let put = server
            .mock("PUT", "/logs-test")
            .expect(0)
            .create_async()
            .await;

        backend_for(server.url()).ensure_index().await.unwrap();
        put.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_index_tolerates_concurrent_creation() {
        let mut server = Server::new_async().await;
        server
            .mock("HEAD", "/logs-test")
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("PUT", "/logs-test")
            .with_status(400)
            .with_body(r#"{"error":{"type":"resource_already_exists_exception"}}"#)
            .create_async()
            .await;

        assert!(backend_for(server.url()).ensure_index().await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_index_reports_failure() {
        let mut server = Server::new_async().await;
        server
            .mock("HEAD", "/logs-test")
            .with_status(503)
            .create_async()
            .await;

        let err = backend_for(server.url()).ensure_index().await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bulk_write_reports_per_record_rejections() {
        let mut server = Server::new_async().await;
        let ok = record_at("Login failed for user", 10, 0);
        let bad = record_at("Payment processing error", 11, 1);
        let body = json!({
            "errors": true,
            "items": [
                {"index": {"_id": ok.id.to_string(), "status": 201}},
                {"index": {"_id": bad.id.to_string(), "status": 400,
                    "error": {"type": "mapper_parsing_exception", "reason": "failed to parse field [metadata]"}}}
            ]
        });
        let mock = server
            .mock("POST", "/logs-test/_bulk")
            .match_header("content-type", "application/x-ndjson")
            .match_body(Matcher::Regex(format!("\"_id\":\"{}\"", ok.id)))
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let outcomes = backend_for(server.url())
            .bulk_write(&[ok.clone(), bad.clone()])
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(outcomes[0], WriteOutcome::Written(ok.id));
        assert_eq!(
            outcomes[1],
            WriteOutcome::Rejected {
                id: bad.id,
                reason: "mapper_parsing_exception: failed to parse field [metadata]".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_bulk_write_classifies_http_failures() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/logs-test/_bulk")
            .with_status(503)
            .with_body("unavailable")
            .create_async()
            .await;
        let err = backend_for(server.url())
            .bulk_write(&[record_at("m", 1, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));

        let mut server = Server::new_async().await;
        server
            .mock("POST", "/logs-test/_bulk")
            .with_status(400)
            .with_body("bad request")
            .create_async()
            .await;
        let err = backend_for(server.url())
            .bulk_write(&[record_at("m", 1, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_bulk_write_unreachable_backend_is_retryable() {
        let err = backend_for("http://127.0.0.1:1".to_string())
            .bulk_write(&[record_at("m", 1, 0)])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_query_sends_match_and_parses_hits() {
        let mut server = Server::new_async().await;
        let id = RecordId::new_random();
        let response = json!({
            "hits": {
                "total": {"value": 7, "relation": "eq"},
                "hits": [{
                    "_id": id.to_string(),
                    "_source": {
                        "service": "gateway-service",
                        "level": "WARNING",
                        "message": "Slow response detected",
                        "timestamp": "2024-05-01T12:00:00Z",
                        "meta": {"device": "linux"}
                    }
                }]
            }
        });
        let mock = server
            .mock("POST", "/logs-test/_search")
            .match_body(Matcher::PartialJson(json!({
                "query": {"match_phrase": {"message": "slow"}},
                "size": 5,
                "track_total_hits": true
            })))
            .with_status(200)
            .with_body(response.to_string())
            .create_async()
            .await;

        let page = backend_for(server.url())
            .query(&SearchQuery {
                text: Some("slow".into()),
                limit: 5,
            })
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(page.total, 7);
        let record = &page.records[0];
        assert_eq!(record.id, id);
        assert_eq!(record.level, Level::Warning);
        assert_eq!(record.sequence, 0);
        assert_eq!(record.metadata.as_ref().unwrap()["device"], "linux");
    }

    #[test]
    fn test_search_body_matches_text_as_phrase() {
        let body = search_body(&SearchQuery {
            text: Some(" payment processing ".into()),
            limit: 20,
        });
        assert_eq!(
            body["query"],
            json!({"match_phrase": {"message": "payment processing"}})
        );
    }

    #[tokio::test]
    async fn test_max_sequence_reads_aggregation() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/logs-test/_search")
            .match_body(Matcher::PartialJson(json!({
                "size": 0,
                "aggs": {"max_sequence": {"max": {"field": "sequence"}}}
            })))
            .with_status(200)
            .with_body(r#"{"hits":{"total":{"value":3},"hits":[]},"aggregations":{"max_sequence":{"value":41.0}}}"#)
            .create_async()
            .await;

        let max = backend_for(server.url()).max_sequence().await.unwrap();
        mock.assert_async().await;
        assert_eq!(max, Some(41));
    }

    #[tokio::test]
    async fn test_max_sequence_of_empty_index_is_none() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/logs-test/_search")
            .with_status(200)
            .with_body(r#"{"aggregations":{"max_sequence":{"value":null}}}"#)
            .create_async()
            .await;

        assert_eq!(backend_for(server.url()).max_sequence().await.unwrap(), None);
    }

    #[test]
    fn test_search_body_without_text_matches_all() {
        let body = search_body(&SearchQuery {
            text: Some("   ".into()),
            limit: 20,
        });
        assert_eq!(body["query"], json!({"match_all": {}}));
        assert_eq!(body["sort"][0]["timestamp"]["order"], "desc");
        assert_eq!(body["sort"][1]["sequence"]["order"], "asc");
    }
}
