// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP surface of the pipeline.
//!
//! | Route                      | Success                         | Failure                         |
//! |----------------------------|---------------------------------|---------------------------------|
//! | `POST /logs`               | 202 `{id, status: "queued"}`    | 400 invalid, 503 busy/stopping  |
//! | `GET /logs/{id}/status`    | 200 `{id, status, reason, ...}` | 404 `{id, status: "unknown"}`   |
//! | `GET /logs/search`         | 200 `{total, hits}`             | 503 backend unavailable         |
//! | `GET /health`              | 200 `{status: "ok", ...}`       | 503 `{status: "error", ...}`    |

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{http, service::service_fn, Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::AdmissionError;
use crate::http_utils::{
    json_response, log_and_create_http_response, verify_request_content_length,
    with_retry_after, HttpResponse,
};
use crate::pipeline::IngestPipeline;
use crate::record::{LogRecord, RawLogRecord, RecordId};
use crate::search::DEFAULT_SEARCH_LIMIT;
use crate::tracker::{DeliveryStatus, FailureReason, Transition};

pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;

const LOGS_PATH: &str = "/logs";
const SEARCH_PATH: &str = "/logs/search";
const HEALTH_PATH: &str = "/health";
const RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct TransitionView<'a> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a FailureReason>,
    at: DateTime<Utc>,
}

impl<'a> From<&'a Transition> for TransitionView<'a> {
    fn from(transition: &'a Transition) -> Self {
        Self {
            status: transition.status.name(),
            reason: failure_reason(&transition.status),
            at: transition.at,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusView<'a> {
    id: RecordId,
    status: &'static str,
    reason: Option<&'a FailureReason>,
    history: Vec<TransitionView<'a>>,
}

#[derive(Debug, Serialize)]
struct SearchView<'a> {
    total: u64,
    hits: &'a [LogRecord],
}

fn failure_reason(status: &DeliveryStatus) -> Option<&FailureReason> {
    match status {
        DeliveryStatus::Failed(reason) => Some(reason),
        _ => None,
    }
}

fn rejection(error: &AdmissionError) -> http::Result<HttpResponse> {
    let body = json!({
        "status": "rejected",
        "error": error.kind(),
        "message": error.to_string(),
    });
    match error {
        AdmissionError::Validation(_) => json_response(StatusCode::BAD_REQUEST, &body),
        AdmissionError::QueueFull | AdmissionError::ShuttingDown => with_retry_after(
            json_response(StatusCode::SERVICE_UNAVAILABLE, &body),
            RETRY_AFTER_SECS,
        ),
    }
}

/// Extracts the id from `/logs/{id}/status`.
fn status_path(path: &str) -> Option<&str> {
    path.strip_prefix("/logs/")
        .and_then(|rest| rest.strip_suffix("/status"))
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

#[derive(Debug)]
pub struct LogServer {
    pipeline: Arc<IngestPipeline>,
    max_request_bytes: usize,
}

impl LogServer {
    #[must_use]
    pub fn new(pipeline: Arc<IngestPipeline>, max_request_bytes: usize) -> Self {
        Self {
            pipeline,
            max_request_bytes,
        }
    }

    /// Accepts connections on `listener` until `shutdown` is cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = JoinSet::new();
        info!("HTTP | Listening on {}", listener.local_addr()?);

        loop {
            let conn = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("HTTP | Server error: {e}");
                        return Err(e);
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("HTTP | Connection handler panicked: {e:?}");
                        continue;
                    }
                    Ok(()) | Err(_) => continue,
                },
            };

            let conn = TokioIo::new(conn);
            let server = server.clone();
            let handler = Arc::clone(&self);
            let service = service_fn(move |req| {
                let handler = Arc::clone(&handler);
                async move { handler.handle(req).await }
            });
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("HTTP | Connection error: {e}");
                }
            });
        }

        debug!("HTTP | Stopped accepting connections");
        joinset.shutdown().await;
        Ok(())
    }

    /// Routes one request.
    pub async fn handle<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_string();
        match (req.method(), path.as_str()) {
            (&Method::POST, LOGS_PATH) => self.ingest(req).await,
            (&Method::GET, SEARCH_PATH) => self.search(req.uri().query()).await,
            (&Method::GET, HEALTH_PATH) => self.health(),
            (&Method::GET, p) if status_path(p).is_some() => {
                self.status(status_path(p).unwrap_or_default())
            }
            (_, LOGS_PATH | SEARCH_PATH | HEALTH_PATH) => log_and_create_http_response(
                &format!("Method {} not allowed on {path}", req.method()),
                StatusCode::METHOD_NOT_ALLOWED,
            ),
            _ => log_and_create_http_response(
                &format!("No route for {path}"),
                StatusCode::NOT_FOUND,
            ),
        }
    }

    async fn ingest<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: hyper::body::Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Some(response) = verify_request_content_length(
            req.headers(),
            self.max_request_bytes,
            "Error processing log record",
        ) {
            return response;
        }

        let body = match Limited::new(req.into_body(), self.max_request_bytes)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return log_and_create_http_response(
                    "Error processing log record: Payload too large",
                    StatusCode::PAYLOAD_TOO_LARGE,
                );
            }
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Error reading request body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let raw: RawLogRecord = match serde_json::from_slice(&body) {
            Ok(raw) => raw,
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &json!({
                        "status": "rejected",
                        "error": "ValidationError",
                        "message": format!("invalid JSON body: {e}"),
                    }),
                );
            }
        };

        match self.pipeline.submit(raw) {
            Ok(id) => {
                debug!(%id, "HTTP | Record queued");
                json_response(StatusCode::ACCEPTED, &json!({"id": id, "status": "queued"}))
            }
            Err(e) => {
                debug!("HTTP | Record rejected: {e}");
                rejection(&e)
            }
        }
    }

    fn status(&self, raw_id: &str) -> http::Result<HttpResponse> {
        let Ok(id) = raw_id.parse::<RecordId>() else {
            return log_and_create_http_response(
                &format!("'{raw_id}' is not a valid record id"),
                StatusCode::BAD_REQUEST,
            );
        };
        let Some(history) = self.pipeline.history(&id) else {
            return json_response(
                StatusCode::NOT_FOUND,
                &json!({"id": id, "status": "unknown"}),
            );
        };
        let current = history.last().map(|t| &t.status);
        let view = StatusView {
            id,
            status: current.map_or("unknown", DeliveryStatus::name),
            reason: current.and_then(failure_reason),
            history: history.iter().map(TransitionView::from).collect(),
        };
        json_response(StatusCode::OK, &view)
    }

    async fn search(&self, query: Option<&str>) -> http::Result<HttpResponse> {
        let params: SearchParams = match serde_urlencoded::from_str(query.unwrap_or_default()) {
            Ok(params) => params,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Invalid search parameters: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };
        let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        match self.pipeline.search(params.query.as_deref(), limit).await {
            Ok(page) => json_response(
                StatusCode::OK,
                &SearchView {
                    total: page.total,
                    hits: &page.records,
                },
            ),
            Err(e) if e.is_retryable() => log_and_create_http_response(
                &format!("Search backend unavailable: {e}"),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            Err(e) => log_and_create_http_response(
                &format!("Search failed: {e}"),
                StatusCode::BAD_GATEWAY,
            ),
        }
    }

    fn health(&self) -> http::Result<HttpResponse> {
        let report = self.pipeline.health();
        let (status, label) = if report.reachable {
            (StatusCode::OK, "ok")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "error")
        };
        json_response(
            status,
            &json!({
                "status": label,
                "backend_reachable": report.reachable,
                "success_ratio": report.success_ratio,
                "samples": report.samples,
                "queued": self.pipeline.queued(),
                "accepting": self.pipeline.is_accepting(),
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use crate::pipeline::PipelineConfig;
    use http_body_util::Full;
    use hyper::header;
    use serde_json::Value;

    fn server(capacity: usize) -> LogServer {
        let pipeline = IngestPipeline::new(
            Arc::new(InMemoryBackend::new()),
            PipelineConfig {
                queue_capacity: capacity,
                ..PipelineConfig::default()
            },
        );
        LogServer::new(Arc::new(pipeline), 1024)
    }

    fn post_logs(body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri("/logs")
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    async fn json_body(response: HttpResponse) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_path() {
        assert_eq!(status_path("/logs/abc/status"), Some("abc"));
        assert_eq!(status_path("/logs//status"), None);
        assert_eq!(status_path("/logs/a/b/status"), None);
        assert_eq!(status_path("/logs/search"), None);
    }

    #[tokio::test]
    async fn test_ingest_then_status() {
        let server = server(10);
        let response = server
            .handle(post_logs(
                r#"{"service":"auth-service","level":"info","message":"Status check ok","meta":{"device":"ios"}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        assert_eq!(body["status"], "queued");
        let id = body["id"].as_str().unwrap().to_string();

        let response = server
            .handle(get(&format!("/logs/{id}/status")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "queued");
        assert_eq!(body["history"][0]["status"], "admitted");
        assert!(body["reason"].is_null());
    }

    #[tokio::test]
    async fn test_validation_error_is_bad_request() {
        let server = server(10);
        let response = server
            .handle(post_logs(r#"{"service":"auth-service","level":"TRACE","message":"x"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "ValidationError");

        let response = server.handle(post_logs("not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_queue_full_is_service_unavailable() {
        let server = server(1);
        let record = r#"{"service":"mail-service","level":"WARNING","message":"Slow response detected"}"#;
        assert_eq!(
            server.handle(post_logs(record)).await.unwrap().status(),
            StatusCode::ACCEPTED
        );
        let response = server.handle(post_logs(record)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
        assert_eq!(json_body(response).await["error"], "QueueFull");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let server = server(10);
        let message = "x".repeat(2048);
        let response = server
            .handle(post_logs(&format!(
                r#"{{"service":"s","level":"INFO","message":"{message}"}}"#
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let server = server(10);
        let id = RecordId::new_random();
        let response = server
            .handle(get(&format!("/logs/{id}/status")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["status"], "unknown");

        let response = server.handle(get("/logs/not-a-uuid/status")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_search_rejects_bad_limit() {
        let server = server(10);
        let response = server
            .handle(get("/logs/search?limit=many"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = server
            .handle(get("/logs/search?query=timeout&limit=5"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["total"], 0);
    }

    #[tokio::test]
    async fn test_health_before_initialization_is_unavailable() {
        let server = server(10);
        let response = server.handle(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["status"], "error");

        server.pipeline.initialize().await.unwrap();
        let response = server.handle(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_routes() {
        let server = server(10);
        assert_eq!(
            server.handle(get("/metrics")).await.unwrap().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            server.handle(get("/logs")).await.unwrap().status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
