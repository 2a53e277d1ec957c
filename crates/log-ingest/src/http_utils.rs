// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    header,
    http::{self, HeaderMap, HeaderValue},
    Response, StatusCode,
};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, warn};

pub type Body = Full<Bytes>;
pub type HttpResponse = Response<Body>;

/// Logs `message` and returns it as `{"message": message}` with `status`.
///
/// Success statuses log at debug, client errors at warn and server errors at error.
pub fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("HTTP | {message}");
    } else if status.is_client_error() {
        warn!("HTTP | {message}");
    } else {
        error!("HTTP | {message}");
    }
    let body = json!({ "message": message }).to_string();
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
}

/// Serializes `payload` as the JSON body of a response with `status`.
pub fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> http::Result<HttpResponse> {
    match serde_json::to_vec(payload) {
        Ok(body) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body)),
        Err(e) => log_and_create_http_response(
            &format!("Failed to serialize response: {e}"),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    }
}

/// Adds `Retry-After: {seconds}` to a backpressure response.
pub fn with_retry_after(
    response: http::Result<HttpResponse>,
    seconds: u64,
) -> http::Result<HttpResponse> {
    response.map(|mut response| {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        response
    })
}

/// Checks that the request declares a body length no larger than `max_content_length`.
///
/// A chunked request without `Content-Length` passes; the body reader enforces the
/// limit in that case. Returns the error response to send back, if any.
pub fn verify_request_content_length(
    header_map: &HeaderMap,
    max_content_length: usize,
    error_message_prefix: &str,
) -> Option<http::Result<HttpResponse>> {
    let Some(value) = header_map.get(header::CONTENT_LENGTH) else {
        if header_map.contains_key(header::TRANSFER_ENCODING) {
            return None;
        }
        return Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Missing Content-Length and Transfer-Encoding header"),
            StatusCode::LENGTH_REQUIRED,
        ));
    };

    let content_length = value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok());
    match content_length {
        None => Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Invalid Content-Length header"),
            StatusCode::BAD_REQUEST,
        )),
        Some(length) if length > max_content_length => Some(log_and_create_http_response(
            &format!("{error_message_prefix}: Payload too large"),
            StatusCode::PAYLOAD_TOO_LARGE,
        )),
        Some(_) => None,
    }
}
