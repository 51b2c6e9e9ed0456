//! Final hop: send the rewritten request and stream the response back.
//!
//! Upstream status, headers (minus hop-by-hop) and body bytes are relayed
//! verbatim. Failures are returned to the caller untouched; turning them
//! into an HTTP answer is the server layer's job.

use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::Instrument;

use crate::transport::PinnedTransport;

/// Headers that should NOT be forwarded (hop-by-hop headers).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
];

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to read request body: {0}")]
    ReadBody(#[source] axum::Error),

    #[error("forward to {target} failed: {source}")]
    Upstream {
        target: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ForwardError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ForwardError::Upstream { source, .. } if source.is_timeout())
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name)
}

/// `http://<authority><path>?<query>` for the rewritten destination.
pub fn target_url(authority: &str, uri: &Uri) -> String {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("http://{authority}{path_and_query}")
}

/// Forward `request` to the address `transport` is pinned to.
///
/// `route` only labels the span (`local` or `remote`).
pub async fn forward(
    transport: &PinnedTransport,
    route: &str,
    request: Request,
    max_body_bytes: usize,
) -> Result<Response, ForwardError> {
    let authority = transport.address();
    let span = sidecar_tracing::forward_span!(route, authority);

    async {
        let (parts, body) = request.into_parts();

        let body = axum::body::to_bytes(body, max_body_bytes)
            .await
            .map_err(ForwardError::ReadBody)?;

        let mut req_builder = transport.request(parts.method, &parts.uri).body(body);
        for (name, value) in parts.headers.iter() {
            let name_str = name.as_str();
            // Skip content-length: reqwest sets it from the buffered body
            if is_hop_by_hop(name_str) || name_str == "content-length" {
                continue;
            }
            req_builder = req_builder.header(name, value);
        }

        let start = Instant::now();
        let upstream_result = req_builder.send().await;

        build_response(upstream_result, start, authority)
    }
    .instrument(span)
    .await
}

/// Build an axum Response from the upstream reqwest result, streaming the body back.
fn build_response(
    upstream_result: Result<reqwest::Response, reqwest::Error>,
    start: Instant,
    target: &str,
) -> Result<Response, ForwardError> {
    let latency = start.elapsed().as_millis() as u64;
    tracing::Span::current().record("latency_ms", latency);

    let upstream_resp = match upstream_result {
        Ok(resp) => resp,
        Err(source) => {
            tracing::warn!(error = %source, latency_ms = latency, "Forward failed");
            return Err(ForwardError::Upstream {
                target: target.to_string(),
                source,
            });
        }
    };

    let status = upstream_resp.status();
    tracing::Span::current().record("status", status.as_u16());
    tracing::debug!(
        status = status.as_u16(),
        latency_ms = latency,
        "Forward complete"
    );

    let mut response_builder = Response::builder().status(status);
    if let Some(headers) = response_builder.headers_mut() {
        copy_end_to_end_headers(upstream_resp.headers(), headers);
    }

    let body = Body::from_stream(upstream_resp.bytes_stream());

    Ok(response_builder.body(body).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to build response");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }))
}

fn copy_end_to_end_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}
