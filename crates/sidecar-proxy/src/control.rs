//! Control-plane listener: answers peer status queries from the
//! [`StatusRegistry`]. Never touches the dispatcher.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::discovery::{ProxyStatusRequest, API_VERSION_V1, PEER_APP_ID_HEADER, STATUS_PATH};
use crate::error::{ErrorCode, Rejection};
use crate::status::StatusRegistry;

pub fn router(status: StatusRegistry) -> Router {
    Router::new()
        .route(STATUS_PATH, post(handle_proxy_status))
        .route("/healthz", get(handle_health))
        .with_state(status)
}

/// POST /v1.0/proxy/status: report `{enabled, port}` of this sidecar.
async fn handle_proxy_status(
    State(status): State<StatusRegistry>,
    headers: HeaderMap,
    Json(request): Json<ProxyStatusRequest>,
) -> Response {
    if request.ver != API_VERSION_V1 {
        return Rejection::bad_request(
            ErrorCode::UnsupportedVersion,
            format!("unsupported proxy status version {}", request.ver),
        )
        .into_response();
    }

    let current = status.status();
    tracing::debug!(
        caller_target = ?headers.get(PEER_APP_ID_HEADER),
        enabled = current.enabled,
        port = current.port,
        "Answered proxy status query"
    );
    Json(current).into_response()
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
