//! Axum HTTP servers: data-plane router, control-plane listener, graceful
//! shutdown and status publication.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::config::ServerConfig;
use crate::control;
use crate::dispatch::Dispatcher;
use crate::forward::ForwardError;
use crate::status::{ServerStatus, StatusRegistry};

/// Shared application state.
pub struct AppState {
    pub dispatcher: Dispatcher,
}

/// Data-plane router: every method and path goes to the dispatcher.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .fallback(handle_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind both listeners, publish the status and serve until `shutdown`
/// completes.
pub async fn run<F>(
    config: &ServerConfig,
    dispatcher: Dispatcher,
    status: StatusRegistry,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let proxy_addr = config.proxy_address();
    let control_addr = config.control_address();

    let control_listener = tokio::net::TcpListener::bind(&control_addr).await?;
    tracing::info!(address = %control_addr, "Control plane listening");

    let proxy_listener = tokio::net::TcpListener::bind(&proxy_addr).await?;
    tracing::info!(address = %proxy_addr, "Sidecar proxy listening");

    status.set_status(ServerStatus {
        enabled: true,
        port: config.proxy_port,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let status = status.clone();
        let port = config.proxy_port;
        tokio::spawn(async move {
            shutdown.await;
            // Stop advertising before draining so peers route elsewhere.
            status.set_status(ServerStatus {
                enabled: false,
                port,
            });
            let _ = shutdown_tx.send(true);
        });
    }

    let app = router(Arc::new(AppState { dispatcher }));
    let proxy =
        axum::serve(proxy_listener, app).with_graceful_shutdown(wait_for(shutdown_rx.clone()));
    let control = axum::serve(control_listener, control::router(status))
        .with_graceful_shutdown(wait_for(shutdown_rx));

    tokio::try_join!(async { proxy.await }, async { control.await })?;

    tracing::info!("Sidecar proxy shut down gracefully");
    Ok(())
}

/// Catch-all handler: dispatch, then render forward failures.
async fn handle_request(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let span = sidecar_tracing::dispatch_request_span!(&request_id, &method, &path);
    span.set_attribute("http.request.method", method.to_string());
    span.set_attribute("url.path", path.clone());
    let start = Instant::now();

    async {
        let response = match state.dispatcher.dispatch(request).await {
            Ok(response) => response,
            Err(e) => render_forward_error(&e),
        };

        let current = tracing::Span::current();
        current.record("status", response.status().as_u16());
        current.record("latency_ms", start.elapsed().as_millis() as u64);
        current.set_attribute(
            "http.response.status_code",
            i64::from(response.status().as_u16()),
        );
        response
    }
    .instrument(span)
    .await
}

/// Plain-text gateway errors for failed forwards; never the JSON error body.
fn render_forward_error(error: &ForwardError) -> Response {
    match error {
        ForwardError::ReadBody(_) => {
            tracing::warn!(error = %error, "Failed to read request body");
            (StatusCode::BAD_REQUEST, "failed to read request body").into_response()
        }
        _ if error.is_timeout() => {
            tracing::error!(error = %error, "Upstream timeout");
            (StatusCode::GATEWAY_TIMEOUT, "upstream timeout").into_response()
        }
        _ => {
            tracing::error!(error = %error, "Upstream connection error");
            (StatusCode::BAD_GATEWAY, "upstream connection error").into_response()
        }
    }
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
pub async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
    tracing::info!("Shutdown signal received, draining connections...");
}
