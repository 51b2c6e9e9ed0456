//! Span builder helpers for dispatch instrumentation.

/// Create a tracing span for one inbound data-plane request.
///
/// Usage: `let span = dispatch_request_span!(request_id, method, path);`
///
/// Fields recorded later by the dispatcher and server:
/// - `destination`: raw `Destination-App-Id` header value
/// - `route`: `local`, `remote` or `rejected`
/// - `status`: final HTTP status returned to the caller
/// - `latency_ms`: milliseconds spent handling the request
#[macro_export]
macro_rules! dispatch_request_span {
    ($request_id:expr, $method:expr, $path:expr) => {
        tracing::info_span!(
            "dispatch_request",
            request_id = %$request_id,
            method = %$method,
            path = %$path,
            destination = tracing::field::Empty,
            route = tracing::field::Empty,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for a peer discovery round-trip.
#[macro_export]
macro_rules! discovery_span {
    ($address:expr, $identity:expr, $namespace:expr) => {
        tracing::debug_span!(
            "peer_discovery",
            address = %$address,
            identity = %$identity,
            namespace = %$namespace,
            enabled = tracing::field::Empty,
            peer_port = tracing::field::Empty,
        )
    };
}

/// Create a tracing span for the final forward hop.
#[macro_export]
macro_rules! forward_span {
    ($route:expr, $target:expr) => {
        tracing::info_span!(
            "forward",
            route = %$route,
            target = %$target,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
