//! Reusable OTLP tracing library for sidecar-proxy.
//!
//! Owns subscriber bootstrap (fmt + optional OpenTelemetry export) and the
//! span macros used on the dispatch hot path.

pub mod config;
pub mod otlp;
pub mod spans;

pub use config::{OtlpProtocol, TracingConfig};
pub use otlp::{init_tracing, TracingGuard};
