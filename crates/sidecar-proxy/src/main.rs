//! sidecar-proxy: routes each inbound request to the co-located application
//! or to the sidecar of a remote application, discovered per request.

mod config;
mod control;
mod discovery;
mod dispatch;
mod error;
mod forward;
mod identity;
mod resolver;
mod server;
mod status;
mod transport;

use std::sync::Arc;

use config::ProxyConfig;
use discovery::{CachedDiscovery, HttpConnector, PeerDiscovery, RemoteDiscovery};
use dispatch::Dispatcher;
use status::StatusRegistry;
use transport::TransportCache;

fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args: Vec<String> = std::env::args().collect();
    let flag = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1).cloned())
    };

    let config_path = flag("--config")
        .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
        .or_else(|| std::env::var("SIDECAR_PROXY_CONFIG").ok())
        .unwrap_or_else(|| "sidecar-proxy.toml".to_string());

    // Load configuration
    let mut config = ProxyConfig::load(&config_path)?;

    // Apply CLI overrides (take precedence over TOML and env vars)
    if let Some(port) = flag("--proxy-port") {
        config.server.proxy_port = port.parse()?;
    }
    if let Some(port) = flag("--app-port") {
        config.server.application_port = port.parse()?;
    }
    if let Some(app_id) = flag("--app-id") {
        config.server.app_id = app_id;
    }
    if let Some(namespace) = flag("--namespace") {
        config.server.namespace = namespace;
    }
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Initialize tracing (OTLP export is optional, falls back to fmt-only)
        let tracing_guard = sidecar_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            app_id = %config.server.app_id,
            namespace = %config.server.namespace,
            proxy_port = config.server.proxy_port,
            application_port = config.server.application_port,
            control_port = config.server.control_port,
            resolver = ?config.resolver.mode,
            otlp_export = tracing_guard.is_exporting(),
            "Starting sidecar-proxy"
        );

        run(config).await
    })
}

async fn run(config: ProxyConfig) -> anyhow::Result<()> {
    // Loopback client for the co-located application
    let local_client = reqwest::Client::builder()
        .timeout(config.forward.timeout())
        .no_proxy()
        .build()?;

    let connector = Arc::new(HttpConnector::new(config.discovery.timeout())?);
    let remote = RemoteDiscovery::new(connector);
    let discovery: Arc<dyn PeerDiscovery> = match config.discovery.cache_ttl() {
        Some(ttl) => {
            tracing::info!(ttl_secs = ttl.as_secs(), "Discovery cache enabled");
            Arc::new(CachedDiscovery::new(remote, ttl))
        }
        None => Arc::new(remote),
    };

    let dispatcher = Dispatcher::new(
        config.server.clone(),
        resolver::from_config(&config.resolver, config.server.control_port),
        discovery,
        TransportCache::new(Some(config.forward.timeout())),
        local_client,
        config.forward.max_body_bytes,
    );

    server::run(
        &config.server,
        dispatcher,
        StatusRegistry::new(),
        server::shutdown_signal(),
    )
    .await
}
