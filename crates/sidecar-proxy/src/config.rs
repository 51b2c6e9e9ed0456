//! Configuration types and loading logic.

use std::collections::HashMap;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use sidecar_tracing::TracingConfig;

/// Top-level sidecar configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Identity and listener configuration of this sidecar.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Data-plane port this proxy listens on.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Port of the co-located application, reached over loopback.
    #[serde(default = "default_application_port")]
    pub application_port: u16,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// This sidecar's own identity. Requests addressed to it stay local.
    #[serde(default)]
    pub app_id: String,

    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Port of the control-plane listener that answers peer status queries.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
}

/// Which name-resolution provider maps identities to peer addresses.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolverMode {
    #[default]
    Static,
    Dns,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default)]
    pub mode: ResolverMode,

    /// Static table of `"<id>.<namespace>"` to `"host:port"`.
    #[serde(default)]
    pub table: HashMap<String, String>,

    /// DNS suffix appended to `<id>.<namespace>` in `dns` mode.
    #[serde(default = "default_dns_domain")]
    pub domain: String,

    /// Port to pair with DNS answers. Defaults to `server.control_port`.
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_timeout")]
    pub timeout_secs: u64,

    /// How long a successful discovery result is reused. 0 disables caching.
    #[serde(default)]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    #[serde(default = "default_forward_timeout")]
    pub timeout_secs: u64,

    /// Largest request body buffered for forwarding.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_proxy_port() -> u16 {
    3600
}

fn default_application_port() -> u16 {
    8080
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_control_port() -> u16 {
    50002
}

fn default_dns_domain() -> String {
    "svc.cluster.local".to_string()
}

fn default_discovery_timeout() -> u64 {
    5
}

fn default_forward_timeout() -> u64 {
    300
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            proxy_port: default_proxy_port(),
            application_port: default_application_port(),
            namespace: default_namespace(),
            app_id: String::new(),
            bind_host: default_bind_host(),
            control_port: default_control_port(),
        }
    }
}

impl ServerConfig {
    pub fn proxy_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.proxy_port)
    }

    pub fn control_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.control_port)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mode: ResolverMode::default(),
            table: HashMap::new(),
            domain: default_dns_domain(),
            port: None,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_discovery_timeout(),
            cache_ttl_secs: 0,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Cache TTL, or `None` when discovery caching is disabled.
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_forward_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl ForwardConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ProxyConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (SIDECAR_ prefix, __ for nesting)
    /// 2. TOML config file
    /// 3. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(config_path))
                .merge(Env::prefixed("SIDECAR_").split("__")),
        )
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: ProxyConfig = figment.extract()?;
        Ok(config)
    }

    /// Check invariants that serde defaults cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.app_id.is_empty() {
            anyhow::bail!("server.app_id must be set (config file, SIDECAR_SERVER__APP_ID or --app-id)");
        }
        if self.server.app_id.contains('.') {
            anyhow::bail!("server.app_id must not contain '.': {}", self.server.app_id);
        }
        Ok(())
    }
}
