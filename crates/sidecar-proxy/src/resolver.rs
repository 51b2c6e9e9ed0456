//! Name resolution: map a destination `(identity, namespace)` to the
//! network address of that destination's sidecar.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ResolverConfig, ResolverMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    pub id: String,
    pub namespace: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no address registered for {id}.{namespace}")]
    NotFound { id: String, namespace: String },

    #[error("lookup of {host} failed: {source}")]
    Lookup {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{host} resolved to no addresses")]
    NoAddresses { host: String },
}

/// Capability that turns a logical identity into a `host:port` address.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve_id(&self, request: &ResolveRequest) -> Result<String, ResolveError>;
}

/// Build the provider selected by `[resolver] mode`.
///
/// DNS answers are paired with `[resolver] port`, or with `control_port`
/// when unset, since discovery queries the peer's control plane.
pub fn from_config(config: &ResolverConfig, control_port: u16) -> Arc<dyn NameResolver> {
    match config.mode {
        ResolverMode::Static => Arc::new(StaticResolver::new(config.table.clone())),
        ResolverMode::Dns => Arc::new(DnsResolver::new(
            config.domain.clone(),
            config.port.unwrap_or(control_port),
        )),
    }
}

/// Fixed table keyed by `"<id>.<namespace>"`.
pub struct StaticResolver {
    table: HashMap<String, String>,
}

impl StaticResolver {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn resolve_id(&self, request: &ResolveRequest) -> Result<String, ResolveError> {
        let key = format!("{}.{}", request.id, request.namespace);
        self.table
            .get(&key)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound {
                id: request.id.clone(),
                namespace: request.namespace.clone(),
            })
    }
}

/// Resolves `<id>.<namespace>.<domain>` through the system resolver.
pub struct DnsResolver {
    domain: String,
    port: u16,
}

impl DnsResolver {
    pub fn new(domain: String, port: u16) -> Self {
        Self { domain, port }
    }

    fn host_for(&self, request: &ResolveRequest) -> String {
        if self.domain.is_empty() {
            format!("{}.{}", request.id, request.namespace)
        } else {
            format!("{}.{}.{}", request.id, request.namespace, self.domain)
        }
    }
}

#[async_trait]
impl NameResolver for DnsResolver {
    async fn resolve_id(&self, request: &ResolveRequest) -> Result<String, ResolveError> {
        let host = self.host_for(request);

        let first = tokio::net::lookup_host((host.as_str(), self.port))
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.clone(),
                source,
            })?
            .next();

        match first {
            Some(addr) => Ok(addr.to_string()),
            None => Err(ResolveError::NoAddresses { host }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str, namespace: &str) -> ResolveRequest {
        ResolveRequest {
            id: id.to_string(),
            namespace: namespace.to_string(),
            port: 3600,
        }
    }

    #[tokio::test]
    async fn test_static_resolver_hit_and_miss() {
        let mut table = HashMap::new();
        table.insert("billing.prod".to_string(), "10.0.0.5:50002".to_string());
        let resolver = StaticResolver::new(table);

        let addr = resolver.resolve_id(&request("billing", "prod")).await.unwrap();
        assert_eq!(addr, "10.0.0.5:50002");

        let err = resolver
            .resolve_id(&request("billing", "staging"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
        assert_eq!(err.to_string(), "no address registered for billing.staging");
    }

    #[test]
    fn test_dns_host_name() {
        let resolver = DnsResolver::new("svc.cluster.local".to_string(), 50002);
        assert_eq!(
            resolver.host_for(&request("billing", "prod")),
            "billing.prod.svc.cluster.local"
        );

        let bare = DnsResolver::new(String::new(), 50002);
        assert_eq!(bare.host_for(&request("billing", "prod")), "billing.prod");
    }

    #[tokio::test]
    async fn test_dns_resolver_unknown_host_fails() {
        let resolver = DnsResolver::new("invalid".to_string(), 50002);
        let result = resolver.resolve_id(&request("nobody", "nowhere")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_from_config_selects_static() {
        let mut config = ResolverConfig::default();
        config
            .table
            .insert("orders.default".to_string(), "127.0.0.1:50002".to_string());

        let resolver = from_config(&config, 50002);
        let addr = resolver.resolve_id(&request("orders", "default")).await.unwrap();
        assert_eq!(addr, "127.0.0.1:50002");
    }

    #[tokio::test]
    async fn test_dns_mode_defaults_to_control_port() {
        // With no domain, "127.0.0" + "1" forms an IP literal that needs no DNS.
        let config = ResolverConfig {
            mode: ResolverMode::Dns,
            domain: String::new(),
            ..ResolverConfig::default()
        };
        let resolver = from_config(&config, 50002);
        let addr = resolver.resolve_id(&request("127.0.0", "1")).await.unwrap();
        assert_eq!(addr, "127.0.0.1:50002");

        let config = ResolverConfig {
            port: Some(50005),
            ..config
        };
        let resolver = from_config(&config, 50002);
        let addr = resolver.resolve_id(&request("127.0.0", "1")).await.unwrap();
        assert_eq!(addr, "127.0.0.1:50005");
    }
}
