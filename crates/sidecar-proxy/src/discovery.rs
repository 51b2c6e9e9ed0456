//! Peer discovery: ask a remote sidecar whether its proxy front-end is
//! serving and which port it actually listens on.
//!
//! Name resolution only yields the address of the peer's control endpoint.
//! The data-plane port is learned from the peer itself with a status RPC,
//! and the resolved address is rewritten to point at it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Instrument;

use crate::status::ServerStatus;

/// Protocol version tag sent with every status query.
pub const API_VERSION_V1: &str = "V1";

/// Control-plane route serving the status RPC.
pub const STATUS_PATH: &str = "/v1.0/proxy/status";

/// Identity of the destination the channel was opened for.
pub const PEER_APP_ID_HEADER: &str = "x-sidecar-app-id";
pub const PEER_NAMESPACE_HEADER: &str = "x-sidecar-namespace";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatusRequest {
    pub ver: String,
}

impl ProxyStatusRequest {
    pub fn v1() -> Self {
        Self {
            ver: API_VERSION_V1.to_string(),
        }
    }
}

/// Peers answer with their own [`ServerStatus`].
pub type ProxyStatusResponse = ServerStatus;

/// Transport-security knobs for an RPC channel. Discovery opens channels
/// with every flag off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    pub skip_tls: bool,
    pub recreate_if_exists: bool,
    pub enable_ssl: bool,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("peer answered with status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to open channel to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: RpcError,
    },

    #[error("status query to {address} failed: {source}")]
    Transport {
        address: String,
        #[source]
        source: RpcError,
    },

    #[error("remote proxy at {address} is not enabled")]
    Disabled { address: String },

    #[error("address {0} has no port segment")]
    MalformedAddress(String),
}

/// One open RPC channel to a peer's control endpoint.
#[async_trait]
pub trait ProxyStatusClient: Send + Sync {
    async fn get_proxy_status(
        &self,
        request: ProxyStatusRequest,
    ) -> Result<ProxyStatusResponse, RpcError>;
}

/// Opens RPC channels to peers.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        identity: &str,
        namespace: &str,
        options: ChannelOptions,
    ) -> Result<Box<dyn ProxyStatusClient>, RpcError>;
}

/// Turns a name-resolved address into the peer's data-plane address.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn discover(
        &self,
        address: &str,
        identity: &str,
        namespace: &str,
    ) -> Result<String, DiscoveryError>;

    /// Forget anything remembered about `(identity, namespace)`.
    fn invalidate(&self, _identity: &str, _namespace: &str) {}
}

/// Replace the last `:`-delimited segment of `address` with `port`.
pub fn replace_port(address: &str, port: u16) -> Result<String, DiscoveryError> {
    let (host, _) = address
        .rsplit_once(':')
        .ok_or_else(|| DiscoveryError::MalformedAddress(address.to_string()))?;
    Ok(format!("{host}:{port}"))
}

/// Discovery that performs one status round-trip per call.
pub struct RemoteDiscovery {
    connector: Arc<dyn PeerConnector>,
}

impl RemoteDiscovery {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl PeerDiscovery for RemoteDiscovery {
    async fn discover(
        &self,
        address: &str,
        identity: &str,
        namespace: &str,
    ) -> Result<String, DiscoveryError> {
        let span = sidecar_tracing::discovery_span!(address, identity, namespace);

        async {
            let channel = self
                .connector
                .connect(address, identity, namespace, ChannelOptions::default())
                .await
                .map_err(|source| DiscoveryError::Connect {
                    address: address.to_string(),
                    source,
                })?;

            let status = channel
                .get_proxy_status(ProxyStatusRequest::v1())
                .await
                .map_err(|source| DiscoveryError::Transport {
                    address: address.to_string(),
                    source,
                })?;

            tracing::Span::current().record("enabled", status.enabled);
            tracing::Span::current().record("peer_port", status.port);

            if !status.enabled {
                return Err(DiscoveryError::Disabled {
                    address: address.to_string(),
                });
            }

            let corrected = replace_port(address, status.port)?;
            tracing::debug!(corrected = %corrected, "Discovered peer proxy address");
            Ok::<_, DiscoveryError>(corrected)
        }
        .instrument(span)
        .await
    }
}

/// JSON-over-HTTP binding of the status RPC.
pub struct HttpConnector {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        let insecure_client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            insecure_client,
        })
    }
}

#[async_trait]
impl PeerConnector for HttpConnector {
    /// HTTP channels hold no connection of their own; the shared client
    /// pools connections, so `recreate_if_exists` has nothing to recreate.
    async fn connect(
        &self,
        address: &str,
        identity: &str,
        namespace: &str,
        options: ChannelOptions,
    ) -> Result<Box<dyn ProxyStatusClient>, RpcError> {
        if options.recreate_if_exists {
            tracing::debug!(address = %address, "HTTP status channels are stateless, nothing to recreate");
        }
        let scheme = if options.enable_ssl { "https" } else { "http" };
        let client = if options.enable_ssl && options.skip_tls {
            self.insecure_client.clone()
        } else {
            self.client.clone()
        };

        Ok(Box::new(HttpStatusClient {
            client,
            url: format!("{scheme}://{address}{STATUS_PATH}"),
            identity: identity.to_string(),
            namespace: namespace.to_string(),
        }))
    }
}

struct HttpStatusClient {
    client: reqwest::Client,
    url: String,
    identity: String,
    namespace: String,
}

#[async_trait]
impl ProxyStatusClient for HttpStatusClient {
    async fn get_proxy_status(
        &self,
        request: ProxyStatusRequest,
    ) -> Result<ProxyStatusResponse, RpcError> {
        let resp = self
            .client
            .post(&self.url)
            .header(PEER_APP_ID_HEADER, &self.identity)
            .header(PEER_NAMESPACE_HEADER, &self.namespace)
            .json(&request)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(RpcError::Status(resp.status().as_u16()));
        }

        Ok(resp.json::<ProxyStatusResponse>().await?)
    }
}

struct CachedEntry {
    resolved: String,
    corrected: String,
    stored_at: Instant,
}

/// Decorator that remembers successful discoveries per `(identity, namespace)`
/// for a fixed TTL. A cached entry only applies while name resolution keeps
/// returning the same address.
pub struct CachedDiscovery<D> {
    inner: D,
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), CachedEntry>>,
}

impl<D: PeerDiscovery> CachedDiscovery<D> {
    pub fn new(inner: D, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, key: &(String, String), address: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.resolved == address && entry.stored_at.elapsed() < self.ttl => {
                Some(entry.corrected.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl<D: PeerDiscovery> PeerDiscovery for CachedDiscovery<D> {
    async fn discover(
        &self,
        address: &str,
        identity: &str,
        namespace: &str,
    ) -> Result<String, DiscoveryError> {
        let key = (identity.to_string(), namespace.to_string());
        if let Some(corrected) = self.lookup(&key, address) {
            tracing::debug!(identity = %identity, namespace = %namespace, corrected = %corrected, "Discovery cache hit");
            return Ok(corrected);
        }

        match self.inner.discover(address, identity, namespace).await {
            Ok(corrected) => {
                let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
                entries.insert(
                    key,
                    CachedEntry {
                        resolved: address.to_string(),
                        corrected: corrected.clone(),
                        stored_at: Instant::now(),
                    },
                );
                Ok(corrected)
            }
            Err(e) => {
                self.invalidate(identity, namespace);
                Err(e)
            }
        }
    }

    fn invalidate(&self, identity: &str, namespace: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&(identity.to_string(), namespace.to_string()));
        self.inner.invalidate(identity, namespace);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What a fake peer does when queried.
    #[derive(Clone, Copy)]
    pub(crate) enum PeerBehavior {
        Answer(ServerStatus),
        RefuseConnect,
        FailQuery,
    }

    pub(crate) struct FakeConnector {
        pub behavior: PeerBehavior,
        pub connects: AtomicUsize,
        pub last_options: Mutex<Option<ChannelOptions>>,
    }

    impl FakeConnector {
        pub(crate) fn new(behavior: PeerBehavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                connects: AtomicUsize::new(0),
                last_options: Mutex::new(None),
            })
        }
    }

    struct FakeChannel(PeerBehavior);

    #[async_trait]
    impl ProxyStatusClient for FakeChannel {
        async fn get_proxy_status(
            &self,
            request: ProxyStatusRequest,
        ) -> Result<ProxyStatusResponse, RpcError> {
            assert_eq!(request.ver, API_VERSION_V1);
            match self.0 {
                PeerBehavior::Answer(status) => Ok(status),
                _ => Err(RpcError::Status(503)),
            }
        }
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn connect(
            &self,
            _address: &str,
            _identity: &str,
            _namespace: &str,
            options: ChannelOptions,
        ) -> Result<Box<dyn ProxyStatusClient>, RpcError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            *self.last_options.lock().unwrap() = Some(options);
            match self.behavior {
                PeerBehavior::RefuseConnect => Err(RpcError::Status(0)),
                behavior => Ok(Box::new(FakeChannel(behavior))),
            }
        }
    }

    fn enabled(port: u16) -> PeerBehavior {
        PeerBehavior::Answer(ServerStatus {
            enabled: true,
            port,
        })
    }

    #[tokio::test]
    async fn test_enabled_peer_rewrites_port() {
        let connector = FakeConnector::new(enabled(9000));
        let discovery = RemoteDiscovery::new(connector.clone());

        let corrected = discovery
            .discover("10.0.0.5:3500", "billing", "prod")
            .await
            .unwrap();

        assert_eq!(corrected, "10.0.0.5:9000");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            *connector.last_options.lock().unwrap(),
            Some(ChannelOptions::default())
        );
    }

    #[tokio::test]
    async fn test_disabled_peer_fails() {
        let connector = FakeConnector::new(PeerBehavior::Answer(ServerStatus {
            enabled: false,
            port: 9000,
        }));
        let discovery = RemoteDiscovery::new(connector);

        let err = discovery
            .discover("10.0.0.5:3500", "billing", "prod")
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Disabled { .. }));
    }

    #[tokio::test]
    async fn test_connect_and_query_failures_are_distinguished() {
        let discovery = RemoteDiscovery::new(FakeConnector::new(PeerBehavior::RefuseConnect));
        let err = discovery.discover("10.0.0.5:3500", "b", "p").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Connect { .. }));

        let discovery = RemoteDiscovery::new(FakeConnector::new(PeerBehavior::FailQuery));
        let err = discovery.discover("10.0.0.5:3500", "b", "p").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Transport { .. }));
    }

    #[test]
    fn test_replace_port() {
        assert_eq!(replace_port("10.0.0.5:3500", 9000).unwrap(), "10.0.0.5:9000");
        assert_eq!(replace_port("peer.local:1", 80).unwrap(), "peer.local:80");
        assert_eq!(replace_port("[::1]:3500", 9000).unwrap(), "[::1]:9000");
        assert!(matches!(
            replace_port("no-port", 9000),
            Err(DiscoveryError::MalformedAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_cached_discovery_reuses_result() {
        let connector = FakeConnector::new(enabled(9000));
        let discovery = CachedDiscovery::new(
            RemoteDiscovery::new(connector.clone()),
            Duration::from_secs(60),
        );

        for _ in 0..3 {
            let corrected = discovery.discover("10.0.0.5:3500", "b", "p").await.unwrap();
            assert_eq!(corrected, "10.0.0.5:9000");
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        // A different resolved address bypasses the stale entry.
        let corrected = discovery.discover("10.0.0.6:3500", "b", "p").await.unwrap();
        assert_eq!(corrected, "10.0.0.6:9000");
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cached_discovery_invalidate_and_expiry() {
        let connector = FakeConnector::new(enabled(9000));
        let discovery = CachedDiscovery::new(
            RemoteDiscovery::new(connector.clone()),
            Duration::from_millis(20),
        );

        discovery.discover("10.0.0.5:3500", "b", "p").await.unwrap();
        discovery.invalidate("b", "p");
        discovery.discover("10.0.0.5:3500", "b", "p").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        discovery.discover("10.0.0.5:3500", "b", "p").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cached_discovery_does_not_cache_failures() {
        let connector = FakeConnector::new(PeerBehavior::Answer(ServerStatus {
            enabled: false,
            port: 0,
        }));
        let discovery = CachedDiscovery::new(
            RemoteDiscovery::new(connector.clone()),
            Duration::from_secs(60),
        );

        assert!(discovery.discover("10.0.0.5:3500", "b", "p").await.is_err());
        assert!(discovery.discover("10.0.0.5:3500", "b", "p").await.is_err());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }
}
