//! Per-address cache of pinned outbound HTTP clients.
//!
//! Each cached transport dials exactly the address it was created for,
//! whatever authority the inbound request URI names: requests are built
//! through [`PinnedTransport::request`], which always rewrites the URL to the
//! pinned `host:port`. Host names in the pinned address go through the
//! transport's [`AddressResolver`]. Connection pooling then happens inside
//! the client, so repeated forwards to the same peer reuse connections.
//!
//! Entries are never evicted: the cache grows with the number of distinct
//! peer addresses seen over the process lifetime.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{Method, Uri};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use thiserror::Error;

use crate::forward::target_url;

/// Future returned by an [`AddressResolver`].
pub type LookupFuture = Pin<Box<dyn Future<Output = io::Result<Vec<SocketAddr>>> + Send>>;

/// Maps a pinned `host:port` string to the socket addresses to dial.
pub type AddressResolver = Arc<dyn Fn(String) -> LookupFuture + Send + Sync>;

/// Resolver backed by the system resolver (`tokio::net::lookup_host`).
pub fn system_resolver() -> AddressResolver {
    Arc::new(|address: String| -> LookupFuture {
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address).await?.collect();
            Ok::<_, io::Error>(addrs)
        })
    })
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build transport for {address}: {source}")]
    Build {
        address: String,
        #[source]
        source: reqwest::Error,
    },
}

/// DNS hook that answers every lookup with the pinned address.
struct PinnedResolver {
    address: String,
    resolver: AddressResolver,
}

impl Resolve for PinnedResolver {
    fn resolve(&self, _name: Name) -> Resolving {
        let lookup = (self.resolver)(self.address.clone());
        Box::pin(async move {
            let addrs = lookup.await?;
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

/// A reusable client bound to one physical address.
#[derive(Debug)]
pub struct PinnedTransport {
    address: String,
    client: reqwest::Client,
}

impl PinnedTransport {
    /// Wrap an already configured client. Used for the loopback transport,
    /// whose address is an IP literal and needs no DNS hook.
    pub fn new(address: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            address: address.into(),
            client,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Start a request for `uri`'s path and query against the pinned address.
    /// Any scheme or authority in `uri` is ignored.
    pub fn request(&self, method: Method, uri: &Uri) -> reqwest::RequestBuilder {
        self.client.request(method, target_url(&self.address, uri))
    }
}

/// Thread-safe transport cache. Cheap to clone (Arc).
#[derive(Clone)]
pub struct TransportCache {
    transports: Arc<Mutex<HashMap<String, Arc<PinnedTransport>>>>,
    timeout: Option<Duration>,
}

impl TransportCache {
    /// Create an empty cache. `timeout` applies to every request sent
    /// through a cached transport.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            transports: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Return the transport pinned to `address`, creating it on first use.
    ///
    /// The lookup and insert happen under one lock, so concurrent first
    /// callers for the same key all receive the same transport.
    pub fn get(
        &self,
        address: &str,
        resolver: AddressResolver,
    ) -> Result<Arc<PinnedTransport>, TransportError> {
        let mut transports = self.transports.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = transports.get(address) {
            return Ok(existing.clone());
        }

        let pinned = PinnedResolver {
            address: address.to_string(),
            resolver,
        };
        let mut builder = reqwest::Client::builder()
            .dns_resolver(Arc::new(pinned))
            .no_proxy();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|source| TransportError::Build {
            address: address.to_string(),
            source,
        })?;

        let transport = Arc::new(PinnedTransport::new(address, client));
        transports.insert(address.to_string(), transport.clone());
        tracing::debug!(address = %address, cached = transports.len(), "Created pinned transport");

        Ok(transport)
    }

    /// Number of cached transports.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.transports.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
