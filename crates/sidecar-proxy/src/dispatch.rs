//! Request dispatch: decide where a request goes, then send it there.
//!
//! Every decision is made up front by [`Dispatcher::decide`], which yields
//! either a route to forward on or a fully formed rejection. Rejections are
//! answered locally with a JSON error body; only the forward itself can fail
//! with an error value.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::config::ServerConfig;
use crate::discovery::PeerDiscovery;
use crate::error::{ErrorCode, Rejection};
use crate::forward::{self, ForwardError};
use crate::identity::{self, ResolvedIdentity};
use crate::resolver::{NameResolver, ResolveRequest};
use crate::transport::{self, AddressResolver, PinnedTransport, TransportCache};

/// Header naming the destination identity (`<id>` or `<id>.<namespace>`).
pub const DESTINATION_APP_ID_HEADER: &str = "destination-app-id";

/// Where an accepted request is sent.
#[derive(Debug)]
pub enum Route {
    /// The co-located application, over loopback.
    Local { authority: String },
    /// A peer sidecar's data-plane listener, at the transport's address.
    Remote {
        identity: ResolvedIdentity,
        transport: Arc<PinnedTransport>,
    },
}

impl Route {
    pub fn label(&self) -> &'static str {
        match self {
            Route::Local { .. } => "local",
            Route::Remote { .. } => "remote",
        }
    }
}

#[derive(Debug)]
pub enum Decision {
    Forward(Route),
    Reject(Rejection),
}

/// Routes requests to the local app or to remote peers.
pub struct Dispatcher {
    config: ServerConfig,
    resolver: Arc<dyn NameResolver>,
    discovery: Arc<dyn PeerDiscovery>,
    transports: TransportCache,
    dial_resolver: AddressResolver,
    local: PinnedTransport,
    max_body_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        config: ServerConfig,
        resolver: Arc<dyn NameResolver>,
        discovery: Arc<dyn PeerDiscovery>,
        transports: TransportCache,
        local_client: reqwest::Client,
        max_body_bytes: usize,
    ) -> Self {
        let local = PinnedTransport::new(
            format!("127.0.0.1:{}", config.application_port),
            local_client,
        );
        Self {
            config,
            resolver,
            discovery,
            transports,
            dial_resolver: transport::system_resolver(),
            local,
            max_body_bytes,
        }
    }

    /// Loopback authority of the co-located application.
    pub fn local_authority(&self) -> &str {
        self.local.address()
    }

    /// Classify a request by its headers. Never fails: problems become a
    /// [`Decision::Reject`].
    pub async fn decide(&self, headers: &HeaderMap) -> Decision {
        let raw = match destination_header(headers) {
            Some(raw) => raw,
            None => {
                tracing::debug!("request did not contain Destination-App-Id header");
                return Decision::Reject(Rejection::bad_request(
                    ErrorCode::MissingAppId,
                    "the appid must be specified using the Destination-App-Id header",
                ));
            }
        };
        tracing::Span::current().record("destination", raw);

        let target = match identity::parse(&self.config.namespace, raw) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(error = %e, "request contained invalid Destination-App-Id header");
                return Decision::Reject(Rejection::bad_request(
                    ErrorCode::MissingAppId,
                    format!("the appid {raw} is invalid"),
                ));
            }
        };

        if target.is(&self.config.app_id, &self.config.namespace) {
            return Decision::Forward(Route::Local {
                authority: self.local_authority().to_string(),
            });
        }

        self.decide_remote(target).await
    }

    async fn decide_remote(&self, target: ResolvedIdentity) -> Decision {
        let request = ResolveRequest {
            id: target.identity.clone(),
            namespace: target.namespace.clone(),
            port: self.config.proxy_port,
        };
        let resolved = match self.resolver.resolve_id(&request).await {
            Ok(address) => address,
            Err(e) => {
                tracing::debug!(error = %e, destination = %target.original, "request destination app-id could not be resolved");
                return Decision::Reject(Rejection::bad_request(
                    ErrorCode::UnresolvedAppId,
                    format!("the appid {} cannot be resolved to a destination", target.original),
                ));
            }
        };

        let address = match self
            .discovery
            .discover(&resolved, &target.identity, &target.namespace)
            .await
        {
            Ok(address) => address,
            Err(e) => {
                tracing::debug!(error = %e, resolved = %resolved, "remote proxy discovery failed");
                return Decision::Reject(Rejection::internal(format!(
                    "the proxy for appid {} could not be reached",
                    target.original
                )));
            }
        };

        match self.transports.get(&address, self.dial_resolver.clone()) {
            Ok(transport) => {
                tracing::debug!(
                    destination = %target.original,
                    resolved = %resolved,
                    address = %transport.address(),
                    "Routing to remote peer"
                );
                Decision::Forward(Route::Remote {
                    identity: target,
                    transport,
                })
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to create transport");
                Decision::Reject(Rejection::internal("failed to create transport"))
            }
        }
    }

    /// Decide, then either answer with the rejection or forward.
    ///
    /// Forward failures are returned unchanged for the server layer to render.
    pub async fn dispatch(&self, request: Request) -> Result<Response, ForwardError> {
        let decision = self.decide(request.headers()).await;

        match decision {
            Decision::Reject(rejection) => {
                tracing::Span::current().record("route", "rejected");
                Ok(rejection.into_response())
            }
            Decision::Forward(route) => {
                tracing::Span::current().record("route", route.label());
                match route {
                    Route::Local { .. } => {
                        forward::forward(&self.local, "local", request, self.max_body_bytes).await
                    }
                    Route::Remote {
                        identity,
                        transport,
                    } => {
                        let result =
                            forward::forward(&transport, "remote", request, self.max_body_bytes)
                                .await;
                        if matches!(result, Err(ForwardError::Upstream { .. })) {
                            self.discovery
                                .invalidate(&identity.identity, &identity.namespace);
                        }
                        result
                    }
                }
            }
        }
    }
}

/// The single, non-empty `Destination-App-Id` value, if there is one.
fn destination_header(headers: &HeaderMap) -> Option<&str> {
    let mut values = headers.get_all(DESTINATION_APP_ID_HEADER).iter();
    let value = values.next()?;
    if values.next().is_some() {
        return None;
    }
    value.to_str().ok().filter(|v| !v.is_empty())
}
