//! Host-based request routing.
//!
//! The dispatcher owns the `vhost → ForwardingClient` registry. Clients are
//! created on the first request for their vhost; concurrent first requests
//! race on the registry entry and the losers adopt the winner's client.
//! Requests matching no endpoint either go out directly (fallback enabled)
//! or are answered `502 Bad Gateway`.

use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::{Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{
    hijack_supported, prepare_backend_request, spawn_connect_tunnel, ForwardingClient,
};
use super::dialer::{Dialer, DirectDialer};
use super::pipeline::HttpPipeline;
use super::{status_response, ProxyBody};
use crate::config::Config;

/// Shared request handler mapping inbound hosts to forwarding clients.
pub struct Dispatcher {
    config: Config,
    clients: RwLock<HashMap<String, Arc<ForwardingClient>>>,
    fallback: Option<FallbackProxy>,
    cancel: CancellationToken,
}

/// Direct-to-internet proxy used for unmatched hosts when enabled.
struct FallbackProxy {
    dialer: Arc<DirectDialer>,
    pipeline: HttpPipeline<DirectDialer>,
}

impl Dispatcher {
    pub fn new(config: Config, cancel: CancellationToken) -> Arc<Self> {
        let fallback = config.proxy_fallback.then(|| {
            let dialer = Arc::new(DirectDialer::default());
            FallbackProxy {
                pipeline: HttpPipeline::new(Arc::clone(&dialer)),
                dialer,
            }
        });

        Arc::new(Self {
            config,
            clients: RwLock::new(HashMap::new()),
            fallback,
            cancel,
        })
    }

    /// Route one inbound request.
    pub async fn dispatch(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let host = request_host(&req);
        debug!(
            "{} {} {}",
            req.method(),
            host.as_deref().unwrap_or("-"),
            req.uri()
        );

        let Some(host) = host else {
            warn!("request without host");
            return status_response(StatusCode::BAD_GATEWAY, "missing host");
        };

        if let Some(client) = self.lookup(&host).await {
            return client.serve(req).await;
        }
        if let Some(client) = self.create_for(&host).await {
            return client.serve(req).await;
        }

        match &self.fallback {
            Some(fallback) => self.serve_fallback(fallback, &host, req).await,
            None => {
                warn!("host {} not found", host);
                status_response(StatusCode::BAD_GATEWAY, "")
            }
        }
    }

    /// Cancel every client and close their sessions. The accept loop has
    /// already stopped when this runs; in-flight tunnels unwind through
    /// their session tokens.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let clients: Vec<_> = {
            let mut registry = self.clients.write().await;
            registry.drain().collect()
        };
        for (vhost, client) in clients {
            client.close().await;
            debug!("closed tunnel client for {}", vhost);
        }
    }

    async fn lookup(&self, host: &str) -> Option<Arc<ForwardingClient>> {
        let clients = self.clients.read().await;
        if let Some(client) = clients.get(host) {
            return Some(Arc::clone(client));
        }
        // CONNECT authorities carry a port the configured vhost usually
        // omits; retry with the port stripped.
        let (bare, _) = host.rsplit_once(':')?;
        clients.get(bare).map(Arc::clone)
    }

    async fn create_for(&self, host: &str) -> Option<Arc<ForwardingClient>> {
        let endpoint = self
            .config
            .endpoint_for(host)
            .or_else(|| {
                let (bare, _) = host.rsplit_once(':')?;
                self.config.endpoint_for(bare)
            })?
            .clone();

        let mut registry = self.clients.write().await;
        let client = registry
            .entry(endpoint.vhost.clone())
            .or_insert_with(|| {
                info!("opening tunnel client for {}", endpoint.vhost);
                ForwardingClient::new(
                    endpoint,
                    self.config.idle_timeout(),
                    self.cancel.child_token(),
                )
            })
            .clone();
        Some(client)
    }

    /// Generic forward-proxy behavior for hosts outside the endpoint list.
    async fn serve_fallback(
        &self,
        fallback: &FallbackProxy,
        host: &str,
        mut req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            if !hijack_supported(&req) {
                return status_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Hijacking not supported",
                );
            }
            let stream = match fallback.dialer.dial(host).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("direct CONNECT to {} failed: {:#}", host, err);
                    return status_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        &format!("{err:#}"),
                    );
                }
            };
            return spawn_connect_tunnel(req, stream, self.cancel.child_token());
        }

        let target = direct_target(&req).unwrap_or_else(|| {
            if host.contains(':') {
                host.to_string()
            } else {
                format!("{host}:80")
            }
        });
        if let Err(response) = prepare_backend_request(&mut req) {
            return response;
        }
        match fallback.pipeline.request(&target, req).await {
            Ok(response) => response,
            Err(err) => {
                warn!("direct request to {} failed: {:#}", target, err);
                status_response(StatusCode::SERVICE_UNAVAILABLE, &format!("{err:#}"))
            }
        }
    }
}

/// The routing key: the request authority when present (absolute-form and
/// CONNECT requests), otherwise the `Host` header as received.
fn request_host<B>(req: &Request<B>) -> Option<String> {
    if let Some(authority) = req.uri().authority() {
        return Some(authority.to_string());
    }
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Dial target for direct (fallback) plain requests: authority host with
/// the scheme-default port filled in.
fn direct_target<B>(req: &Request<B>) -> Option<String> {
    let host = req.uri().host()?;
    let port = req.uri().port_u16().unwrap_or(80);
    Some(format!("{host}:{port}"))
}
