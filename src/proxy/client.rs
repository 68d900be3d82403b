//! Per-endpoint forwarding client.
//!
//! A [`ForwardingClient`] owns at most one live SSH session to its
//! endpoint's bastion and serves every request routed to that endpoint:
//! plain requests are relayed through the pooled HTTP pipeline, `CONNECT`
//! requests are hijacked into a raw bidirectional tunnel. The session is
//! established lazily on the first dial and re-established once, in place,
//! when a channel open reveals a dead transport.

use anyhow::Result;
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::http::uri::{Parts, PathAndQuery, Uri};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use russh::keys::PrivateKey;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dialer::{BoxedStream, Dialer};
use super::pipeline::{HttpPipeline, PoolHandle};
use super::{empty_body, idle, status_response, tunnel, ProxyBody};
use crate::config::Endpoint;
use crate::ssh::{self, Session};

/// Private key resolved once when the client is built. A failed load is
/// kept around so later requests fail fast instead of re-reading the
/// filesystem.
enum LoadedKey {
    Ready(Arc<PrivateKey>),
    Missing,
    Unreadable(String),
}

impl LoadedKey {
    fn load(endpoint: &Endpoint) -> Self {
        match &endpoint.ssh_key {
            None => LoadedKey::Missing,
            Some(path) => match russh::keys::load_secret_key(path, None) {
                Ok(key) => LoadedKey::Ready(Arc::new(key)),
                Err(err) => LoadedKey::Unreadable(err.to_string()),
            },
        }
    }
}

/// Lazily connected SSH transport with the session-lifecycle lock.
///
/// The mutex guards only establish, teardown, and channel-open; data flow on
/// the streams it hands out never holds it.
pub struct SshDialer {
    endpoint: Arc<Endpoint>,
    key: LoadedKey,
    key_failure_reported: AtomicBool,
    session: Mutex<Option<Session>>,
    idle_signal: idle::IdleSignal,
    idle_timeout: Duration,
    cancel: CancellationToken,
    generation: AtomicU64,
    pool: OnceLock<PoolHandle>,
    weak: Weak<SshDialer>,
}

impl SshDialer {
    fn new(
        endpoint: Arc<Endpoint>,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let key = LoadedKey::load(&endpoint);
        Arc::new_cyclic(|weak| Self {
            endpoint,
            key,
            key_failure_reported: AtomicBool::new(false),
            session: Mutex::new(None),
            idle_signal: idle::IdleSignal::new(),
            idle_timeout,
            cancel,
            generation: AtomicU64::new(0),
            pool: OnceLock::new(),
            weak: weak.clone(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Lossy reset of the idle timer; called once per served request.
    pub fn poke_idle(&self) {
        self.idle_signal.poke();
    }

    /// Open a forwarded stream to `addr` through the bastion.
    ///
    /// Establishes the SSH session if none is live. A channel-open failure
    /// on an apparently dead transport triggers exactly one teardown and
    /// reconnect; every other failure propagates as-is.
    async fn dial_ssh(&self, addr: &str) -> Result<BoxedStream, ssh::Error> {
        let key = match &self.key {
            LoadedKey::Ready(key) => Arc::clone(key),
            LoadedKey::Missing => {
                return Err(self.key_failure(ssh::Error::KeyMissing(self.endpoint.vhost.clone())));
            }
            LoadedKey::Unreadable(reason) => {
                return Err(self.key_failure(ssh::Error::Key(reason.clone())));
            }
        };

        let mut slot = self.session.lock().await;
        let mut retried = false;

        loop {
            if slot.is_none() {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                let session = Session::connect(
                    &self.endpoint,
                    Arc::clone(&key),
                    generation,
                    self.cancel.child_token(),
                )
                .await?;
                info!("SSH connection to {} established", session.remote_addr());
                self.arm_idle_timer(&session);
                *slot = Some(session);
            }
            let Some(session) = slot.as_ref() else {
                continue;
            };

            match session.open_channel(addr).await {
                Ok(stream) => {
                    debug!(
                        "TCP forwarding via {} to {} established",
                        session.remote_addr(),
                        addr
                    );
                    return Ok(Box::new(stream));
                }
                Err(err) => {
                    let lost = err.indicates_connection_lost() || !session.is_alive().await;
                    if !retried && lost {
                        info!(
                            "SSH connection to {} is dead, reconnecting",
                            session.remote_addr()
                        );
                        self.teardown_slot(&mut slot).await;
                        retried = true;
                        continue;
                    }
                    warn!(
                        "TCP forwarding via {} to {} failed: {}",
                        self.endpoint.ssh_addr(),
                        addr,
                        err
                    );
                    return Err(err);
                }
            }
        }
    }

    /// A key problem is permanent for this client's lifetime; log it on
    /// the first request only.
    fn key_failure(&self, err: ssh::Error) -> ssh::Error {
        if !self.key_failure_reported.swap(true, Ordering::Relaxed) {
            warn!("{}", err);
        }
        err
    }

    /// Start the idle timer for a freshly established session. The timer
    /// refuses to tear down any later session through the generation check.
    fn arm_idle_timer(&self, session: &Session) {
        if self.idle_timeout.is_zero() {
            return;
        }
        let resets = self.idle_signal.arm();
        let session_closed = session.closed();
        let generation = session.generation();
        let remote = session.remote_addr().to_string();
        let idle_timeout = self.idle_timeout;
        let Some(dialer) = self.weak.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            idle::run(idle_timeout, resets, session_closed, || async move {
                debug!("Close SSH connection to {} by idle timeout", remote);
                dialer.teardown_generation(generation).await;
            })
            .await;
        });
    }

    /// Tear down the session, but only if it is still the one the caller
    /// observed. A timer that lost the race against a reconnect must not
    /// kill the successor.
    async fn teardown_generation(&self, generation: u64) {
        let mut slot = self.session.lock().await;
        if slot.as_ref().map(Session::generation) == Some(generation) {
            self.teardown_slot(&mut slot).await;
        }
    }

    /// Call with the session lock held.
    async fn teardown_slot(&self, slot: &mut Option<Session>) {
        self.idle_signal.disarm();
        if let Some(pool) = self.pool.get() {
            pool.clear().await;
        }
        if let Some(session) = slot.take() {
            session.close().await;
        }
    }

    /// Release pooled connections and tear down the session if live.
    /// Idempotent.
    pub async fn close(&self) {
        let mut slot = self.session.lock().await;
        self.teardown_slot(&mut slot).await;
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        Ok(self.dial_ssh(addr).await?)
    }
}

/// Per-endpoint request handler: SSH dialer + backend pipeline + tunnels.
pub struct ForwardingClient {
    dialer: Arc<SshDialer>,
    pipeline: HttpPipeline<SshDialer>,
    cancel: CancellationToken,
}

impl ForwardingClient {
    /// Build the client for one endpoint. Nothing connects until the first
    /// request; cancellation of `cancel` closes whatever is live.
    pub fn new(
        endpoint: Endpoint,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let endpoint = Arc::new(endpoint);
        let dialer = SshDialer::new(endpoint, idle_timeout, cancel.clone());
        let pipeline = HttpPipeline::new(Arc::clone(&dialer));
        let _ = dialer.pool.set(pipeline.pool());

        let client = Arc::new(Self {
            dialer,
            pipeline,
            cancel,
        });

        let watcher = Arc::clone(&client);
        tokio::spawn(async move {
            watcher.cancel.cancelled().await;
            watcher.close().await;
        });

        client
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.dialer.endpoint()
    }

    /// Handle one inbound request destined for this endpoint.
    pub async fn serve(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        self.dialer.poke_idle();

        if req.method() == Method::CONNECT {
            self.serve_connect(req).await
        } else {
            self.serve_http(req).await
        }
    }

    /// `CONNECT`: dial the backend through SSH, answer `200 OK`, then hand
    /// the hijacked inbound stream to the tunnel.
    async fn serve_connect(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if !hijack_supported(&req) {
            return status_response(StatusCode::INTERNAL_SERVER_ERROR, "Hijacking not supported");
        }

        let target = self.endpoint().backend_addr.clone();
        let backend = match self.dialer.dial(&target).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("CONNECT to {} failed: {:#}", target, err);
                return status_response(StatusCode::SERVICE_UNAVAILABLE, &format!("{err:#}"));
            }
        };

        spawn_connect_tunnel(req, backend, self.cancel.child_token())
    }

    /// Plain request: retarget at the backend and relay verbatim through
    /// the pipeline. Redirects come back to the caller untouched.
    async fn serve_http(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let target = self.endpoint().backend_addr.clone();
        if let Err(response) = prepare_backend_request(&mut req) {
            return response;
        }

        match self.pipeline.request(&target, req).await {
            Ok(response) => response,
            Err(err) => {
                warn!("request to backend {} failed: {:#}", target, err);
                status_response(StatusCode::BAD_GATEWAY, &format!("{err:#}"))
            }
        }
    }

    /// Release pooled connections and close the SSH session. Idempotent;
    /// a later request simply reconnects.
    pub async fn close(&self) {
        self.dialer.close().await;
    }
}

/// Whether the HTTP framework can hand over the raw inbound stream.
pub(crate) fn hijack_supported<B>(req: &Request<B>) -> bool {
    req.extensions().get::<OnUpgrade>().is_some()
}

/// Answer `200 OK` and splice the hijacked inbound stream onto `backend`.
///
/// The upgrade completes only after the framework has flushed the response,
/// so the tunnel task starts copying exactly when the client begins sending
/// tunnel bytes.
pub(crate) fn spawn_connect_tunnel(
    req: Request<Incoming>,
    backend: BoxedStream,
    cancel: CancellationToken,
) -> Response<ProxyBody> {
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let _ = tunnel::run(TokioIo::new(upgraded), backend, cancel).await;
            }
            Err(err) => warn!("inbound connection hijack failed: {}", err),
        }
    });

    Response::new(empty_body())
}

/// Rewrite a proxied request into the origin-form request the backend
/// expects: strip the absolute-form authority, keep the inbound `Host`
/// header, drop proxy-hop headers.
pub(crate) fn prepare_backend_request<B>(
    req: &mut Request<B>,
) -> Result<(), Response<ProxyBody>> {
    let authority = req.uri().authority().map(|a| a.to_string());

    let mut parts = Parts::default();
    parts.path_and_query = Some(
        req.uri()
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/")),
    );
    *req.uri_mut() = match Uri::from_parts(parts) {
        Ok(uri) => uri,
        Err(_) => {
            return Err(status_response(
                StatusCode::BAD_GATEWAY,
                "invalid request target",
            ))
        }
    };

    if !req.headers().contains_key(HOST) {
        if let Some(authority) = authority {
            if let Ok(value) = HeaderValue::from_str(&authority) {
                req.headers_mut().insert(HOST, value);
            }
        }
    }

    let headers = req.headers_mut();
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove("proxy-connection");

    Ok(())
}
