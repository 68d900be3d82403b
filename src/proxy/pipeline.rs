//! Backend HTTP pipeline with a small idle-connection pool.
//!
//! Each forwarding client relays plain (non-`CONNECT`) requests to its
//! backend through one of these. Connections are HTTP/1.1 client
//! connections handshaken over whatever the dialer produces; at most
//! [`MAX_IDLE_CONNS`] finished connections are kept for reuse and expire
//! after [`IDLE_CONN_TIMEOUT`]. Redirects are never followed: the backend
//! response is relayed verbatim.

use anyhow::{Context, Result};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::dialer::{BoxedStream, Dialer};
use super::ProxyBody;

/// Idle pooled connections kept per pipeline.
pub const MAX_IDLE_CONNS: usize = 2;

/// How long an idle pooled connection stays usable.
pub const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(60);

type Sender = http1::SendRequest<Incoming>;

struct IdleConn {
    target: String,
    sender: Sender,
    parked_at: Instant,
}

/// Shared handle on the idle pool. Session teardown clears it so no pooled
/// connection outlives the transport it was handshaken over.
#[derive(Clone)]
pub struct PoolHandle {
    conns: Arc<Mutex<Vec<IdleConn>>>,
}

impl PoolHandle {
    fn new() -> Self {
        Self {
            conns: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Drop every idle connection.
    pub async fn clear(&self) {
        self.conns.lock().await.clear();
    }

    pub async fn idle_count(&self) -> usize {
        self.conns.lock().await.len()
    }

    async fn checkout(&self, target: &str) -> Option<Sender> {
        let mut conns = self.conns.lock().await;
        conns.retain(|c| c.parked_at.elapsed() < IDLE_CONN_TIMEOUT && c.sender.is_ready());
        let pos = conns.iter().position(|c| c.target == target)?;
        let conn = conns.swap_remove(pos);
        trace!("reusing pooled connection to {}", target);
        Some(conn.sender)
    }

    async fn park(&self, target: String, sender: Sender) {
        if !sender.is_ready() {
            return;
        }
        let mut conns = self.conns.lock().await;
        if conns.len() >= MAX_IDLE_CONNS {
            // evict the oldest to stay under the cap
            conns.remove(0);
        }
        conns.push(IdleConn {
            target,
            sender,
            parked_at: Instant::now(),
        });
    }
}

/// HTTP/1.1 user agent that dials through `D`.
pub struct HttpPipeline<D: Dialer> {
    dialer: Arc<D>,
    idle: PoolHandle,
}

impl<D: Dialer> HttpPipeline<D> {
    pub fn new(dialer: Arc<D>) -> Self {
        Self {
            dialer,
            idle: PoolHandle::new(),
        }
    }

    /// Handle on the idle pool, for teardown paths that must release
    /// pooled connections.
    pub fn pool(&self) -> PoolHandle {
        self.idle.clone()
    }

    /// Issue one request to `target` and return the backend response with
    /// its body streaming through untouched.
    pub async fn request(
        &self,
        target: &str,
        req: Request<Incoming>,
    ) -> Result<Response<ProxyBody>> {
        let mut sender = match self.idle.checkout(target).await {
            Some(sender) => sender,
            None => self.handshake(target).await?,
        };

        let response = sender
            .send_request(req)
            .await
            .with_context(|| format!("request to {target} failed"))?;

        // Re-park once the connection has finished this exchange. `ready()`
        // resolves only after the response body has been fully consumed, so
        // a connection mid-stream never lands back in the pool.
        let pool = self.idle.clone();
        let target = target.to_string();
        tokio::spawn(async move {
            if sender.ready().await.is_ok() {
                pool.park(target, sender).await;
            }
        });

        Ok(response.map(BodyExt::boxed))
    }

    async fn handshake(&self, target: &str) -> Result<Sender> {
        let stream: BoxedStream = self.dialer.dial(target).await?;
        let io = TokioIo::new(stream);
        let (sender, conn) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await
            .with_context(|| format!("HTTP handshake with {target} failed"))?;

        let driven_target = target.to_string();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("backend connection to {} closed: {}", driven_target, err);
            }
        });

        Ok(sender)
    }
}
