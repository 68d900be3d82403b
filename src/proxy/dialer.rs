//! The dial seam between HTTP plumbing and transports.
//!
//! The pipeline and the `CONNECT` path do not care whether bytes travel
//! through an SSH channel or a plain TCP socket; they dial through this
//! trait. The per-endpoint SSH dialer lives in [`super::client`]; the
//! direct dialer here backs the proxy-fallback path.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Bidirectional byte stream produced by a dialer.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Opens a byte stream to a `host:port` target.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, addr: &str) -> Result<BoxedStream>;
}

/// Plain TCP dialer used when a request matches no endpoint and the
/// fallback flag is set.
#[derive(Debug, Clone)]
pub struct DirectDialer {
    pub connect_timeout: Duration,
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
        }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("dial to {addr} timed out"))?
            .with_context(|| format!("dial to {addr} failed"))?;
        Ok(Box::new(stream))
    }
}
