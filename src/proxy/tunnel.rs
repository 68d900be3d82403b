//! Bidirectional byte relay for `CONNECT` tunnels.
//!
//! Once the inbound connection is hijacked, the tunnel copies raw bytes
//! between it and the backend stream until either side closes, an I/O error
//! occurs, or the cancellation token fires. Both sides are shut down on
//! every exit path.

use std::io;
use std::time::Instant;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Byte counters for one completed tunnel.
#[derive(Debug, Default)]
pub struct TunnelStats {
    /// Bytes copied from the inbound client to the backend.
    pub client_to_backend: u64,
    /// Bytes copied from the backend to the inbound client.
    pub backend_to_client: u64,
}

impl TunnelStats {
    pub fn total_bytes(&self) -> u64 {
        self.client_to_backend + self.backend_to_client
    }
}

/// Copy bytes in both directions until one side closes or the token fires.
pub async fn run<C, B>(
    mut client: C,
    mut backend: B,
    cancel: CancellationToken,
) -> io::Result<TunnelStats>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let started_at = Instant::now();

    let copied = tokio::select! {
        result = copy_bidirectional(&mut client, &mut backend) => Some(result),
        _ = cancel.cancelled() => {
            trace!("tunnel cancelled");
            None
        }
    };

    // Whatever ended the copy, close both sides so the peer is not left
    // half-open.
    let _ = client.shutdown().await;
    let _ = backend.shutdown().await;

    match copied {
        Some(Ok((client_to_backend, backend_to_client))) => {
            let stats = TunnelStats {
                client_to_backend,
                backend_to_client,
            };
            debug!(
                "tunnel completed: {} bytes out, {} bytes in, duration {:?}",
                stats.client_to_backend,
                stats.backend_to_client,
                started_at.elapsed()
            );
            Ok(stats)
        }
        Some(Err(err)) => {
            // Mid-stream failure: both sides are already closed above, the
            // error is not reportable to the HTTP client anymore.
            debug!("tunnel ended with error: {}", err);
            Err(err)
        }
        None => Ok(TunnelStats::default()),
    }
}
