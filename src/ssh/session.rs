//! A single authenticated SSH transport to one bastion host.

use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{ChannelStream, Disconnect};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::Error;
use crate::config::Endpoint;

/// An authenticated SSH connection capable of multiplexing outbound TCP
/// channels. Owned exclusively by one forwarding client at a time.
pub struct Session {
    handle: Handle<AcceptingHandler>,
    token: CancellationToken,
    generation: u64,
    remote_addr: String,
}

impl Session {
    /// Dial the bastion and authenticate with the supplied private key.
    /// The key is resolved by the owning client when it is constructed.
    ///
    /// The whole dial + handshake + key exchange is capped by the endpoint's
    /// connect timeout. Authentication is public-key only.
    pub async fn connect(
        endpoint: &Endpoint,
        key: Arc<PrivateKey>,
        generation: u64,
        token: CancellationToken,
    ) -> Result<Self, Error> {
        let addr = endpoint.ssh_addr();
        let config = Arc::new(client::Config::default());

        let mut handle = timeout(
            endpoint.connect_timeout(),
            client::connect(
                config,
                (endpoint.ssh_host.as_str(), endpoint.ssh_port),
                AcceptingHandler,
            ),
        )
        .await
        .map_err(|_| Error::ConnectTimeout {
            addr: addr.clone(),
            timeout: endpoint.connect_timeout(),
        })?
        .map_err(Error::Connect)?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(Error::Connect)?
            .flatten();
        let auth = handle
            .authenticate_publickey(
                &endpoint.username,
                PrivateKeyWithHashAlg::new(key, hash_alg),
            )
            .await
            .map_err(Error::Connect)?;
        if !auth.success() {
            return Err(Error::AuthFailed {
                user: endpoint.username.clone(),
            });
        }

        Ok(Self {
            handle,
            token,
            generation,
            remote_addr: addr,
        })
    }

    /// Open a direct-tcpip channel to `addr` (`host:port`) through the
    /// bastion. The returned stream closes only the channel when dropped,
    /// never the session.
    pub async fn open_channel(&self, addr: &str) -> Result<ChannelStream<Msg>, Error> {
        let (host, port) = split_host_port(addr)?;
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(Error::Channel)?;
        Ok(channel.into_stream())
    }

    /// Reactive liveness probe: an OpenSSH keepalive global request with
    /// `want-reply`. Any failure means the transport is dead.
    pub async fn is_alive(&self) -> bool {
        self.handle.send_keepalive(true).await.is_ok()
    }

    /// Cancelled when the session is torn down, whichever path triggers it.
    /// Derived work (tunnels, timers) selects on this to unwind.
    pub fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Monotonic establish counter within one forwarding client. Lets the
    /// idle timer refuse to tear down a successor session.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Disconnect and fire the termination signal. Safe to call on an
    /// already-dead transport.
    pub async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await;
        self.token.cancel();
        debug!("SSH connection to {} closed", self.remote_addr);
    }
}

fn split_host_port(addr: &str) -> Result<(&str, u16), Error> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::AddressInvalid(addr.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::AddressInvalid(addr.to_string()))?;
    Ok((host, port))
}

/// Host-key handler that accepts any server key, preserving the behavior of
/// the deployments this proxy fronts. See DESIGN.md for the known-hosts
/// follow-up.
#[derive(Debug, Clone)]
struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
