use std::fmt;
use std::time::Duration;

/// Error type for SSH session operations
#[derive(Debug)]
pub enum Error {
    /// No private key configured for the endpoint
    KeyMissing(String),
    /// Private key could not be read or parsed; carries the load failure.
    /// The key is loaded once per endpoint, so this reproduces the original
    /// cause on every later request without touching the filesystem.
    Key(String),
    /// TCP dial, SSH handshake, or protocol failure while connecting
    Connect(russh::Error),
    /// The connect timeout elapsed before the handshake completed
    ConnectTimeout { addr: String, timeout: Duration },
    /// The server rejected public-key authentication
    AuthFailed { user: String },
    /// direct-tcpip channel open failed on a live session
    Channel(russh::Error),
    /// Target address was not a valid `host:port` pair
    AddressInvalid(String),
}

impl Error {
    /// Whether this error means the SSH transport itself is gone, as opposed
    /// to a per-channel refusal on a healthy session. Drives the
    /// teardown-and-reconnect retry on dial.
    pub fn indicates_connection_lost(&self) -> bool {
        match self {
            Error::Channel(e) | Error::Connect(e) => transport_gone(e),
            _ => false,
        }
    }
}

fn transport_gone(err: &russh::Error) -> bool {
    matches!(
        err,
        russh::Error::Disconnect
            | russh::Error::HUP
            | russh::Error::SendError
            | russh::Error::IO(_)
    )
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::KeyMissing(vhost) => {
                write!(f, "no SSH key configured for endpoint {}", vhost)
            }
            Error::Key(e) => write!(f, "cannot load private key: {}", e),
            Error::Connect(e) => write!(f, "SSH connect failed: {}", e),
            Error::ConnectTimeout { addr, timeout } => {
                write!(f, "SSH connect to {} timed out after {:?}", addr, timeout)
            }
            Error::AuthFailed { user } => {
                write!(f, "SSH authentication failed for user {}", user)
            }
            Error::Channel(e) => write!(f, "SSH channel open failed: {}", e),
            Error::AddressInvalid(addr) => write!(f, "invalid target address: {}", addr),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connect(e) | Error::Channel(e) => Some(e),
            _ => None,
        }
    }
}
