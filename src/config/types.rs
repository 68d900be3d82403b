//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure.
///
/// Field names mirror the YAML keys accepted in the configuration file.
/// Durations are integer seconds; an `IdleTimeout` of 0 disables the idle
/// session teardown entirely.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(rename = "Bind", default = "default_bind")]
    pub bind: String,

    #[serde(rename = "DefaultSSHKey", default)]
    pub default_ssh_key: Option<PathBuf>,

    #[serde(rename = "DefaultUsername", default)]
    pub default_username: Option<String>,

    /// Seconds a live SSH session may sit idle before it is closed.
    #[serde(rename = "IdleTimeout", default)]
    pub idle_timeout_secs: u64,

    /// Proxy hosts not found in the endpoint list directly to the internet.
    #[serde(rename = "ProxyFallback", default)]
    pub proxy_fallback: bool,

    #[serde(rename = "Debug", default)]
    pub debug: bool,

    #[serde(rename = "Endpoints", default)]
    pub endpoints: Vec<Endpoint>,
}

/// One virtual-host endpoint: a `Host` routing key paired with the SSH
/// bastion that can reach its backend.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Endpoint {
    #[serde(rename = "VHostname")]
    pub vhost: String,

    #[serde(rename = "SSHHostname")]
    pub ssh_host: String,

    #[serde(rename = "SSHPort", default = "default_ssh_port")]
    pub ssh_port: u16,

    #[serde(rename = "Username", default)]
    pub username: String,

    #[serde(rename = "SSHKey", default)]
    pub ssh_key: Option<PathBuf>,

    /// Seconds allowed for the TCP dial + SSH handshake.
    #[serde(rename = "SSHConnectTimeout", default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Backend `host:port` reachable from inside the bastion's network.
    #[serde(rename = "ProxyAddress", default = "default_proxy_address")]
    pub backend_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            default_ssh_key: None,
            default_username: None,
            idle_timeout_secs: 0,
            proxy_fallback: false,
            debug: false,
            endpoints: Vec::new(),
        }
    }
}

impl Config {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Find the configured endpoint claiming the given `Host` value.
    /// The match is exact and case-sensitive.
    pub fn endpoint_for(&self, vhost: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|ep| ep.vhost == vhost)
    }
}

impl Endpoint {
    /// Bastion address in `host:port` form.
    pub fn ssh_addr(&self) -> String {
        format!("{}:{}", self.ssh_host, self.ssh_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_bind() -> String {
    "localhost:8082".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_proxy_address() -> String {
    "localhost:80".to_string()
}
