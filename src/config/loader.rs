//! Configuration loading and default inheritance.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

use super::types::Config;

impl Config {
    /// Load configuration from a YAML file and apply per-endpoint defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.with_context(|| {
            format!(
                "Failed to read configuration file at {}. Please check file permissions and ensure the file is accessible.",
                path.display()
            )
        })?;

        let mut config: Config = serde_yaml::from_str(&content).with_context(|| {
            format!(
                "Failed to parse YAML configuration file at {}. Please check the YAML syntax is valid.",
                path.display()
            )
        })?;

        config.apply_endpoint_defaults();
        Ok(config)
    }

    /// Fill in endpoint fields that inherit from the top-level defaults.
    ///
    /// Serde already applies the per-field constants (`SSHPort` 22,
    /// `SSHConnectTimeout` 15 s, `ProxyAddress` localhost:80); this pass
    /// handles the two fields that inherit from the document root.
    pub fn apply_endpoint_defaults(&mut self) {
        for ep in &mut self.endpoints {
            if ep.username.is_empty() {
                if let Some(default_user) = &self.default_username {
                    ep.username = default_user.clone();
                }
            }
            if ep.ssh_key.is_none() {
                ep.ssh_key = self.default_ssh_key.clone();
            }
        }
    }
}
