//! Loading a realistic configuration file through the public API.

use std::io::Write;
use std::time::Duration;

use sshttp::Config;

#[tokio::test]
async fn test_load_realistic_config_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(
        br#"
Bind: "127.0.0.1:8082"
DefaultUsername: tunnel
DefaultSSHKey: /home/tunnel/.ssh/id_ed25519
IdleTimeout: 600
ProxyFallback: true
Debug: false

Endpoints:
  - VHostname: grafana.internal
    SSHHostname: bastion-a.example
    ProxyAddress: 10.1.0.4:3000

  - VHostname: ci.internal
    SSHHostname: bastion-b.example
    SSHPort: 2222
    Username: ci-tunnel
    SSHConnectTimeout: 30
"#,
    )
    .expect("write config");

    let config = Config::load(file.path()).await.expect("load config");

    assert_eq!(config.bind, "127.0.0.1:8082");
    assert_eq!(config.idle_timeout(), Duration::from_secs(600));
    assert!(config.proxy_fallback);
    assert_eq!(config.endpoints.len(), 2);

    let grafana = config.endpoint_for("grafana.internal").expect("grafana");
    assert_eq!(grafana.username, "tunnel");
    assert_eq!(grafana.ssh_addr(), "bastion-a.example:22");
    assert_eq!(grafana.backend_addr, "10.1.0.4:3000");
    assert_eq!(grafana.connect_timeout(), Duration::from_secs(15));

    let ci = config.endpoint_for("ci.internal").expect("ci");
    assert_eq!(ci.username, "ci-tunnel");
    assert_eq!(ci.ssh_addr(), "bastion-b.example:2222");
    assert_eq!(ci.connect_timeout(), Duration::from_secs(30));
    assert_eq!(
        ci.ssh_key.as_deref(),
        Some(std::path::Path::new("/home/tunnel/.ssh/id_ed25519"))
    );
}

#[tokio::test]
async fn test_load_rejects_malformed_yaml() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"Endpoints:\n  - VHostname: [oops\n").expect("write");

    assert!(Config::load(file.path()).await.is_err());
}
