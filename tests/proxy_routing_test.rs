//! End-to-end routing tests over real sockets.
//!
//! These exercise the dispatcher paths that need no SSH server: unmatched
//! hosts with the fallback off (502), direct forwarding and CONNECT
//! tunneling with the fallback on, and the error statuses for endpoints
//! whose bastion cannot be reached.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use sshttp::config::{Config, Endpoint};
use sshttp::Dispatcher;

/// Run the proxy accept loop on an ephemeral port, returning its address
/// and the token that stops it.
async fn spawn_proxy(mut config: Config) -> (SocketAddr, CancellationToken) {
    config.bind = "127.0.0.1:0".to_string();
    let listener = TcpListener::bind(&config.bind).await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");

    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(config, cancel.child_token());
    let loop_cancel = cancel.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { break };
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let dispatcher = dispatcher.clone();
                            async move { Ok::<_, Infallible>(dispatcher.dispatch(req).await) }
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .with_upgrades()
                            .await;
                    });
                }
            }
        }
    });

    (addr, cancel)
}

/// Minimal HTTP origin answering every request with `200` and body `hi`.
async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let addr = listener.local_addr().expect("backend addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                // One request per connection is enough for these tests.
                let Ok(n) = socket.read(&mut buf).await else {
                    return;
                };
                if n == 0 {
                    return;
                }
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi")
                    .await;
            });
        }
    });

    addr
}

/// Raw TCP echo server for CONNECT pass-through checks.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Read from the stream until the end of the HTTP header section.
async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte)).await {
            Ok(Ok(1)) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).to_string()
}

async fn read_to_end_lossy(stream: &mut TcpStream) -> String {
    let mut body = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut body)).await;
    String::from_utf8_lossy(&body).to_string()
}

#[tokio::test]
async fn test_no_route_fallback_off_returns_502() {
    let (proxy, cancel) = spawn_proxy(Config::default()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"GET http://nope.example/ HTTP/1.1\r\nHost: nope.example\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502"), "got: {head}");

    cancel.cancel();
}

#[tokio::test]
async fn test_connect_no_route_fallback_off_returns_502() {
    let (proxy, cancel) = spawn_proxy(Config::default()).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"CONNECT nope.example:443 HTTP/1.1\r\nHost: nope.example:443\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502"), "got: {head}");

    cancel.cancel();
}

#[tokio::test]
async fn test_fallback_forwards_plain_requests_directly() {
    let backend = spawn_backend().await;
    let config = Config {
        proxy_fallback: true,
        ..Config::default()
    };
    let (proxy, cancel) = spawn_proxy(config).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!(
        "GET http://{backend}/ HTTP/1.1\r\nHost: {backend}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
    let body = read_to_end_lossy(&mut stream).await;
    assert!(body.ends_with("hi"), "got body: {body}");

    cancel.cancel();
}

#[tokio::test]
async fn test_fallback_connect_tunnels_raw_bytes() {
    let echo = spawn_echo().await;
    let config = Config {
        proxy_fallback: true,
        ..Config::default()
    };
    let (proxy, cancel) = spawn_proxy(config).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

    // After the 200 the stream is an opaque tunnel; the echo server must
    // see our bytes exactly and vice versa.
    stream.write_all(b"opaque \x00\x01 bytes").await.unwrap();
    let mut echoed = [0u8; 15];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"opaque \x00\x01 bytes");

    cancel.cancel();
}

#[tokio::test]
async fn test_fallback_connect_to_dead_target_returns_503() {
    let config = Config {
        proxy_fallback: true,
        ..Config::default()
    };
    let (proxy, cancel) = spawn_proxy(config).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 503"), "got: {head}");

    cancel.cancel();
}

#[tokio::test]
async fn test_endpoint_with_unreadable_key_returns_502() {
    let config = Config {
        endpoints: vec![Endpoint {
            vhost: "api.example".to_string(),
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: 1,
            username: "deploy".to_string(),
            ssh_key: Some("/nonexistent/sshttp-test-key".into()),
            connect_timeout_secs: 1,
            backend_addr: "127.0.0.1:80".to_string(),
        }],
        ..Config::default()
    };
    let (proxy, cancel) = spawn_proxy(config).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"GET http://api.example/ HTTP/1.1\r\nHost: api.example\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502"), "got: {head}");

    cancel.cancel();
}

#[tokio::test]
async fn test_connect_to_endpoint_with_dead_bastion_returns_503() {
    // The CONNECT authority carries a port; routing must still find the
    // portless vhost, and the SSH dial failure maps to 503 for CONNECT.
    let config = Config {
        endpoints: vec![Endpoint {
            vhost: "api.example".to_string(),
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: 1,
            username: "deploy".to_string(),
            ssh_key: Some("/nonexistent/sshttp-test-key".into()),
            connect_timeout_secs: 1,
            backend_addr: "127.0.0.1:80".to_string(),
        }],
        ..Config::default()
    };
    let (proxy, cancel) = spawn_proxy(config).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(b"CONNECT api.example:443 HTTP/1.1\r\nHost: api.example:443\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 503"), "got: {head}");

    cancel.cancel();
}
