use anyhow::{Context, Result};
use clap::Parser;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use sshttp::{Cli, Config, Dispatcher};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .await
        .with_context(|| format!("cannot load config from {}", cli.config.display()))?;

    init_logging(cli.verbose, config.debug);
    info!(
        "config loaded: {} endpoint(s), bind {}, fallback {}",
        config.endpoints.len(),
        config.bind,
        if config.proxy_fallback { "on" } else { "off" }
    );

    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("cannot bind to {}", config.bind))?;
    info!("proxy listening on {}", config.bind);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let dispatcher = Dispatcher::new(config, cancel.child_token());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        let dispatcher = dispatcher.clone();
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let dispatcher = dispatcher.clone();
                                async move {
                                    Ok::<_, Infallible>(dispatcher.dispatch(req).await)
                                }
                            });
                            let connection = http1::Builder::new()
                                .preserve_header_case(true)
                                .serve_connection(TokioIo::new(stream), service)
                                .with_upgrades();
                            if let Err(err) = connection.await {
                                debug!("connection from {} ended: {}", peer_addr, err);
                            }
                        });
                    }
                    Err(err) => {
                        error!("accept failed: {}", err);
                        // Avoid a busy loop on persistent accept errors.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    dispatcher.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

fn init_logging(verbosity: u8, debug: bool) {
    let filter = match (verbosity, debug) {
        (0, false) => EnvFilter::new("sshttp=info"),
        (0, true) | (1, _) => EnvFilter::new("sshttp=debug"),
        _ => EnvFilter::new("sshttp=trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(err) => {
                    error!("cannot install SIGTERM handler: {}", err);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        info!("shutting down");
        cancel.cancel();
    });
}
