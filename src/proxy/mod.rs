//! HTTP(S) forwarding proxy core.
//!
//! The proxy accepts ordinary forward-proxy traffic (plain requests and
//! `CONNECT` tunnels), routes each request by its inbound `Host` to a
//! per-endpoint forwarding client, and relays the traffic to the endpoint's
//! backend through a multiplexed SSH session.
//!
//! # Architecture
//!
//! ```text
//! [Browser] → [Dispatcher] → [ForwardingClient] → [SSH channel] → [Backend]
//!                  │                 │
//!                  │                 ├─ HttpPipeline (pooled backend conns)
//!                  │                 └─ IdleSignal → idle timer → teardown
//!                  └─ fallback: direct dial / 502
//! ```

pub mod client;
pub mod dialer;
pub mod dispatcher;
pub mod idle;
pub mod pipeline;
pub mod tunnel;

pub use client::ForwardingClient;
pub use dialer::{BoxedStream, Dialer, DirectDialer};
pub use dispatcher::Dispatcher;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Response, StatusCode};

/// Unified response body: relayed backend bodies, empty tunnel responses,
/// and short error messages all box into this.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full_body<T: Into<Bytes>>(data: T) -> ProxyBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// A bare status response with a short plain-text message. Pre-hijack
/// failures are the only place the proxy writes its own body.
pub(crate) fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response
}
