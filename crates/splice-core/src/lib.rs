//! An intercepting HTTP/HTTPS forward proxy. Plain requests are forwarded to
//! their declared origins through a caller-supplied [`RoundTrip`] callable;
//! `CONNECT` requests for `host:443` are answered by impersonating the origin
//! with a leaf certificate forged under a configured [`SigningAuthority`],
//! after which the same request loop runs over TLS.
//!
//! The proxy never opens outbound connections itself; the round-trip callable
//! owns upstream transport, pooling, and DNS.

use std::sync::atomic::AtomicU64;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use splice_observe::{EventSink, NoopEventSink};
use tokio::io::AsyncRead;

mod body;
mod conn;
mod flow;

pub use body::{BodyEnd, BodyStatus, RequestBody};
pub use splice_http::{
    BodyFraming, Fields, HeaderField, HttpVersion, requested_close, scrub_fields,
};
pub use splice_observe as observe;
pub use splice_tls::{ForgeError, ForgedLeaf, SeededRng, SigningAuthority};

/// Errors surfaced by a [`RoundTrip`] implementation.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A response body as produced by the round-trip callable.
pub type ResponseBody = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// A request as handed to the round-trip callable. `scheme` and `remote` are
/// populated by the proxy before dispatch; `target` is in path form for plain
/// proxied requests and exactly as the client sent it inside a tunnel.
pub struct Request<'a> {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub fields: Fields,
    pub scheme: Scheme,
    pub remote: String,
    pub body: Option<RequestBody<'a>>,
}

pub struct Response {
    pub status: u16,
    pub reason: String,
    pub version: HttpVersion,
    pub fields: Fields,
    pub body: Option<ResponseBody>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("version", &self.version)
            .field("fields", &self.fields)
            .field("body", &self.body.as_ref().map(|_| "<body>"))
            .finish()
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: splice_http::reason_phrase(status).to_string(),
            version: HttpVersion::Http11,
            fields: Fields::new(),
            body: None,
        }
    }
}

/// Performs the upstream call for a proxied request. Implementations must be
/// reentrant; the proxy invokes them concurrently from many connections and
/// always with `Connection: keep-alive` already set on the request.
#[async_trait]
pub trait RoundTrip: Send + Sync {
    async fn round_trip(&self, request: Request<'_>) -> Result<Response, BoxError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Upper bound on a message head; larger heads are treated as malformed.
    pub max_head_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
        }
    }
}

/// The proxy facade. One instance serves many connections concurrently; all
/// shared state (the signing authority, the round-trip callable, the event
/// sink) is read-only after construction.
pub struct Proxy<R, S = NoopEventSink>
where
    R: RoundTrip + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    config: ProxyConfig,
    authority: Option<SigningAuthority>,
    round_trip: R,
    sink: S,
    next_connection_id: AtomicU64,
}

impl<R> Proxy<R>
where
    R: RoundTrip + Send + Sync + 'static,
{
    pub fn new(config: ProxyConfig, authority: Option<SigningAuthority>, round_trip: R) -> Self {
        Self::with_sink(config, authority, round_trip, NoopEventSink)
    }
}

impl<R, S> Proxy<R, S>
where
    R: RoundTrip + Send + Sync + 'static,
    S: EventSink + Send + Sync + 'static,
{
    pub fn with_sink(
        config: ProxyConfig,
        authority: Option<SigningAuthority>,
        round_trip: R,
        sink: S,
    ) -> Self {
        Self {
            config,
            authority,
            round_trip,
            sink,
            next_connection_id: AtomicU64::new(1),
        }
    }
}
