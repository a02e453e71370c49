//! Faultline: chaos injection and per-IP rate limiting for mock HTTP services.
//!
//! This crate wraps an arbitrary request handler with controlled fault
//! injection (latency, errors, timeouts, corrupted or truncated bodies,
//! circuit breaking, retry-after windows, progressive degradation) and
//! with a sharded per-IP token-bucket rate limiter. It does not implement
//! an HTTP server or router; callers integrate it by implementing the
//! small [`Handler`] and [`ResponseSink`] traits for whatever transport
//! they already have.

pub mod config;
pub mod injector;
pub mod middleware;
pub mod profiles;
pub mod rate_limit;
pub mod resilience;
pub mod writers;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by configuration compilation and request-time handling.
#[derive(Error, Debug)]
pub enum FaultlineError {
    #[error("invalid path pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid duration {0:?}")]
    InvalidDuration(String),

    #[error("write error: {0}")]
    Write(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FaultlineError>;

/// The request-scoped context a [`Handler`] and the chaos pipeline share.
///
/// This is the "request/response pair, plus a cancellation/deadline
/// handle" referred to by the design as the standard request-handling
/// interface. It intentionally knows nothing about any particular web
/// framework.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub path: String,
    pub method: http::Method,
    pub remote_addr: SocketAddr,
    pub headers: Arc<http::HeaderMap>,
    pub cancellation: CancellationToken,
}

impl RequestContext {
    pub fn new(path: impl Into<String>, method: http::Method, remote_addr: SocketAddr) -> Self {
        Self {
            path: path.into(),
            method,
            remote_addr,
            headers: Arc::new(http::HeaderMap::new()),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_headers(mut self, headers: http::HeaderMap) -> Self {
        self.headers = Arc::new(headers);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }
}

/// Capability set a response sink must expose to the writer wrappers and
/// the chaos middleware. Flush and hijack are optional: the defaults make
/// a sink that only supports writes a valid (if limited) implementation.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    /// Write the response status line/headers. Called at most meaningfully
    /// once per response; later calls are implementation-defined.
    async fn write_status(&self, status: u16);

    /// Set a response header.
    async fn set_header(&self, name: &str, value: &str);

    /// Write body bytes, returning the number of bytes accepted.
    async fn write(&self, buf: &[u8]) -> std::io::Result<usize>;

    /// Flush any buffered output. Default: a no-op success.
    async fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }

    /// Whether this sink supports hijacking the underlying connection.
    fn can_hijack(&self) -> bool {
        false
    }

    /// Take over the connection and close it without a well-formed
    /// response. Default: unsupported.
    async fn hijack(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "sink does not support hijacking",
        ))
    }
}

/// The downstream handler the chaos middleware calls when no fault is
/// terminal. Handlers must not assume their sink is the original,
/// un-wrapped one.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &RequestContext, sink: Arc<dyn ResponseSink>);
}

/// Write the status line, `Content-Type: application/json`, an optional
/// `Retry-After` header, and any additional headers — the common prefix
/// shared by every terminal fault's wire emission.
async fn write_response_headers(
    sink: &dyn ResponseSink,
    status: u16,
    retry_after: Option<u64>,
    extra_headers: &[(&str, String)],
) {
    sink.write_status(status).await;
    sink.set_header("Content-Type", "application/json").await;
    if let Some(secs) = retry_after {
        sink.set_header("Retry-After", &secs.to_string()).await;
    }
    for (name, value) in extra_headers {
        sink.set_header(name, value).await;
    }
}

/// Write a JSON body plus the common headers used by the terminal faults.
pub(crate) async fn write_json_response(
    sink: &dyn ResponseSink,
    status: u16,
    retry_after: Option<u64>,
    extra_headers: &[(&str, String)],
    body: &serde_json::Value,
) {
    write_response_headers(sink, status, retry_after, extra_headers).await;
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let _ = sink.write(&bytes).await;
}

/// Write a raw (operator-supplied) body instead of a JSON value — used
/// when a fault's config overrides the default response body with its own
/// literal text.
pub(crate) async fn write_raw_response(
    sink: &dyn ResponseSink,
    status: u16,
    retry_after: Option<u64>,
    extra_headers: &[(&str, String)],
    body: &str,
) {
    write_response_headers(sink, status, retry_after, extra_headers).await;
    let _ = sink.write(body.as_bytes()).await;
}

/// Ceiling-divide a duration into whole seconds, with a floor of 1.
pub(crate) fn ceil_seconds_min1(d: std::time::Duration) -> u64 {
    let secs = d.as_secs_f64().ceil() as u64;
    secs.max(1)
}
