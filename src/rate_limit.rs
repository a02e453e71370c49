//! Per-IP token-bucket rate limiter: sharded buckets behind a map lock,
//! trusted-proxy-aware client IP extraction, and a TTL reaper with a
//! two-channel shutdown handshake.

use crate::{write_json_response, Handler, RequestContext, ResponseSink};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::interval;

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub rate: f64,
    pub burst: f64,
    pub trust_all_proxies: bool,
    pub trusted_proxies: Vec<String>,
    pub cleanup_interval: Duration,
    pub entry_ttl: Duration,
}

impl LimiterConfig {
    /// A new config with `burst = 2 * rate`, no trusted proxies, and a
    /// five-minute TTL swept every minute.
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            burst: rate * 2.0,
            trust_all_proxies: false,
            trusted_proxies: Vec::new(),
            cleanup_interval: Duration::from_secs(60),
            entry_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AllowResult {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_seconds: u64,
}

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

fn ceil_secs_min1(secs: f64) -> u64 {
    secs.ceil().max(1.0) as u64
}

fn parse_trusted_proxy(s: &str) -> Option<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }
    match s.parse::<IpAddr>().ok()? {
        IpAddr::V4(v4) => Some(IpNet::V4(Ipv4Net::from(v4))),
        IpAddr::V6(v6) => Some(IpNet::V6(Ipv6Net::from(v6))),
    }
}

/// Sharded per-IP token bucket. Construction spawns a background reaper
/// task; call [`PerIpLimiter::stop`] to shut it down deterministically.
pub struct PerIpLimiter {
    buckets: RwLock<HashMap<IpAddr, Arc<Mutex<Bucket>>>>,
    rate: f64,
    burst: f64,
    trust_all_proxies: bool,
    trusted_nets: Vec<IpNet>,
    entry_ttl: Duration,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    stopped_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl PerIpLimiter {
    pub fn new(config: LimiterConfig) -> Arc<Self> {
        let trusted_nets = config
            .trusted_proxies
            .iter()
            .filter_map(|s| parse_trusted_proxy(s))
            .collect();

        let (stop_tx, stop_rx) = oneshot::channel();
        let (stopped_tx, stopped_rx) = oneshot::channel();

        let limiter = Arc::new(Self {
            buckets: RwLock::new(HashMap::new()),
            rate: config.rate,
            burst: config.burst,
            trust_all_proxies: config.trust_all_proxies,
            trusted_nets,
            entry_ttl: config.entry_ttl,
            stop_tx: Mutex::new(Some(stop_tx)),
            stopped_rx: Mutex::new(Some(stopped_rx)),
        });

        let reaper = limiter.clone();
        let cleanup_interval = config.cleanup_interval;
        tokio::spawn(async move {
            reaper.run_reaper(cleanup_interval, stop_rx, stopped_tx).await;
        });

        limiter
    }

    async fn run_reaper(
        &self,
        cleanup_interval: Duration,
        mut stop_rx: oneshot::Receiver<()>,
        stopped_tx: oneshot::Sender<()>,
    ) {
        let mut ticker = interval(cleanup_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reap(),
                _ = &mut stop_rx => break,
            }
        }
        let _ = stopped_tx.send(());
    }

    fn reap(&self) {
        let now = Instant::now();
        let ttl = self.entry_ttl;
        // Lock order: map write lock first, then briefly each bucket's
        // lock. Never the reverse — a caller already holding a bucket lock
        // must not then try to take the map lock.
        let mut map = self.buckets.write();
        map.retain(|_, bucket| now.duration_since(bucket.lock().last_update) < ttl);
    }

    /// Evaluate and consume one token for `ip`, creating its bucket on
    /// first use (double-checked under the map lock).
    pub fn allow(&self, ip: IpAddr) -> AllowResult {
        let existing = self.buckets.read().get(&ip).cloned();
        let bucket = match existing {
            Some(b) => b,
            None => {
                let mut map = self.buckets.write();
                map.entry(ip)
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(Bucket {
                            tokens: self.burst,
                            last_update: Instant::now(),
                        }))
                    })
                    .clone()
            }
        };

        let mut b = bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(b.last_update).as_secs_f64();
        b.tokens = (b.tokens + elapsed * self.rate).min(self.burst);
        b.last_update = now;

        let reset_seconds = if b.tokens >= self.burst {
            0
        } else {
            ceil_secs_min1((self.burst - b.tokens) / self.rate)
        };

        if b.tokens >= 1.0 {
            b.tokens -= 1.0;
            AllowResult {
                allowed: true,
                remaining: b.tokens.floor() as u64,
                reset_seconds,
            }
        } else {
            let retry = ceil_secs_min1((1.0 - b.tokens) / self.rate);
            AllowResult {
                allowed: false,
                remaining: 0,
                reset_seconds: retry,
            }
        }
    }

    /// Extract the client IP for `remote_addr`/`headers`. Forwarding
    /// headers are only trusted when the direct peer is itself a trusted
    /// proxy (or `trust_all_proxies` is set).
    pub fn client_ip(&self, remote_addr: std::net::SocketAddr, headers: &http::HeaderMap) -> IpAddr {
        let direct = remote_addr.ip();
        let trusted =
            self.trust_all_proxies || self.trusted_nets.iter().any(|net| net.contains(&direct));
        if !trusted {
            return direct;
        }

        if let Some(value) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }

        if let Some(value) = headers.get("X-Real-IP").and_then(|v| v.to_str().ok()) {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return ip;
            }
        }

        direct
    }

    /// Close the shutdown channel and wait for the reaper's acknowledgement.
    /// Idempotent: calling it twice is a no-op the second time.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        let rx = self.stopped_rx.lock().take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }
}

/// Applies [`PerIpLimiter`] ahead of a [`Handler`], setting the standard
/// `X-RateLimit-*` response headers and rejecting with 429 when the
/// client's bucket is empty.
pub struct RateLimitMiddleware {
    limiter: Arc<PerIpLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<PerIpLimiter>) -> Self {
        Self { limiter }
    }

    pub async fn handle(&self, ctx: &RequestContext, sink: Arc<dyn ResponseSink>, handler: &dyn Handler) {
        let ip = self.limiter.client_ip(ctx.remote_addr, &ctx.headers);
        let result = self.limiter.allow(ip);

        sink.set_header("X-RateLimit-Limit", &self.limiter.burst.floor().to_string())
            .await;
        sink.set_header("X-RateLimit-Remaining", &result.remaining.to_string())
            .await;
        sink.set_header("X-RateLimit-Reset", &result.reset_seconds.to_string())
            .await;

        if !result.allowed {
            write_json_response(
                sink.as_ref(),
                429,
                Some(result.reset_seconds),
                &[],
                &json!({ "error": "too many requests", "retry_after": result.reset_seconds }),
            )
            .await;
            return;
        }

        handler.call(ctx, sink).await;
    }
}
