//! Stateful fault machines: circuit breaker, retry-after tracker, and
//! progressive degradation. Each machine owns a single `parking_lot::Mutex`
//! and never shares state with another instance.

use crate::config::FaultConfig;
use crate::{ceil_seconds_min1, write_json_response, write_raw_response, ResponseSink};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Outcome of handing a request to a stateful machine.
pub enum MachineOutcome {
    /// The machine wrote a response; the middleware must not call downstream.
    Rejected,
    /// The request may proceed, possibly after a machine-induced delay.
    PassThrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub closed_error_rate: f64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
    pub trip_after: u64,
    pub open_status_code: u16,
    pub open_body: String,
    pub half_open_error_rate: f64,
}

impl From<&FaultConfig> for CircuitBreakerConfig {
    fn from(cfg: &FaultConfig) -> Self {
        Self {
            closed_error_rate: cfg.get_f64("closedErrorRate", 0.0).clamp(0.0, 1.0),
            failure_threshold: cfg.get_u64("failureThreshold", 5).max(1) as u32,
            success_threshold: cfg.get_u64("successThreshold", 3).max(1) as u32,
            open_duration: cfg.get_duration("openDuration", Duration::from_secs(30)),
            trip_after: cfg.get_u64("tripAfter", 0),
            open_status_code: cfg.get_status_code("openStatusCode", 503),
            open_body: cfg.get_str("openBody", ""),
            half_open_error_rate: cfg.get_f64("halfOpenErrorRate", 0.5).clamp(0.0, 1.0),
        }
    }
}

/// Point-in-time snapshot of a circuit breaker's counters, safe to hand to
/// callers without holding the machine's lock.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: String,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub trip_count: u64,
    pub state_change_count: u64,
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    opened_at: Instant,
    trip_count: u64,
    state_change_count: u64,
}

/// A single circuit breaker instance, keyed by its owning rule/fault pair.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                total_requests: 0,
                opened_at: Instant::now(),
                trip_count: 0,
                state_change_count: 0,
            }),
        }
    }

    /// Promote `Open -> HalfOpen` if `open_duration` has elapsed. Called at
    /// the top of every lock acquisition so readers and writers alike always
    /// observe a current state.
    fn promote_if_due(&self, inner: &mut CircuitInner) {
        if inner.state == CircuitState::Open
            && inner.opened_at.elapsed() >= self.config.open_duration
        {
            inner.state = CircuitState::HalfOpen;
            inner.state_change_count += 1;
        }
    }

    fn trip(&self, inner: &mut CircuitInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Instant::now();
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.trip_count += 1;
        inner.state_change_count += 1;
    }

    fn reset_to_closed(&self, inner: &mut CircuitInner) {
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.total_requests = 0;
        inner.state_change_count += 1;
    }

    async fn write_open_response(&self, sink: &dyn ResponseSink, state: CircuitState) {
        let retry_after = ceil_seconds_min1(self.config.open_duration);
        let headers = [("X-Circuit-State", state.to_string())];
        if self.config.open_body.is_empty() {
            let body = json!({
                "error": "circuit breaker open",
                "state": state.to_string(),
                "retry_after": retry_after,
            });
            write_json_response(sink, self.config.open_status_code, Some(retry_after), &headers, &body)
                .await;
        } else {
            write_raw_response(
                sink,
                self.config.open_status_code,
                Some(retry_after),
                &headers,
                &self.config.open_body,
            )
            .await;
        }
    }

    /// Evaluate one request against the machine, writing a response through
    /// `sink` when rejecting.
    pub async fn call(&self, sink: &dyn ResponseSink) -> MachineOutcome {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        inner.total_requests += 1;

        match inner.state {
            CircuitState::Closed => {
                if self.config.trip_after > 0 && inner.total_requests >= self.config.trip_after {
                    self.trip(&mut inner);
                    let state = inner.state;
                    drop(inner);
                    self.write_open_response(sink, state).await;
                    return MachineOutcome::Rejected;
                }

                let roll = rand::rng().random::<f64>();
                if roll < self.config.closed_error_rate {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        self.trip(&mut inner);
                        let state = inner.state;
                        drop(inner);
                        self.write_open_response(sink, state).await;
                        return MachineOutcome::Rejected;
                    }
                    drop(inner);
                    write_json_response(
                        sink,
                        500,
                        None,
                        &[],
                        &json!({"error": "internal server error"}),
                    )
                    .await;
                    MachineOutcome::Rejected
                } else {
                    inner.consecutive_failures = 0;
                    MachineOutcome::PassThrough
                }
            }
            CircuitState::Open => {
                let state = inner.state;
                drop(inner);
                self.write_open_response(sink, state).await;
                MachineOutcome::Rejected
            }
            CircuitState::HalfOpen => {
                let roll = rand::rng().random::<f64>();
                if roll < self.config.half_open_error_rate {
                    self.trip(&mut inner);
                    let state = inner.state;
                    drop(inner);
                    self.write_open_response(sink, state).await;
                    MachineOutcome::Rejected
                } else {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        self.reset_to_closed(&mut inner);
                    }
                    MachineOutcome::PassThrough
                }
            }
        }
    }

    pub fn trip_now(&self) {
        let mut inner = self.inner.lock();
        self.trip(&mut inner);
    }

    pub fn reset_now(&self) {
        let mut inner = self.inner.lock();
        self.reset_to_closed(&mut inner);
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.inner.lock();
        self.promote_if_due(&mut inner);
        CircuitBreakerStats {
            state: inner.state.to_string(),
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_requests: inner.total_requests,
            trip_count: inner.trip_count,
            state_change_count: inner.state_change_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryAfterConfig {
    pub status_code: u16,
    pub retry_after: Duration,
    pub body: String,
}

impl From<&FaultConfig> for RetryAfterConfig {
    fn from(cfg: &FaultConfig) -> Self {
        let status_code = match cfg.get_u64("statusCode", 429) {
            429 => 429,
            503 => 503,
            _ => 429,
        };
        Self {
            status_code,
            retry_after: cfg.get_duration("retryAfter", Duration::from_secs(30)),
            body: cfg.get_str("body", ""),
        }
    }
}

struct RetryAfterInner {
    is_limited: bool,
    limited_at: Instant,
    limited_count: u64,
    passed_count: u64,
}

/// Single-window rate limiter: a request either triggers, extends, or
/// clears the current window.
pub struct RetryAfterTracker {
    config: RetryAfterConfig,
    inner: Mutex<RetryAfterInner>,
}

impl RetryAfterTracker {
    pub fn new(config: RetryAfterConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(RetryAfterInner {
                is_limited: false,
                limited_at: Instant::now(),
                limited_count: 0,
                passed_count: 0,
            }),
        }
    }

    fn status_text(&self) -> &'static str {
        match self.config.status_code {
            429 => "too many requests",
            503 => "service unavailable",
            _ => "too many requests",
        }
    }

    async fn write_limited_response(&self, sink: &dyn ResponseSink, remaining: Duration) {
        let retry_after = ceil_seconds_min1(remaining);
        if self.config.body.is_empty() {
            let body = json!({
                "error": self.status_text(),
                "retry_after": retry_after,
            });
            write_json_response(sink, self.config.status_code, Some(retry_after), &[], &body).await;
        } else {
            write_raw_response(sink, self.config.status_code, Some(retry_after), &[], &self.config.body)
                .await;
        }
    }

    pub async fn call(&self, sink: &dyn ResponseSink) -> MachineOutcome {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.is_limited {
            let elapsed = now.duration_since(inner.limited_at);
            if elapsed < self.config.retry_after {
                let remaining = self.config.retry_after - elapsed;
                drop(inner);
                self.write_limited_response(sink, remaining).await;
                return MachineOutcome::Rejected;
            }
            inner.is_limited = false;
            inner.passed_count += 1;
            return MachineOutcome::PassThrough;
        }

        inner.is_limited = true;
        inner.limited_at = now;
        inner.limited_count += 1;
        let remaining = self.config.retry_after;
        drop(inner);
        self.write_limited_response(sink, remaining).await;
        MachineOutcome::Rejected
    }
}

#[derive(Debug, Clone)]
pub struct ProgressiveDegradationConfig {
    pub initial_delay: Duration,
    pub delay_increment: Duration,
    pub max_delay: Duration,
    pub reset_after: u64,
    pub error_after: u64,
    pub error_code: u16,
}

impl From<&FaultConfig> for ProgressiveDegradationConfig {
    fn from(cfg: &FaultConfig) -> Self {
        Self {
            initial_delay: cfg.get_duration("initialDelay", Duration::from_millis(20)),
            delay_increment: cfg.get_duration("delayIncrement", Duration::from_millis(5)),
            max_delay: cfg.get_duration("maxDelay", Duration::from_secs(5)),
            reset_after: cfg.get_u64("resetAfter", 0),
            error_after: cfg.get_u64("errorAfter", 0),
            error_code: cfg.get_status_code("errorCode", 500),
        }
    }
}

struct DegradationInner {
    request_count: u64,
    reset_count: u64,
}

pub struct ProgressiveDegradation {
    config: ProgressiveDegradationConfig,
    inner: Mutex<DegradationInner>,
}

impl ProgressiveDegradation {
    pub fn new(config: ProgressiveDegradationConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(DegradationInner {
                request_count: 0,
                reset_count: 0,
            }),
        }
    }

    pub async fn call(&self, sink: &dyn ResponseSink, cancellation: &CancellationToken) -> MachineOutcome {
        let (count, delay, should_error) = {
            let mut inner = self.inner.lock();
            inner.request_count += 1;
            if self.config.reset_after > 0 && inner.request_count > self.config.reset_after {
                inner.request_count = 1;
                inner.reset_count += 1;
            }
            let count = inner.request_count;
            let delay = self
                .config
                .initial_delay
                .saturating_add(self.config.delay_increment.saturating_mul((count - 1) as u32))
                .min(self.config.max_delay);
            let should_error =
                self.config.error_after > 0 && count > self.config.error_after;
            (count, delay, should_error)
        };

        if !delay.is_zero() {
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancellation.cancelled() => return MachineOutcome::Rejected,
            }
        }

        if should_error {
            let status_text = http::StatusCode::from_u16(self.config.error_code)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("error");
            write_json_response(
                sink,
                self.config.error_code,
                None,
                &[],
                &json!({
                    "error": status_text,
                    "degradation": {
                        "request_count": count,
                        "delay_ms": delay.as_millis() as u64,
                    },
                }),
            )
            .await;
            MachineOutcome::Rejected
        } else {
            MachineOutcome::PassThrough
        }
    }
}

/// A stateful machine instance, keyed into the injector's machine map.
#[derive(Clone)]
pub enum StatefulMachine {
    CircuitBreaker(Arc<CircuitBreaker>),
    RetryAfter(Arc<RetryAfterTracker>),
    ProgressiveDegradation(Arc<ProgressiveDegradation>),
}
