//! Chaos middleware: sequences the injector's fault list over the
//! response pipeline for a single request.

use crate::config::{Fault, FaultKind};
use crate::injector::ChaosInjector;
use crate::resilience::{MachineOutcome, StatefulMachine};
use crate::writers::{ChunkedDribbleWriter, CorruptingWriter, SlowWriter, TruncatingWriter};
use crate::{write_json_response, FaultlineError, Handler, RequestContext, ResponseSink};
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

enum Step {
    Continue,
    Terminal,
}

/// Wraps a [`Handler`] with fault injection driven by a [`ChaosInjector`].
/// When no injector is configured (or injection is administratively
/// disabled), requests pass straight through.
pub struct ChaosMiddleware {
    injector: Option<Arc<ChaosInjector>>,
    enabled: bool,
}

impl ChaosMiddleware {
    pub fn new(injector: Arc<ChaosInjector>) -> Self {
        Self {
            injector: Some(injector),
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            injector: None,
            enabled: false,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub async fn handle(
        &self,
        ctx: &RequestContext,
        sink: Arc<dyn ResponseSink>,
        handler: &dyn Handler,
    ) {
        let Some(injector) = self.injector.as_ref() else {
            handler.call(ctx, sink).await;
            return;
        };
        if !self.enabled {
            handler.call(ctx, sink).await;
            return;
        }

        let faults = injector.select_faults(ctx);
        if faults.is_empty() {
            handler.call(ctx, sink).await;
            return;
        }

        let mut wrapped: Arc<dyn ResponseSink> = sink.clone();

        for fault in &faults {
            match self.apply(fault, ctx, &sink, &mut wrapped, injector).await {
                Step::Terminal => return,
                Step::Continue => {}
            }
        }

        handler.call(ctx, wrapped).await;
    }

    /// A malformed fault config (e.g. an unparseable latency duration)
    /// aborts only this fault for this request; other requests and other
    /// faults are unaffected.
    async fn injection_error(&self, sink: &Arc<dyn ResponseSink>, err: FaultlineError) -> Step {
        tracing::warn!(error = %err, "aborting fault due to malformed configuration");
        write_json_response(
            sink.as_ref(),
            500,
            None,
            &[],
            &json!({ "error": "internal server error" }),
        )
        .await;
        Step::Terminal
    }

    async fn apply(
        &self,
        fault: &Fault,
        ctx: &RequestContext,
        original: &Arc<dyn ResponseSink>,
        wrapped: &mut Arc<dyn ResponseSink>,
        injector: &Arc<ChaosInjector>,
    ) -> Step {
        match fault.kind {
            FaultKind::Latency => {
                let min = match fault.config.get_duration_strict("min", Duration::ZERO) {
                    Ok(d) => d,
                    Err(e) => return self.injection_error(original, e).await,
                };
                let max = match fault.config.get_duration_strict("max", Duration::from_millis(100)) {
                    Ok(d) => d,
                    Err(e) => return self.injection_error(original, e).await,
                };
                let delay = random_duration_in_range(min, max);
                tokio::select! {
                    _ = sleep(delay) => Step::Continue,
                    _ = ctx.cancellation.cancelled() => Step::Terminal,
                }
            }
            FaultKind::Error => {
                let codes = fault.config.get_status_codes("statusCodes");
                let default_code = fault.config.get_status_code("defaultCode", 500);
                let code = if codes.is_empty() {
                    default_code
                } else {
                    codes[rand::rng().random_range(0..codes.len())]
                };
                let reason = http::StatusCode::from_u16(code)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("error");
                write_json_response(original.as_ref(), code, None, &[], &json!({ "error": reason }))
                    .await;
                Step::Terminal
            }
            FaultKind::Timeout => {
                let duration = fault.config.get_duration("duration", Duration::from_secs(30));
                tokio::select! {
                    _ = sleep(duration) => {}
                    _ = ctx.cancellation.cancelled() => {}
                }
                write_json_response(
                    original.as_ref(),
                    504,
                    None,
                    &[],
                    &json!({ "error": "gateway timeout" }),
                )
                .await;
                Step::Terminal
            }
            FaultKind::EmptyResponse => {
                original.write_status(200).await;
                Step::Terminal
            }
            FaultKind::ConnectionReset => {
                if original.can_hijack() {
                    let _ = original.hijack().await;
                }
                Step::Terminal
            }
            FaultKind::SlowBody => {
                let bps = fault.config.get_f64("bytesPerSecond", 1024.0);
                *wrapped = Arc::new(SlowWriter::with_cancellation(
                    wrapped.clone(),
                    bps,
                    ctx.cancellation.clone(),
                ));
                Step::Continue
            }
            FaultKind::CorruptBody => {
                let rate = fault.config.get_f64("corruptRate", 0.01);
                *wrapped = Arc::new(CorruptingWriter::new(wrapped.clone(), rate));
                Step::Continue
            }
            FaultKind::PartialResponse => {
                let max_bytes = fault.config.get_u64("maxBytes", 1024) as usize;
                *wrapped = Arc::new(TruncatingWriter::new(wrapped.clone(), max_bytes));
                Step::Continue
            }
            FaultKind::ChunkedDribble => {
                let chunk_size = fault.config.get_u64("chunkSize", 1024) as usize;
                let chunk_delay = fault.config.get_duration("chunkDelay", Duration::from_millis(500));
                let initial_delay = fault.config.get_duration("initialDelay", Duration::ZERO);
                *wrapped = Arc::new(ChunkedDribbleWriter::with_cancellation(
                    wrapped.clone(),
                    chunk_size,
                    chunk_delay,
                    initial_delay,
                    ctx.cancellation.clone(),
                ));
                Step::Continue
            }
            FaultKind::CircuitBreaker | FaultKind::RetryAfter | FaultKind::ProgressiveDegradation => {
                let Some(key) = fault.state_key.as_deref() else {
                    return Step::Continue;
                };
                let Some(machine) = injector.machine(key) else {
                    // Unknown key: an in-flight config rebuild raced this
                    // request. Treat as a no-op rather than an error.
                    return Step::Continue;
                };

                let outcome = match machine {
                    StatefulMachine::CircuitBreaker(cb) => cb.call(original.as_ref()).await,
                    StatefulMachine::RetryAfter(tracker) => tracker.call(original.as_ref()).await,
                    StatefulMachine::ProgressiveDegradation(degradation) => {
                        degradation.call(original.as_ref(), &ctx.cancellation).await
                    }
                };

                match outcome {
                    MachineOutcome::Rejected => Step::Terminal,
                    MachineOutcome::PassThrough => Step::Continue,
                }
            }
        }
    }
}

fn random_duration_in_range(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_secs_f64();
    let offset = rand::rng().random::<f64>() * span;
    min + Duration::from_secs_f64(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChaosConfig, FaultConfig, GlobalFaults, Rule};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        status: AtomicU16,
        body: StdMutex<Vec<u8>>,
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn write_status(&self, status: u16) {
            self.status.store(status, Ordering::SeqCst);
        }
        async fn set_header(&self, _name: &str, _value: &str) {}
        async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
            self.body.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn call(&self, _ctx: &RequestContext, sink: Arc<dyn ResponseSink>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sink.write_status(200).await;
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("/api/data", http::Method::GET, "127.0.0.1:1".parse::<SocketAddr>().unwrap())
    }

    #[tokio::test]
    async fn error_fault_is_terminal_and_skips_handler() {
        let injector = Arc::new(
            ChaosInjector::new(ChaosConfig {
                enabled: true,
                rules: vec![Rule {
                    path_pattern: "/api/.*".into(),
                    methods: vec![],
                    probability: 1.0,
                    faults: vec![Fault {
                        kind: FaultKind::Error,
                        probability: 1.0,
                        config: FaultConfig::default(),
                        state_key: None,
                    }],
                }],
                global: GlobalFaults::default(),
            })
            .unwrap(),
        );

        let middleware = ChaosMiddleware::new(injector);
        let handler = CountingHandler {
            calls: AtomicUsize::new(0),
        };
        let sink: Arc<dyn ResponseSink> = Arc::new(RecordingSink::default());

        middleware.handle(&ctx(), sink.clone(), &handler).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_fault_list_calls_handler_with_original_sink() {
        let injector = Arc::new(
            ChaosInjector::new(ChaosConfig {
                enabled: true,
                rules: vec![],
                global: GlobalFaults::default(),
            })
            .unwrap(),
        );

        let middleware = ChaosMiddleware::new(injector);
        let handler = CountingHandler {
            calls: AtomicUsize::new(0),
        };
        let sink: Arc<dyn ResponseSink> = Arc::new(RecordingSink::default());

        middleware.handle(&ctx(), sink, &handler).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_middleware_passes_through() {
        let middleware = ChaosMiddleware::disabled();
        let handler = CountingHandler {
            calls: AtomicUsize::new(0),
        };
        let sink: Arc<dyn ResponseSink> = Arc::new(RecordingSink::default());

        middleware.handle(&ctx(), sink, &handler).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }
}
