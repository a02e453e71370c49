//! The chaos injector: owns the compiled rule set, request statistics, and
//! the stateful machine map behind a single `parking_lot::Mutex`.

use crate::config::{compile_config, ChaosConfig, CompiledConfig, Fault};
use crate::resilience::StatefulMachine;
use crate::{RequestContext, Result};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct InjectorStats {
    pub total_requests: u64,
    pub faults_emitted: u64,
    pub fault_counts: HashMap<String, u64>,
}

struct InjectorInner {
    source: ChaosConfig,
    compiled: CompiledConfig,
    stats: InjectorStats,
    rng: StdRng,
}

/// Given a request, produces an ordered list of faults to apply. The
/// injector is the single source of truth for rule matching, probability
/// rolls, and fault statistics — all three stay consistent because they
/// share one lock.
pub struct ChaosInjector {
    inner: Mutex<InjectorInner>,
}

impl ChaosInjector {
    pub fn new(config: ChaosConfig) -> Result<Self> {
        let compiled = compile_config(&config)?;
        Ok(Self {
            inner: Mutex::new(InjectorInner {
                source: config,
                compiled,
                stats: InjectorStats::default(),
                rng: StdRng::from_os_rng(),
            }),
        })
    }

    /// Select the faults that apply to this request. Global faults are
    /// considered only when no rule matched the request's path and method
    /// — even if a matching rule's own probability roll failed.
    pub fn select_faults(&self, ctx: &RequestContext) -> Vec<Fault> {
        let mut inner = self.inner.lock();
        inner.stats.total_requests += 1;

        let mut any_rule_matched = false;
        let mut selected = Vec::new();

        // Work around the borrow checker needing `inner` split across the
        // rng and stats fields while iterating `compiled.rules`.
        let InjectorInner {
            compiled,
            stats,
            rng,
            ..
        } = &mut *inner;

        for rule in &compiled.rules {
            if !rule.regex.is_match(&ctx.path) {
                continue;
            }
            if !rule.matches_method(&ctx.method) {
                continue;
            }
            any_rule_matched = true;

            if rng.random::<f64>() >= rule.probability {
                continue;
            }

            for fault in &rule.faults {
                if fault.kind.is_stateful() {
                    selected.push(fault.clone());
                    stats.faults_emitted += 1;
                    *stats.fault_counts.entry(fault.kind.as_str().to_string()).or_insert(0) += 1;
                } else if rng.random::<f64>() < fault.probability {
                    selected.push(fault.clone());
                    stats.faults_emitted += 1;
                    *stats.fault_counts.entry(fault.kind.as_str().to_string()).or_insert(0) += 1;
                }
            }
        }

        if !any_rule_matched {
            for global in [&compiled.global.latency, &compiled.global.error, &compiled.global.bandwidth] {
                if let Some(fault) = global {
                    if rng.random::<f64>() < fault.probability {
                        selected.push(fault.clone());
                        stats.faults_emitted += 1;
                        *stats
                            .fault_counts
                            .entry(fault.kind.as_str().to_string())
                            .or_insert(0) += 1;
                    }
                }
            }
        }

        selected
    }

    /// Look up the stateful machine owning `state_key`. Returns `None` for
    /// unknown keys (e.g. a request racing an in-flight `update_config`) —
    /// callers must treat that as "no-op", never as an error.
    pub fn machine(&self, state_key: &str) -> Option<StatefulMachine> {
        self.inner.lock().compiled.machines.get(state_key).cloned()
    }

    /// Compile the new configuration fully before taking the lock, then
    /// swap it in atomically. Rejected (invalid) configurations leave the
    /// old state untouched.
    pub fn update_config(&self, config: ChaosConfig) -> Result<()> {
        let compiled = compile_config(&config)?;
        let mut inner = self.inner.lock();
        inner.source = config;
        inner.compiled = compiled;
        Ok(())
    }

    pub fn config_snapshot(&self) -> ChaosConfig {
        self.inner.lock().source.clone()
    }

    pub fn stats(&self) -> InjectorStats {
        self.inner.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FaultConfig, FaultKind, GlobalFaults, Rule};
    use std::net::SocketAddr;

    fn ctx(path: &str, method: http::Method) -> RequestContext {
        RequestContext::new(path, method, "127.0.0.1:1234".parse::<SocketAddr>().unwrap())
    }

    fn fault(kind: FaultKind, probability: f64) -> Fault {
        Fault {
            kind,
            probability,
            config: FaultConfig::default(),
            state_key: None,
        }
    }

    #[test]
    fn full_probability_rule_always_yields_stateful_faults() {
        let injector = ChaosInjector::new(ChaosConfig {
            enabled: true,
            rules: vec![Rule {
                path_pattern: "/api/.*".into(),
                methods: vec![],
                probability: 1.0,
                faults: vec![fault(FaultKind::CircuitBreaker, 1.0)],
            }],
            global: GlobalFaults::default(),
        })
        .unwrap();

        for _ in 0..20 {
            let faults = injector.select_faults(&ctx("/api/data", http::Method::GET));
            assert_eq!(faults.len(), 1);
            assert!(faults[0].state_key.is_some());
        }
    }

    #[test]
    fn matched_rule_suppresses_globals_even_on_probability_failure() {
        let injector = ChaosInjector::new(ChaosConfig {
            enabled: true,
            rules: vec![Rule {
                path_pattern: "/api/.*".into(),
                methods: vec![],
                probability: 0.0,
                faults: vec![fault(FaultKind::Error, 0.0)],
            }],
            global: GlobalFaults {
                latency: Some(fault(FaultKind::Latency, 1.0)),
                error: None,
                bandwidth: None,
            },
        })
        .unwrap();

        for _ in 0..500 {
            let faults = injector.select_faults(&ctx("/api/data", http::Method::GET));
            assert!(faults.is_empty(), "matched rule must suppress globals");
        }

        let faults = injector.select_faults(&ctx("/health", http::Method::GET));
        assert_eq!(faults.len(), 1);
    }

    #[test]
    fn method_mismatch_does_not_count_as_matched() {
        let injector = ChaosInjector::new(ChaosConfig {
            enabled: true,
            rules: vec![Rule {
                path_pattern: "/api/.*".into(),
                methods: vec!["POST".into()],
                probability: 1.0,
                faults: vec![],
            }],
            global: GlobalFaults {
                latency: Some(fault(FaultKind::Latency, 1.0)),
                error: None,
                bandwidth: None,
            },
        })
        .unwrap();

        let faults = injector.select_faults(&ctx("/api/data", http::Method::GET));
        assert_eq!(faults.len(), 1, "GET doesn't match POST-only rule, global applies");
    }

    #[test]
    fn update_config_swaps_stateful_machines() {
        let injector = ChaosInjector::new(ChaosConfig {
            enabled: true,
            rules: vec![Rule {
                path_pattern: "/a".into(),
                methods: vec![],
                probability: 1.0,
                faults: vec![fault(FaultKind::CircuitBreaker, 1.0)],
            }],
            global: GlobalFaults::default(),
        })
        .unwrap();

        let faults = injector.select_faults(&ctx("/a", http::Method::GET));
        let key = faults[0].state_key.clone().unwrap();
        assert!(injector.machine(&key).is_some());

        injector
            .update_config(ChaosConfig {
                enabled: true,
                rules: vec![],
                global: GlobalFaults::default(),
            })
            .unwrap();

        assert!(injector.machine(&key).is_none());
    }
}
