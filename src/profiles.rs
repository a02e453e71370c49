//! Built-in named chaos profiles: a read-only registry of common network
//! and service conditions. `apply_profile` always hands back a deep copy
//! so callers can freely mutate their copy without touching the registry
//! or any other caller's copy.

use crate::config::{ChaosConfig, Fault, FaultConfig, FaultKind, GlobalFaults, Rule};
use once_cell::sync::Lazy;
use serde_json::json;
use std::collections::HashMap;

fn fault(kind: FaultKind, probability: f64, entries: &[(&str, serde_json::Value)]) -> Fault {
    Fault {
        kind,
        probability,
        config: FaultConfig(entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()),
        state_key: None,
    }
}

fn catch_all_rule(faults: Vec<Fault>) -> Rule {
    Rule {
        path_pattern: ".*".to_string(),
        methods: Vec::new(),
        faults,
        probability: 1.0,
    }
}

fn slow_api() -> ChaosConfig {
    ChaosConfig {
        enabled: true,
        rules: Vec::new(),
        global: GlobalFaults {
            latency: Some(fault(
                FaultKind::Latency,
                1.0,
                &[("min", json!("200ms")), ("max", json!("800ms"))],
            )),
            error: None,
            bandwidth: None,
        },
    }
}

fn degraded() -> ChaosConfig {
    ChaosConfig {
        enabled: true,
        rules: Vec::new(),
        global: GlobalFaults {
            latency: Some(fault(
                FaultKind::Latency,
                1.0,
                &[("min", json!("100ms")), ("max", json!("400ms"))],
            )),
            error: Some(fault(
                FaultKind::Error,
                0.1,
                &[("defaultCode", json!(500))],
            )),
            bandwidth: None,
        },
    }
}

fn flaky() -> ChaosConfig {
    ChaosConfig {
        enabled: true,
        rules: Vec::new(),
        global: GlobalFaults {
            latency: None,
            error: Some(fault(
                FaultKind::Error,
                0.3,
                &[("statusCodes", json!([500, 502, 503]))],
            )),
            bandwidth: None,
        },
    }
}

fn offline() -> ChaosConfig {
    ChaosConfig {
        enabled: true,
        rules: vec![catch_all_rule(vec![fault(FaultKind::ConnectionReset, 1.0, &[])])],
        global: GlobalFaults::default(),
    }
}

fn timeout() -> ChaosConfig {
    ChaosConfig {
        enabled: true,
        rules: vec![catch_all_rule(vec![fault(
            FaultKind::Timeout,
            1.0,
            &[("duration", json!("5s"))],
        )])],
        global: GlobalFaults::default(),
    }
}

fn rate_limited() -> ChaosConfig {
    ChaosConfig {
        enabled: true,
        rules: vec![catch_all_rule(vec![fault(
            FaultKind::RetryAfter,
            1.0,
            &[("statusCode", json!(429)), ("retryAfter", json!("10s"))],
        )])],
        global: GlobalFaults::default(),
    }
}

fn mobile_3g() -> ChaosConfig {
    ChaosConfig {
        enabled: true,
        rules: Vec::new(),
        global: GlobalFaults {
            latency: Some(fault(
                FaultKind::Latency,
                1.0,
                &[("min", json!("100ms")), ("max", json!("500ms"))],
            )),
            error: None,
            bandwidth: Some(fault(
                FaultKind::SlowBody,
                1.0,
                &[("bytesPerSecond", json!(50_000.0))],
            )),
        },
    }
}

fn satellite() -> ChaosConfig {
    ChaosConfig {
        enabled: true,
        rules: Vec::new(),
        global: GlobalFaults {
            latency: Some(fault(
                FaultKind::Latency,
                1.0,
                &[("min", json!("600ms")), ("max", json!("800ms"))],
            )),
            error: None,
            bandwidth: Some(fault(
                FaultKind::SlowBody,
                1.0,
                &[("bytesPerSecond", json!(20_000.0))],
            )),
        },
    }
}

fn dns_flaky() -> ChaosConfig {
    ChaosConfig {
        enabled: true,
        rules: vec![catch_all_rule(vec![
            fault(FaultKind::Timeout, 0.2, &[("duration", json!("3s"))]),
            fault(FaultKind::Error, 0.1, &[("defaultCode", json!(502))]),
        ])],
        global: GlobalFaults::default(),
    }
}

fn overloaded() -> ChaosConfig {
    ChaosConfig {
        enabled: true,
        rules: vec![catch_all_rule(vec![fault(
            FaultKind::CircuitBreaker,
            1.0,
            &[
                ("tripAfter", json!(50)),
                ("openDuration", json!("15s")),
                ("failureThreshold", json!(3)),
                ("successThreshold", json!(2)),
            ],
        )])],
        global: GlobalFaults {
            latency: Some(fault(
                FaultKind::Latency,
                0.5,
                &[("min", json!("50ms")), ("max", json!("300ms"))],
            )),
            error: None,
            bandwidth: None,
        },
    }
}

static REGISTRY: Lazy<HashMap<&'static str, ChaosConfig>> = Lazy::new(|| {
    HashMap::from([
        ("slow-api", slow_api()),
        ("degraded", degraded()),
        ("flaky", flaky()),
        ("offline", offline()),
        ("timeout", timeout()),
        ("rate-limited", rate_limited()),
        ("mobile-3g", mobile_3g()),
        ("satellite", satellite()),
        ("dns-flaky", dns_flaky()),
        ("overloaded", overloaded()),
    ])
});

/// The names of every built-in profile, in no particular order.
pub fn profile_names() -> Vec<&'static str> {
    REGISTRY.keys().copied().collect()
}

/// Look up a built-in profile by name and return a deep copy. Returns
/// `None` for unrecognized names rather than a default, so callers can
/// distinguish "no such profile" from "profile with no faults".
pub fn apply_profile(name: &str) -> Option<ChaosConfig> {
    REGISTRY.get(name).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::compile_config;

    #[test]
    fn every_builtin_profile_compiles() {
        for name in profile_names() {
            let cfg = apply_profile(name).unwrap();
            compile_config(&cfg).unwrap_or_else(|e| panic!("profile {name} failed to compile: {e}"));
        }
    }

    #[test]
    fn unknown_profile_returns_none() {
        assert!(apply_profile("does-not-exist").is_none());
    }

    #[test]
    fn deep_copy_does_not_mutate_registry() {
        let mut copy = apply_profile("slow-api").unwrap();
        copy.enabled = false;
        if let Some(latency) = copy.global.latency.as_mut() {
            latency.probability = 0.0;
        }

        let fresh = apply_profile("slow-api").unwrap();
        assert!(fresh.enabled);
        assert_eq!(fresh.global.latency.unwrap().probability, 1.0);
    }
}
