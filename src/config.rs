//! Configuration types, the duration parser, and the rule compiler.
//!
//! Nothing in this module touches the filesystem: configuration arrives as
//! already-constructed values (or via `serde_json`/`serde_yaml` from
//! whatever source the caller chooses) and is compiled in memory.

use crate::resilience::{
    CircuitBreaker, CircuitBreakerConfig, ProgressiveDegradation, ProgressiveDegradationConfig,
    RetryAfterConfig, RetryAfterTracker, StatefulMachine,
};
use crate::{FaultlineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// A fault kind. The first eight are stateless; the last three carry a
/// `state_key` once compiled. `chunked_dribble` is a stateless writer
/// wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Latency,
    Error,
    Timeout,
    CorruptBody,
    EmptyResponse,
    SlowBody,
    ConnectionReset,
    PartialResponse,
    CircuitBreaker,
    RetryAfter,
    ProgressiveDegradation,
    ChunkedDribble,
}

impl FaultKind {
    pub fn is_stateful(self) -> bool {
        matches!(
            self,
            FaultKind::CircuitBreaker | FaultKind::RetryAfter | FaultKind::ProgressiveDegradation
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::Latency => "latency",
            FaultKind::Error => "error",
            FaultKind::Timeout => "timeout",
            FaultKind::CorruptBody => "corrupt_body",
            FaultKind::EmptyResponse => "empty_response",
            FaultKind::SlowBody => "slow_body",
            FaultKind::ConnectionReset => "connection_reset",
            FaultKind::PartialResponse => "partial_response",
            FaultKind::CircuitBreaker => "circuit_breaker",
            FaultKind::RetryAfter => "retry_after",
            FaultKind::ProgressiveDegradation => "progressive_degradation",
            FaultKind::ChunkedDribble => "chunked_dribble",
        }
    }
}

/// Free-form per-fault configuration, recognized keys documented per kind.
/// Modeled as a plain JSON map (the same shape the rest of this crate's
/// plugin-style configuration uses) rather than a bespoke struct per fault,
/// so new fault kinds don't require a schema migration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaultConfig(pub HashMap<String, JsonValue>);

impl FaultConfig {
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.0.get(key).and_then(JsonValue::as_f64).unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.0.get(key).and_then(JsonValue::as_u64).unwrap_or(default)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.0
            .get(key)
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default.to_string())
    }

    /// A status code recognized only when it falls in `[400, 599]`;
    /// otherwise the caller's default is used.
    pub fn get_status_code(&self, key: &str, default: u16) -> u16 {
        match self.0.get(key).and_then(JsonValue::as_u64) {
            Some(code) if (400..=599).contains(&code) => code as u16,
            _ => default,
        }
    }

    pub fn get_duration(&self, key: &str, default: Duration) -> Duration {
        self.0
            .get(key)
            .and_then(JsonValue::as_str)
            .and_then(parse_duration)
            .unwrap_or(default)
    }

    /// Like [`Self::get_duration`], but a present-and-unparseable value is
    /// an error rather than a silent fallback. Used by the latency fault,
    /// whose duration strings are evaluated fresh per request rather than
    /// resolved once at compile time.
    pub fn get_duration_strict(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.0.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_str()
                .and_then(parse_duration)
                .ok_or_else(|| FaultlineError::InvalidDuration(key.to_string())),
        }
    }

    pub fn get_status_codes(&self, key: &str) -> Vec<u16> {
        self.0
            .get(key)
            .and_then(JsonValue::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(JsonValue::as_u64)
                    .filter(|c| (100..=599).contains(c))
                    .map(|c| c as u16)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Parse a duration string with an `ms`/`s`/`m`/`h` suffix; a bare number is
/// taken as milliseconds. Returns `None` on anything else (the caller falls
/// back to its documented default).
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (number, unit) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => s.split_at(idx),
        None => (s, "ms"),
    };

    let value: f64 = number.parse().ok()?;
    if value < 0.0 {
        return None;
    }

    let millis = match unit {
        "ms" | "" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        _ => return None,
    };

    Some(Duration::from_secs_f64(millis / 1_000.0))
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

/// A single injectable behavior alteration within a [`Rule`]. Stateful
/// kinds carry an injected `state_key` once the owning rule is compiled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    #[serde(default = "default_probability")]
    pub probability: f64,
    #[serde(default)]
    pub config: FaultConfig,
    #[serde(skip)]
    pub state_key: Option<String>,
}

fn default_probability() -> f64 {
    1.0
}

impl Fault {
    fn clamp(&mut self) {
        self.probability = clamp01(self.probability);
    }
}

/// A path/method filter plus an ordered list of faults, gated by a
/// rule-level probability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub path_pattern: String,
    #[serde(default)]
    pub methods: Vec<String>,
    pub faults: Vec<Fault>,
    #[serde(default = "default_probability")]
    pub probability: f64,
}

impl Rule {
    fn clamp(&mut self) {
        self.probability = clamp01(self.probability);
        for fault in &mut self.faults {
            fault.clamp();
        }
    }
}

/// Up to three standing faults applied only when no rule matches a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalFaults {
    pub latency: Option<Fault>,
    pub error: Option<Fault>,
    pub bandwidth: Option<Fault>,
}

impl GlobalFaults {
    fn clamp(&mut self) {
        if let Some(f) = self.latency.as_mut() {
            f.clamp();
        }
        if let Some(f) = self.error.as_mut() {
            f.clamp();
        }
        if let Some(f) = self.bandwidth.as_mut() {
            f.clamp();
        }
    }
}

/// The full chaos configuration: whether injection runs at all, the
/// ordered rule list, and the standing global faults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChaosConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub global: GlobalFaults,
}

impl ChaosConfig {
    /// Recursively force every probability field into `[0, 1]`. Idempotent:
    /// `clamp(clamp(cfg)) == clamp(cfg)`.
    pub fn clamp(&mut self) {
        for rule in &mut self.rules {
            rule.clamp();
        }
        self.global.clamp();
    }
}

/// A compiled rule: the path pattern as a `Regex`, the method filter as a
/// set (empty means "any"), and faults with their state keys already
/// injected.
pub struct CompiledRule {
    pub regex: Regex,
    pub methods: HashSet<http::Method>,
    pub faults: Vec<Fault>,
    pub probability: f64,
}

impl CompiledRule {
    pub fn matches_method(&self, method: &http::Method) -> bool {
        self.methods.is_empty() || self.methods.contains(method)
    }
}

/// The output of the rule compiler: compiled rules, the (unchanged) global
/// faults, and a map of freshly built stateful machines keyed by
/// `"<ruleIdx>:<faultIdx>"`.
pub struct CompiledConfig {
    pub rules: Vec<CompiledRule>,
    pub global: GlobalFaults,
    pub machines: HashMap<String, StatefulMachine>,
}

/// Reject out-of-range numeric bounds that clamping doesn't cover (clamping
/// only touches probabilities). A non-positive bandwidth makes a
/// bandwidth-shaping fault meaningless rather than merely degenerate.
fn validate_fault(fault: &Fault) -> Result<()> {
    match fault.kind {
        FaultKind::SlowBody => {
            let bps = fault.config.get_f64("bytesPerSecond", 1024.0);
            if bps <= 0.0 {
                return Err(FaultlineError::Config(format!(
                    "slow_body requires bytesPerSecond > 0, got {bps}"
                )));
            }
        }
        FaultKind::PartialResponse => {
            let max_bytes = fault.config.get_u64("maxBytes", 1024);
            if max_bytes == 0 {
                return Err(FaultlineError::Config(
                    "partial_response requires maxBytes > 0".to_string(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

fn build_machine(kind: FaultKind, config: &FaultConfig) -> Option<StatefulMachine> {
    match kind {
        FaultKind::CircuitBreaker => Some(StatefulMachine::CircuitBreaker(Arc::new(
            CircuitBreaker::new(CircuitBreakerConfig::from(config)),
        ))),
        FaultKind::RetryAfter => Some(StatefulMachine::RetryAfter(Arc::new(
            RetryAfterTracker::new(RetryAfterConfig::from(config)),
        ))),
        FaultKind::ProgressiveDegradation => Some(StatefulMachine::ProgressiveDegradation(
            Arc::new(ProgressiveDegradation::new(ProgressiveDegradationConfig::from(
                config,
            ))),
        )),
        _ => None,
    }
}

/// Clamp, then compile a [`ChaosConfig`] into a [`CompiledConfig`]: parse
/// every path pattern into a `Regex`, resolve method filters, and build a
/// fresh stateful machine for every stateful fault position. The result is
/// meant to be swapped in atomically by the caller (the injector) so
/// in-flight requests never observe a half-built rule set.
pub fn compile_config(source: &ChaosConfig) -> Result<CompiledConfig> {
    let mut cfg = source.clone();
    cfg.clamp();

    let mut rules = Vec::with_capacity(cfg.rules.len());
    let mut machines = HashMap::new();

    for (rule_idx, rule) in cfg.rules.into_iter().enumerate() {
        let regex = Regex::new(&rule.path_pattern).map_err(|source| FaultlineError::InvalidPattern {
            pattern: rule.path_pattern.clone(),
            source,
        })?;

        let mut methods = HashSet::new();
        for raw in &rule.methods {
            match http::Method::from_bytes(raw.to_uppercase().as_bytes()) {
                Ok(m) => {
                    methods.insert(m);
                }
                Err(_) => {
                    tracing::warn!(method = %raw, "ignoring unrecognized HTTP method in rule");
                }
            }
        }

        let mut faults = Vec::with_capacity(rule.faults.len());
        for (fault_idx, mut fault) in rule.faults.into_iter().enumerate() {
            validate_fault(&fault)?;
            if fault.kind.is_stateful() {
                let key = format!("{rule_idx}:{fault_idx}");
                if let Some(machine) = build_machine(fault.kind, &fault.config) {
                    machines.insert(key.clone(), machine);
                }
                fault.state_key = Some(key);
            }
            faults.push(fault);
        }

        rules.push(CompiledRule {
            regex,
            methods,
            faults,
            probability: rule.probability,
        });
    }

    for global in [&cfg.global.latency, &cfg.global.error, &cfg.global.bandwidth] {
        if let Some(fault) = global {
            validate_fault(fault)?;
        }
    }

    Ok(CompiledConfig {
        rules,
        global: cfg.global,
        machines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_supports_all_suffixes() {
        assert_eq!(parse_duration("100ms"), Some(Duration::from_millis(100)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("250"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("bogus"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn clamp_forces_probabilities_into_unit_interval() {
        let mut cfg = ChaosConfig {
            enabled: true,
            rules: vec![Rule {
                path_pattern: "/api/.*".into(),
                methods: vec![],
                probability: 1.5,
                faults: vec![Fault {
                    kind: FaultKind::Latency,
                    probability: -0.5,
                    config: FaultConfig::default(),
                    state_key: None,
                }],
            }],
            global: GlobalFaults::default(),
        };

        cfg.clamp();
        assert_eq!(cfg.rules[0].probability, 1.0);
        assert_eq!(cfg.rules[0].faults[0].probability, 0.0);
    }

    #[test]
    fn clamp_is_idempotent() {
        let mut cfg = ChaosConfig {
            enabled: true,
            rules: vec![Rule {
                path_pattern: ".*".into(),
                methods: vec![],
                probability: 2.0,
                faults: vec![],
            }],
            global: GlobalFaults::default(),
        };

        cfg.clamp();
        let once = cfg.clone();
        cfg.clamp();
        assert_eq!(once.rules[0].probability, cfg.rules[0].probability);
    }

    #[test]
    fn compiler_rejects_invalid_regex() {
        let cfg = ChaosConfig {
            enabled: true,
            rules: vec![Rule {
                path_pattern: "(unclosed".into(),
                methods: vec![],
                probability: 1.0,
                faults: vec![],
            }],
            global: GlobalFaults::default(),
        };

        assert!(matches!(
            compile_config(&cfg),
            Err(FaultlineError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn compiler_rejects_non_positive_bandwidth() {
        let cfg = ChaosConfig {
            enabled: true,
            rules: vec![Rule {
                path_pattern: "/api/.*".into(),
                methods: vec![],
                probability: 1.0,
                faults: vec![Fault {
                    kind: FaultKind::SlowBody,
                    probability: 1.0,
                    config: FaultConfig(HashMap::from([(
                        "bytesPerSecond".to_string(),
                        serde_json::json!(0),
                    )])),
                    state_key: None,
                }],
            }],
            global: GlobalFaults::default(),
        };

        assert!(matches!(compile_config(&cfg), Err(FaultlineError::Config(_))));
    }

    #[test]
    fn compiler_injects_state_keys_for_stateful_faults_only() {
        let cfg = ChaosConfig {
            enabled: true,
            rules: vec![Rule {
                path_pattern: "/api/.*".into(),
                methods: vec![],
                probability: 1.0,
                faults: vec![
                    Fault {
                        kind: FaultKind::Latency,
                        probability: 1.0,
                        config: FaultConfig::default(),
                        state_key: None,
                    },
                    Fault {
                        kind: FaultKind::CircuitBreaker,
                        probability: 1.0,
                        config: FaultConfig::default(),
                        state_key: None,
                    },
                ],
            }],
            global: GlobalFaults::default(),
        };

        let compiled = compile_config(&cfg).unwrap();
        assert_eq!(compiled.rules[0].faults[0].state_key, None);
        assert_eq!(compiled.rules[0].faults[1].state_key, Some("0:1".to_string()));
        assert!(compiled.machines.contains_key("0:1"));
    }

    #[test]
    fn method_filter_empty_means_any() {
        let compiled_rule = CompiledRule {
            regex: Regex::new(".*").unwrap(),
            methods: HashSet::new(),
            faults: vec![],
            probability: 1.0,
        };
        assert!(compiled_rule.matches_method(&http::Method::GET));
        assert!(compiled_rule.matches_method(&http::Method::POST));
    }
}
