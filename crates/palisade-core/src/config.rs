//! Configuration surface for every defense layer.
//!
//! All fields carry serde defaults, so a partial document (or none at all)
//! deserializes into a working configuration — configuration gaps are never
//! fatal.

use serde::{Deserialize, Serialize};

use crate::domain::{ActionType, ThreatLevel};

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PalisadeConfig {
    pub perimeter: PerimeterConfig,
    pub heuristics: HeuristicsConfig,
    pub local_ai: LocalAiConfig,
    pub oracle: OracleConfig,
    pub enforcement: EnforcementConfig,
}

/// Perimeter layer: resource ceilings, rate limits, domain rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerimeterConfig {
    pub max_api_calls_per_minute: u32,
    pub max_memory_mb: f64,
    pub max_cpu_percent: f64,
    /// When non-empty, network requests outside this allowlist require
    /// approval.
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
}

impl Default for PerimeterConfig {
    fn default() -> Self {
        Self {
            max_api_calls_per_minute: 100,
            max_memory_mb: 1024.0,
            max_cpu_percent: 80.0,
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
        }
    }
}

/// Heuristic layer: window sizes, baselines, adaptive thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicsConfig {
    pub anomaly_threshold: f64,
    pub pattern_window_size: usize,
    pub learning_rate: f64,
    pub enable_adaptive_learning: bool,
    pub baseline_actions_required: u64,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: 0.7,
            pattern_window_size: 100,
            learning_rate: 0.01,
            enable_adaptive_learning: true,
            baseline_actions_required: 100,
        }
    }
}

/// Local guardian: rolling memory and scoring knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalAiConfig {
    pub memory_size: usize,
    pub min_samples: usize,
    pub sensitivity: f64,
    pub alert_threshold: f64,
}

impl Default for LocalAiConfig {
    fn default() -> Self {
        Self {
            memory_size: 250,
            min_samples: 12,
            sensitivity: 2.2,
            alert_threshold: 0.6,
        }
    }
}

/// Oracle layer: backend endpoint, escalation policy, cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub llm_model: String,
    pub llm_endpoint: String,
    /// Per-request timeout for the completion backend, in seconds.
    pub analysis_timeout: u64,
    /// Below this confidence the recommended enforcement is downgraded.
    pub min_confidence: f64,
    pub enable_caching: bool,
    pub cache_ttl_seconds: u64,
    /// When set, every action escalates to the oracle regardless of what
    /// the cheaper layers found.
    pub always_analyze: bool,
    /// Minimum severity seen in earlier layers that triggers escalation.
    pub min_escalation_level: ThreatLevel,
    /// Action types that always escalate, whatever the earlier layers say.
    pub critical_action_types: Vec<ActionType>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            llm_model: "llama3.2:latest".to_string(),
            llm_endpoint: "http://localhost:11434".to_string(),
            analysis_timeout: 30,
            min_confidence: 0.6,
            enable_caching: true,
            cache_ttl_seconds: 3600,
            always_analyze: false,
            min_escalation_level: ThreatLevel::Suspicious,
            critical_action_types: vec![ActionType::SelfModification, ActionType::CodeExecution],
        }
    }
}

/// Enforcement: containment thresholds and quarantine duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    /// Severity at which policy expects the action denied. Recommendations
    /// below this are logged as policy disagreements, not overridden.
    pub auto_block_threshold: ThreatLevel,
    /// Severity at which policy expects the agent killed. Same logging-only
    /// contract as `auto_block_threshold`.
    pub auto_kill_threshold: ThreatLevel,
    pub quarantine_duration_seconds: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            auto_block_threshold: ThreatLevel::Dangerous,
            auto_kill_threshold: ThreatLevel::Critical,
            quarantine_duration_seconds: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PalisadeConfig::default();
        assert_eq!(config.perimeter.max_api_calls_per_minute, 100);
        assert_eq!(config.heuristics.anomaly_threshold, 0.7);
        assert_eq!(config.local_ai.min_samples, 12);
        assert_eq!(config.oracle.cache_ttl_seconds, 3600);
        assert_eq!(config.enforcement.quarantine_duration_seconds, 3600);
        assert!(!config.oracle.always_analyze);
        assert_eq!(
            config.oracle.critical_action_types,
            vec![ActionType::SelfModification, ActionType::CodeExecution]
        );
    }

    #[test]
    fn test_partial_document_fills_gaps() {
        let config: PalisadeConfig = serde_json::from_str(
            r#"{
                "perimeter": {"blocked_domains": ["malicious.com"]},
                "oracle": {"always_analyze": true}
            }"#,
        )
        .unwrap();

        assert_eq!(config.perimeter.blocked_domains, vec!["malicious.com"]);
        assert_eq!(config.perimeter.max_api_calls_per_minute, 100);
        assert!(config.oracle.always_analyze);
        assert_eq!(config.oracle.min_escalation_level, ThreatLevel::Suspicious);
    }

    #[test]
    fn test_escalation_level_parses_from_name() {
        let config: OracleConfig =
            serde_json::from_str(r#"{"min_escalation_level": "DANGEROUS"}"#).unwrap();
        assert_eq!(config.min_escalation_level, ThreatLevel::Dangerous);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config: PalisadeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.heuristics.pattern_window_size, 100);
    }
}
