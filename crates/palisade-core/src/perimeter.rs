//! Perimeter defense — first line of the pipeline.
//!
//! Five independent rule checks per action: resource ceilings, API rate
//! limiting, network domain rules, forbidden filesystem paths, and
//! self-modification targets. Pure synchronous computation; the most severe
//! firing check wins, ties broken by the fixed check order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Duration;
use regex::RegexBuilder;
use tracing::{debug, warn};

use crate::analyzer::{AnalysisContext, Analyzer};
use crate::config::PerimeterConfig;
use crate::domain::{
    ActionType, AgentAction, AnalysisLayer, EnforcementAction, ThreatAssessment, ThreatLevel,
};

/// Filesystem locations whose mere mention in a file operation is treated
/// as an attempt on the host.
const FORBIDDEN_PATH_PATTERNS: &[&str] = &[
    "/etc/shadow",
    "/etc/passwd",
    r"\.ssh/id_rsa",
    r"C:\\Windows\\System32\\config\\SAM",
    r"\.aws/credentials",
    r"\.kube/config",
];

const SUSPICIOUS_URL_FRAGMENTS: &[&str] = &["eval(", "exec(", "base64", "shell", "cmd"];

const DANGEROUS_FILE_OPERATIONS: &[&str] = &["delete", "chmod", "chown", "execute"];

const SYSTEM_PATH_PREFIXES: &[&str] = &["/etc", "/sys", "/proc", "C:\\Windows", "C:\\Program Files"];

/// Self-modification targets that trigger the kill switch outright.
const CRITICAL_MODIFICATION_TARGETS: &[&str] = &[
    "system_prompt",
    "safety_constraints",
    "monitoring_hooks",
    "memory_structure",
];

/// Per-agent resource readings, injected so real metering stays outside the
/// core. The default returns fixed nominal values.
pub trait ResourceSampler: Send + Sync {
    fn cpu_percent(&self, agent_id: &str) -> f64;
    fn memory_mb(&self, agent_id: &str) -> f64;
}

/// Sampler returning constant nominal readings — never trips the default
/// ceilings.
#[derive(Debug, Clone)]
pub struct FixedResourceSampler {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

impl Default for FixedResourceSampler {
    fn default() -> Self {
        Self {
            cpu_percent: 50.0,
            memory_mb: 256.0,
        }
    }
}

impl ResourceSampler for FixedResourceSampler {
    fn cpu_percent(&self, _agent_id: &str) -> f64 {
        self.cpu_percent
    }

    fn memory_mb(&self, _agent_id: &str) -> f64 {
        self.memory_mb
    }
}

/// Snapshot of perimeter-side tracking state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PerimeterStats {
    pub tracked_agents: usize,
    pub total_api_calls: usize,
    pub suspicious_domains: usize,
    pub blocked_domain_rules: usize,
}

/// Rule-based perimeter layer.
pub struct PerimeterDefense {
    config: PerimeterConfig,
    sampler: Box<dyn ResourceSampler>,
    forbidden_paths: Vec<regex::Regex>,
    api_calls: Mutex<HashMap<String, VecDeque<chrono::DateTime<chrono::Utc>>>>,
    suspicious_domains: Mutex<HashSet<String>>,
}

impl PerimeterDefense {
    pub fn new(config: PerimeterConfig) -> Self {
        Self::with_sampler(config, Box::new(FixedResourceSampler::default()))
    }

    /// Build with a custom resource sampler.
    pub fn with_sampler(config: PerimeterConfig, sampler: Box<dyn ResourceSampler>) -> Self {
        let forbidden_paths = FORBIDDEN_PATH_PATTERNS
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .expect("forbidden path pattern is a valid regex")
            })
            .collect();

        Self {
            config,
            sampler,
            forbidden_paths,
            api_calls: Mutex::new(HashMap::new()),
            suspicious_domains: Mutex::new(HashSet::new()),
        }
    }

    /// Evaluate one action against all five checks.
    pub fn evaluate(&self, action: &AgentAction) -> Option<ThreatAssessment> {
        let mut threats = Vec::new();

        if let Some(t) = self.check_resource_limits(action) {
            threats.push(t);
        }
        if let Some(t) = self.check_api_rate_limit(action) {
            threats.push(t);
        }
        if let Some(t) = self.check_network_access(action) {
            threats.push(t);
        }
        if let Some(t) = self.check_forbidden_paths(action) {
            threats.push(t);
        }
        if action.action_type == ActionType::SelfModification {
            threats.push(self.check_self_modification(action));
        }

        // First-seen-max: checks run in a fixed order, so ties resolve to
        // the earlier check deterministically.
        let max = threats
            .into_iter()
            .reduce(|best, t| if t.threat_level > best.threat_level { t } else { best })?;

        warn!(
            agent_id = %action.agent_id,
            threat_level = %max.threat_level,
            "perimeter threat detected"
        );
        Some(max)
    }

    fn check_resource_limits(&self, action: &AgentAction) -> Option<ThreatAssessment> {
        let cpu = self.sampler.cpu_percent(&action.agent_id);
        let memory = self.sampler.memory_mb(&action.agent_id);

        let mut reasons = Vec::new();
        if cpu > self.config.max_cpu_percent {
            reasons.push(format!(
                "excessive CPU usage: {cpu:.1}% (limit: {:.1}%)",
                self.config.max_cpu_percent
            ));
        }
        if memory > self.config.max_memory_mb {
            reasons.push(format!(
                "excessive memory usage: {memory:.0}MB (limit: {:.0}MB)",
                self.config.max_memory_mb
            ));
        }

        if reasons.is_empty() {
            return None;
        }

        Some(ThreatAssessment::new(
            &action.id,
            ThreatLevel::Concerning,
            0.9,
            reasons,
            EnforcementAction::Throttle,
            AnalysisLayer::Perimeter,
        ))
    }

    fn check_api_rate_limit(&self, action: &AgentAction) -> Option<ThreatAssessment> {
        if action.action_type != ActionType::ApiCall {
            return None;
        }

        let window_start = action.timestamp - Duration::seconds(60);
        let max_calls = self.config.max_api_calls_per_minute as usize;

        let recent_calls = {
            let mut tracker = self.api_calls.lock().expect("api call tracker poisoned");
            let calls = tracker.entry(action.agent_id.clone()).or_default();
            calls.push_back(action.timestamp);
            if calls.len() > 1000 {
                calls.pop_front();
            }
            calls.iter().filter(|t| **t > window_start).count()
        };

        if recent_calls > max_calls {
            return Some(ThreatAssessment::new(
                &action.id,
                ThreatLevel::Suspicious,
                0.95,
                vec![
                    format!("rate limit exceeded: {recent_calls} calls/min (limit: {max_calls})"),
                    "possible flooding or denial-of-service attempt".to_string(),
                ],
                EnforcementAction::Throttle,
                AnalysisLayer::Perimeter,
            ));
        }

        if recent_calls as f64 > max_calls as f64 * 0.8 {
            debug!(
                agent_id = %action.agent_id,
                recent_calls,
                max_calls,
                "agent approaching API rate limit"
            );
        }

        None
    }

    fn check_network_access(&self, action: &AgentAction) -> Option<ThreatAssessment> {
        if action.action_type != ActionType::NetworkRequest {
            return None;
        }

        let url = action.str_param("url").unwrap_or_default();
        let domain = extract_domain(url);

        for blocked in &self.config.blocked_domains {
            if domain_matches(&domain, blocked) {
                return Some(ThreatAssessment::new(
                    &action.id,
                    ThreatLevel::Dangerous,
                    1.0,
                    vec![format!("access to blocked domain: {domain} (rule: {blocked})")],
                    EnforcementAction::Block,
                    AnalysisLayer::Perimeter,
                ));
            }
        }

        if !self.config.allowed_domains.is_empty()
            && !self
                .config
                .allowed_domains
                .iter()
                .any(|allowed| domain_matches(&domain, allowed))
        {
            return Some(ThreatAssessment::new(
                &action.id,
                ThreatLevel::Suspicious,
                0.8,
                vec![
                    format!("access to unauthorized domain: {domain}"),
                    "domain is not on the allowlist".to_string(),
                ],
                EnforcementAction::RequireApproval,
                AnalysisLayer::Perimeter,
            ));
        }

        let lowered = url.to_lowercase();
        for fragment in SUSPICIOUS_URL_FRAGMENTS {
            if lowered.contains(fragment) {
                self.suspicious_domains
                    .lock()
                    .expect("suspicious domain set poisoned")
                    .insert(domain.clone());
                return Some(ThreatAssessment::new(
                    &action.id,
                    ThreatLevel::Concerning,
                    0.7,
                    vec![format!("URL contains suspicious fragment: {fragment}")],
                    EnforcementAction::Sandbox,
                    AnalysisLayer::Perimeter,
                ));
            }
        }

        None
    }

    fn check_forbidden_paths(&self, action: &AgentAction) -> Option<ThreatAssessment> {
        if action.action_type != ActionType::FileOperation {
            return None;
        }

        let filepath = action.str_param("path").unwrap_or_default();
        let operation = action.str_param("operation").unwrap_or_default();

        for pattern in &self.forbidden_paths {
            if pattern.is_match(filepath) {
                return Some(ThreatAssessment::new(
                    &action.id,
                    ThreatLevel::Critical,
                    1.0,
                    vec![
                        format!("attempted access to critical system file: {filepath}"),
                        format!("forbidden path pattern matched: {}", pattern.as_str()),
                    ],
                    EnforcementAction::Kill,
                    AnalysisLayer::Perimeter,
                ));
            }
        }

        if DANGEROUS_FILE_OPERATIONS.contains(&operation) {
            for prefix in SYSTEM_PATH_PREFIXES {
                if filepath.starts_with(prefix) {
                    return Some(ThreatAssessment::new(
                        &action.id,
                        ThreatLevel::Dangerous,
                        0.9,
                        vec![
                            "dangerous operation in a system directory".to_string(),
                            format!("operation: {operation}, path: {filepath}"),
                        ],
                        EnforcementAction::Block,
                        AnalysisLayer::Perimeter,
                    ));
                }
            }
        }

        None
    }

    fn check_self_modification(&self, action: &AgentAction) -> ThreatAssessment {
        let modification_type = action.str_param("modification_type").unwrap_or_default();
        let target = action.str_param("target").unwrap_or_default();

        let mut reasons = vec![
            format!("self-modification attempt detected: {modification_type}"),
            format!("target: {target}"),
        ];

        if CRITICAL_MODIFICATION_TARGETS.contains(&modification_type) {
            reasons.push("attempt to modify a critical component".to_string());
            return ThreatAssessment::new(
                &action.id,
                ThreatLevel::Critical,
                1.0,
                reasons,
                EnforcementAction::Kill,
                AnalysisLayer::Perimeter,
            );
        }

        ThreatAssessment::new(
            &action.id,
            ThreatLevel::Suspicious,
            0.8,
            reasons,
            EnforcementAction::RequireApproval,
            AnalysisLayer::Perimeter,
        )
    }

    /// Snapshot of perimeter tracking state.
    pub fn stats(&self) -> PerimeterStats {
        let tracker = self.api_calls.lock().expect("api call tracker poisoned");
        PerimeterStats {
            tracked_agents: tracker.len(),
            total_api_calls: tracker.values().map(VecDeque::len).sum(),
            suspicious_domains: self
                .suspicious_domains
                .lock()
                .expect("suspicious domain set poisoned")
                .len(),
            blocked_domain_rules: self.config.blocked_domains.len(),
        }
    }
}

#[async_trait]
impl Analyzer for PerimeterDefense {
    fn layer(&self) -> AnalysisLayer {
        AnalysisLayer::Perimeter
    }

    async fn analyze(
        &self,
        action: &AgentAction,
        _context: Option<&AnalysisContext>,
    ) -> Option<ThreatAssessment> {
        self.evaluate(action)
    }
}

/// Extract the host portion of a URL: scheme stripped, lowercased, port and
/// trailing dot removed. A bare host without a scheme is accepted as-is.
fn extract_domain(url: &str) -> String {
    let without_scheme = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let host = without_scheme
        .split('/')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    let host = host.trim_end_matches('.');
    host.split(':').next().unwrap_or_default().to_string()
}

/// Whether `domain` equals the rule's root or is one of its subdomains.
/// Rules may carry a leading `*.`, which is ignored.
fn domain_matches(domain: &str, rule: &str) -> bool {
    let normalized = rule
        .to_lowercase()
        .trim_start_matches("*.")
        .trim_end_matches('.')
        .to_string();
    domain == normalized || domain.ends_with(&format!(".{normalized}"))
}
