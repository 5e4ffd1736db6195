//! Oracle — LLM-backed intent analysis, the most expensive layer.
//!
//! Each escalated action is analyzed along three dimensions (intent, goal
//! alignment, deception), each as an independent JSON-constrained request
//! to the completion backend. Failures degrade per dimension: intent falls
//! back to a rule table, the other two simply contribute nothing. Results
//! are cached under a content hash of the semantic request payload.

pub mod backend;
pub mod prompts;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::analyzer::{AnalysisContext, Analyzer};
use crate::config::OracleConfig;
use crate::domain::{
    ActionType, AgentAction, AnalysisLayer, EnforcementAction, ThreatAssessment, ThreatLevel,
};

use backend::{CompletionBackend, CompletionRequest, HttpCompletionBackend};

const INTENT_TEMPERATURE: f64 = 0.3;
const ALIGNMENT_TEMPERATURE: f64 = 0.2;
const DECEPTION_TEMPERATURE: f64 = 0.1;

/// Code snippets containing any of these trip the rule-based fallback.
const DANGEROUS_CODE_KEYWORDS: &[&str] = &["eval", "exec", "compile", "__import__", "subprocess"];

/// Hosting services commonly used to stage external payloads.
const SUSPICIOUS_URL_SOURCES: &[&str] = &["pastebin", "raw.githubusercontent", "bit.ly"];

/// Intent-analysis payload reported by the backend.
#[derive(Debug, Clone, Deserialize)]
struct IntentAnalysis {
    #[serde(default)]
    intent: String,
    #[serde(default)]
    threat_level: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    deception_detected: bool,
    #[serde(default)]
    deception_evidence: String,
    #[serde(default)]
    red_flags: Vec<String>,
}

/// Goal-alignment payload.
#[derive(Debug, Clone, Deserialize)]
struct AlignmentAnalysis {
    #[serde(default = "default_aligned")]
    is_aligned: bool,
    #[serde(default = "default_confidence")]
    alignment_score: f64,
    #[serde(default)]
    misalignment_type: String,
    #[serde(default)]
    risks: Vec<String>,
}

/// Deception-check payload.
#[derive(Debug, Clone, Deserialize)]
struct DeceptionAnalysis {
    #[serde(default)]
    deception_probability: f64,
    #[serde(default)]
    evidence: Vec<String>,
}

fn default_confidence() -> f64 {
    0.5
}

fn default_aligned() -> bool {
    true
}

struct CacheEntry {
    assessment: ThreatAssessment,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct OracleCounters {
    total_analyses: u64,
    threat_distribution: HashMap<ThreatLevel, u64>,
    deception_detections: u64,
}

/// Snapshot of oracle activity.
#[derive(Debug, Clone, Serialize)]
pub struct OracleStats {
    pub total_analyses: u64,
    pub threat_distribution: HashMap<String, u64>,
    pub cache_size: usize,
    pub deception_detections: u64,
}

/// LLM-prompted multi-dimension analyzer with content-addressed caching.
pub struct OracleAnalyzer {
    config: OracleConfig,
    backend: Arc<dyn CompletionBackend>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    counters: Mutex<OracleCounters>,
}

impl OracleAnalyzer {
    /// Build against the HTTP backend named in the configuration.
    pub fn new(config: OracleConfig) -> Self {
        let backend = Arc::new(HttpCompletionBackend::new(
            config.llm_endpoint.clone(),
            config.analysis_timeout,
        ));
        Self::with_backend(config, backend)
    }

    /// Build with an injected backend (tests, alternative transports).
    pub fn with_backend(config: OracleConfig, backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            config,
            backend,
            cache: Mutex::new(HashMap::new()),
            counters: Mutex::new(OracleCounters::default()),
        }
    }

    /// Run the three-dimension analysis, consulting the cache first.
    pub async fn evaluate(
        &self,
        action: &AgentAction,
        context: Option<&AnalysisContext>,
    ) -> Option<ThreatAssessment> {
        let cache_key = cache_key(action, context);

        if self.config.enable_caching {
            let mut cache = self.cache.lock().expect("oracle cache poisoned");
            if let Some(entry) = cache.get(&cache_key) {
                let age_secs =
                    (Utc::now() - entry.created_at).num_milliseconds() as f64 / 1000.0;
                if age_secs <= self.config.cache_ttl_seconds as f64 {
                    debug!(action_id = %action.id, "oracle cache hit");
                    return Some(entry.assessment.clone());
                }
                cache.remove(&cache_key);
            }
        }

        let intent = self.analyze_intent(action, context).await;
        let alignment = self.analyze_goal_alignment(action, context).await;
        let deception = self.detect_deception(action, context).await;

        let assessment = self.aggregate(action, intent, alignment, deception)?;

        if self.config.enable_caching {
            self.cache.lock().expect("oracle cache poisoned").insert(
                cache_key,
                CacheEntry {
                    assessment: assessment.clone(),
                    created_at: Utc::now(),
                },
            );
        }

        Some(assessment)
    }

    /// Intent is the one dimension that never goes dark: transport or parse
    /// failures fall back to the rule table.
    async fn analyze_intent(
        &self,
        action: &AgentAction,
        context: Option<&AnalysisContext>,
    ) -> IntentAnalysis {
        match self
            .query::<IntentAnalysis>(prompts::INTENT_ANALYSIS, action, context, INTENT_TEMPERATURE)
            .await
        {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(action_id = %action.id, %reason, "intent analysis degraded to rule table");
                rule_based_intent(action)
            }
        }
    }

    async fn analyze_goal_alignment(
        &self,
        action: &AgentAction,
        context: Option<&AnalysisContext>,
    ) -> Option<AlignmentAnalysis> {
        match self
            .query::<AlignmentAnalysis>(
                prompts::GOAL_ALIGNMENT,
                action,
                context,
                ALIGNMENT_TEMPERATURE,
            )
            .await
        {
            Ok(parsed) => Some(parsed),
            Err(reason) => {
                warn!(action_id = %action.id, %reason, "alignment analysis unavailable");
                None
            }
        }
    }

    async fn detect_deception(
        &self,
        action: &AgentAction,
        context: Option<&AnalysisContext>,
    ) -> Option<DeceptionAnalysis> {
        match self
            .query::<DeceptionAnalysis>(
                prompts::DECEPTION_CHECK,
                action,
                context,
                DECEPTION_TEMPERATURE,
            )
            .await
        {
            Ok(parsed) => Some(parsed),
            Err(reason) => {
                warn!(action_id = %action.id, %reason, "deception check unavailable");
                None
            }
        }
    }

    async fn query<T: serde::de::DeserializeOwned>(
        &self,
        system_prompt: &str,
        action: &AgentAction,
        context: Option<&AnalysisContext>,
        temperature: f64,
    ) -> Result<T, String> {
        let prompt = prompts::build_prompt(system_prompt, action, context);
        let completion = self
            .backend
            .complete(CompletionRequest {
                model: self.config.llm_model.clone(),
                prompt,
                temperature,
            })
            .await
            .map_err(|err| err.to_string())?;

        serde_json::from_str(&completion).map_err(|err| format!("malformed payload: {err}"))
    }

    /// Merge whatever dimensions produced results into one assessment.
    fn aggregate(
        &self,
        action: &AgentAction,
        intent: IntentAnalysis,
        alignment: Option<AlignmentAnalysis>,
        deception: Option<DeceptionAnalysis>,
    ) -> Option<ThreatAssessment> {
        let mut levels = Vec::new();
        let mut confidences = Vec::new();
        let mut reasons = Vec::new();

        levels.push(ThreatLevel::parse_lenient(&intent.threat_level));
        confidences.push(intent.confidence);
        reasons.push(format!("detected intent: {}", intent.intent));
        if intent.deception_detected {
            reasons.push(format!("deception indicators: {}", intent.deception_evidence));
        }
        reasons.extend(intent.red_flags);

        let mut deception_flagged = intent.deception_detected;

        if let Some(alignment) = alignment {
            if !alignment.is_aligned {
                levels.push(ThreatLevel::Dangerous);
                confidences.push(alignment.alignment_score);
                reasons.push(format!("goal misalignment: {}", alignment.misalignment_type));
                reasons.extend(alignment.risks);
            }
        }

        if let Some(deception) = deception {
            if deception.deception_probability > 0.7 {
                levels.push(ThreatLevel::Critical);
                confidences.push(deception.deception_probability);
                reasons.push(format!(
                    "high deception probability: {:.2}",
                    deception.deception_probability
                ));
                reasons.extend(deception.evidence);
                deception_flagged = true;
            }
        }

        let max_level = levels.iter().max().copied().unwrap_or(ThreatLevel::Safe);
        let avg_confidence = if confidences.is_empty() {
            0.5
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        };

        {
            let mut counters = self.counters.lock().expect("oracle counters poisoned");
            counters.total_analyses += 1;
            *counters.threat_distribution.entry(max_level).or_default() += 1;
            if deception_flagged {
                counters.deception_detections += 1;
            }
        }

        Some(ThreatAssessment::new(
            &action.id,
            max_level,
            avg_confidence,
            reasons,
            self.determine_enforcement(max_level, avg_confidence),
            AnalysisLayer::Oracle,
        ))
    }

    /// Low confidence downgrades the response; high confidence applies the
    /// standard level mapping.
    fn determine_enforcement(&self, level: ThreatLevel, confidence: f64) -> EnforcementAction {
        if confidence < self.config.min_confidence {
            return if level >= ThreatLevel::Dangerous {
                EnforcementAction::RequireApproval
            } else {
                EnforcementAction::Log
            };
        }

        match level {
            ThreatLevel::Critical => EnforcementAction::Kill,
            ThreatLevel::Dangerous => EnforcementAction::Quarantine,
            ThreatLevel::Concerning => EnforcementAction::Sandbox,
            ThreatLevel::Suspicious => EnforcementAction::RequireApproval,
            ThreatLevel::Safe => EnforcementAction::Allow,
        }
    }

    /// Activity snapshot.
    pub fn stats(&self) -> OracleStats {
        let counters = self.counters.lock().expect("oracle counters poisoned");
        OracleStats {
            total_analyses: counters.total_analyses,
            threat_distribution: counters
                .threat_distribution
                .iter()
                .map(|(level, count)| (level.to_string(), *count))
                .collect(),
            cache_size: self.cache.lock().expect("oracle cache poisoned").len(),
            deception_detections: counters.deception_detections,
        }
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}

#[async_trait]
impl Analyzer for OracleAnalyzer {
    fn layer(&self) -> AnalysisLayer {
        AnalysisLayer::Oracle
    }

    async fn analyze(
        &self,
        action: &AgentAction,
        context: Option<&AnalysisContext>,
    ) -> Option<ThreatAssessment> {
        self.evaluate(action, context).await
    }
}

/// Rule table used when the backend cannot answer.
fn rule_based_intent(action: &AgentAction) -> IntentAnalysis {
    let mut threat_level = "SAFE";
    let mut red_flags = Vec::new();

    match action.action_type {
        ActionType::SelfModification => {
            threat_level = "CRITICAL";
            red_flags.push("self-modification always requires deep analysis".to_string());
        }
        ActionType::CodeExecution => {
            let code = action.str_param("code").unwrap_or_default().to_lowercase();
            for keyword in DANGEROUS_CODE_KEYWORDS {
                if code.contains(keyword) {
                    threat_level = "DANGEROUS";
                    red_flags.push(format!("code contains dangerous keyword: {keyword}"));
                }
            }
        }
        ActionType::NetworkRequest => {
            let url = action.str_param("url").unwrap_or_default().to_lowercase();
            if SUSPICIOUS_URL_SOURCES.iter().any(|s| url.contains(s)) {
                threat_level = "SUSPICIOUS";
                red_flags.push("suspicious source URL for external content".to_string());
            }
        }
        _ => {}
    }

    IntentAnalysis {
        intent: format!("execute {}", action.action_type),
        threat_level: threat_level.to_string(),
        confidence: 0.65,
        deception_detected: false,
        deception_evidence: String::new(),
        red_flags,
    }
}

/// Deterministic content hash of the semantic request payload: the action's
/// analyzable fields plus the last three context actions.
fn cache_key(action: &AgentAction, context: Option<&AnalysisContext>) -> String {
    #[derive(Serialize)]
    struct ContextEntry<'a> {
        action_type: ActionType,
        description: &'a str,
    }

    #[derive(Serialize)]
    struct KeyPayload<'a> {
        action_type: ActionType,
        parameters: &'a std::collections::BTreeMap<String, serde_json::Value>,
        description: &'a str,
        reasoning: Option<&'a str>,
        agent_id: &'a str,
        context_recent_actions: Vec<ContextEntry<'a>>,
    }

    let context_recent_actions = context
        .map(|c| {
            let skip = c.recent_actions.len().saturating_sub(3);
            c.recent_actions[skip..]
                .iter()
                .map(|summary| ContextEntry {
                    action_type: summary.action_type,
                    description: &summary.description,
                })
                .collect()
        })
        .unwrap_or_default();

    let payload = KeyPayload {
        action_type: action.action_type,
        parameters: &action.parameters,
        description: &action.description,
        reasoning: action.reasoning.as_deref(),
        agent_id: &action.agent_id,
        context_recent_actions,
    };

    let serialized = serde_json::to_vec(&payload).expect("cache key payload serializes");
    hex::encode(Sha256::digest(&serialized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BackendError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend that always returns the same completion text.
    struct StaticBackend {
        completion: String,
        calls: AtomicUsize,
    }

    impl StaticBackend {
        fn new(completion: &str) -> Self {
            Self {
                completion: completion.to_string(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for StaticBackend {
        async fn complete(&self, _request: CompletionRequest) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.completion.clone())
        }
    }

    /// Backend that always fails at the transport level.
    struct DownBackend;

    #[async_trait]
    impl CompletionBackend for DownBackend {
        async fn complete(&self, _request: CompletionRequest) -> Result<String, BackendError> {
            Err(BackendError::Status { status: 503 })
        }
    }

    fn oracle_with(backend: Arc<dyn CompletionBackend>, ttl: u64) -> OracleAnalyzer {
        OracleAnalyzer::with_backend(
            OracleConfig {
                enable_caching: true,
                cache_ttl_seconds: ttl,
                ..OracleConfig::default()
            },
            backend,
        )
    }

    fn suspicious_intent_json() -> &'static str {
        r#"{"intent": "probe the API", "threat_level": "SUSPICIOUS", "confidence": 0.9,
            "deception_detected": false, "deception_evidence": "", "red_flags": []}"#
    }

    fn mk(description: &str) -> AgentAction {
        AgentAction::new("agent-a", ActionType::ApiCall, description)
            .with_parameter("x", 1)
            .with_reasoning("r")
    }

    #[tokio::test]
    async fn test_reported_level_drives_assessment() {
        let oracle = oracle_with(Arc::new(StaticBackend::new(suspicious_intent_json())), 3600);
        let result = oracle.evaluate(&mk("A"), None).await.unwrap();
        assert_eq!(result.threat_level, ThreatLevel::Suspicious);
        assert_eq!(result.recommended_action, EnforcementAction::RequireApproval);
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cache_key_changes_with_description() {
        let oracle = oracle_with(Arc::new(StaticBackend::new(suspicious_intent_json())), 3600);
        assert!(oracle.evaluate(&mk("A"), None).await.is_some());
        assert!(oracle.evaluate(&mk("B"), None).await.is_some());
        assert_eq!(oracle.cache_len(), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_backend() {
        let backend = Arc::new(StaticBackend::new(suspicious_intent_json()));
        let oracle = oracle_with(backend.clone(), 3600);

        oracle.evaluate(&mk("A"), None).await.unwrap();
        let calls_after_first = backend.calls.load(Ordering::SeqCst);
        oracle.evaluate(&mk("A"), None).await.unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), calls_after_first);
        assert_eq!(oracle.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_cache_ttl_evicts_and_replaces() {
        let oracle = oracle_with(Arc::new(StaticBackend::new(suspicious_intent_json())), 0);
        oracle.evaluate(&mk("A"), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        oracle.evaluate(&mk("A"), None).await.unwrap();
        // The expired entry was evicted, not duplicated.
        assert_eq!(oracle.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_context_actions_change_cache_key() {
        let oracle = oracle_with(Arc::new(StaticBackend::new(suspicious_intent_json())), 3600);
        let action = mk("A");

        let context = AnalysisContext {
            recent_actions: vec![crate::analyzer::ActionSummary {
                action_type: ActionType::FileOperation,
                description: "read config".to_string(),
                timestamp: action.timestamp,
            }],
            previous_threats: vec![],
        };

        oracle.evaluate(&action, None).await.unwrap();
        oracle.evaluate(&action, Some(&context)).await.unwrap();
        assert_eq!(oracle.cache_len(), 2);
    }

    #[tokio::test]
    async fn test_backend_outage_falls_back_to_rules() {
        let oracle = oracle_with(Arc::new(DownBackend), 3600);
        let action = AgentAction::new("agent-a", ActionType::SelfModification, "rewrite core")
            .with_parameter("modification_type", "weights");

        let result = oracle.evaluate(&action, None).await.unwrap();
        assert_eq!(result.threat_level, ThreatLevel::Critical);
        assert_eq!(result.recommended_action, EnforcementAction::Kill);
        assert!((result.confidence - 0.65).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_malformed_completion_falls_back_to_rules() {
        let oracle = oracle_with(Arc::new(StaticBackend::new("not json at all")), 3600);
        let action = AgentAction::new("agent-a", ActionType::CodeExecution, "run helper")
            .with_parameter("code", "subprocess.run(['rm', '-rf', '/'])");

        let result = oracle.evaluate(&action, None).await.unwrap();
        assert_eq!(result.threat_level, ThreatLevel::Dangerous);
        assert!(result.reasons.iter().any(|r| r.contains("subprocess")));
    }

    #[tokio::test]
    async fn test_low_confidence_downgrades_enforcement() {
        let json = r#"{"intent": "wipe backups", "threat_level": "DANGEROUS",
                       "confidence": 0.3, "red_flags": []}"#;
        let oracle = oracle_with(Arc::new(StaticBackend::new(json)), 3600);

        let result = oracle.evaluate(&mk("A"), None).await.unwrap();
        assert_eq!(result.threat_level, ThreatLevel::Dangerous);
        assert_eq!(result.recommended_action, EnforcementAction::RequireApproval);
    }

    #[tokio::test]
    async fn test_misalignment_raises_level() {
        // The same payload parses into all three dimension schemas; the
        // alignment fields mark the action misaligned.
        let json = r#"{"intent": "optimize metric", "threat_level": "SAFE", "confidence": 0.9,
                       "is_aligned": false, "alignment_score": 0.8,
                       "misalignment_type": "goodhart", "risks": ["metric gaming"]}"#;
        let oracle = oracle_with(Arc::new(StaticBackend::new(json)), 3600);

        let result = oracle.evaluate(&mk("A"), None).await.unwrap();
        assert_eq!(result.threat_level, ThreatLevel::Dangerous);
        assert!(result.reasons.iter().any(|r| r.contains("goodhart")));
    }

    #[tokio::test]
    async fn test_high_deception_probability_is_critical() {
        let json = r#"{"intent": "routine", "threat_level": "SAFE", "confidence": 0.9,
                       "deception_probability": 0.95, "evidence": ["stated goal mismatch"]}"#;
        let oracle = oracle_with(Arc::new(StaticBackend::new(json)), 3600);

        let result = oracle.evaluate(&mk("A"), None).await.unwrap();
        assert_eq!(result.threat_level, ThreatLevel::Critical);
        assert_eq!(result.recommended_action, EnforcementAction::Kill);
    }

    #[tokio::test]
    async fn test_stats_track_analyses() {
        let oracle = oracle_with(Arc::new(StaticBackend::new(suspicious_intent_json())), 3600);
        oracle.evaluate(&mk("A"), None).await.unwrap();
        oracle.evaluate(&mk("B"), None).await.unwrap();

        let stats = oracle.stats();
        assert_eq!(stats.total_analyses, 2);
        assert_eq!(stats.cache_size, 2);
        assert_eq!(stats.threat_distribution.get("SUSPICIOUS"), Some(&2));
    }
}
