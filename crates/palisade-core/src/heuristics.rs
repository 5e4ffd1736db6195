//! Behavioral heuristics — the adaptive second layer.
//!
//! Learns each agent's normal behavior and runs five detectors per action:
//! known attack sequences, baseline deviation, temporal bursts, interaction
//! flooding, and gradual sensitivity escalation. Per-agent state is sharded
//! behind its own lock so agents never contend with each other.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::analyzer::{AnalysisContext, Analyzer};
use crate::config::HeuristicsConfig;
use crate::domain::{
    ActionType, AgentAction, AnalysisLayer, EnforcementAction, ThreatAssessment, ThreatLevel,
};

/// Known hostile action sequences, matched as an exact suffix of the
/// agent's rolling type sequence.
struct AttackPattern {
    name: &'static str,
    sequence: &'static [ActionType],
    weight: f64,
}

const ATTACK_PATTERNS: &[AttackPattern] = &[
    AttackPattern {
        name: "privilege_escalation",
        sequence: &[
            ActionType::FileOperation,
            ActionType::CodeExecution,
            ActionType::SelfModification,
        ],
        weight: 0.9,
    },
    AttackPattern {
        name: "data_exfiltration",
        sequence: &[
            ActionType::FileOperation,
            ActionType::FileOperation,
            ActionType::NetworkRequest,
        ],
        weight: 0.85,
    },
    AttackPattern {
        name: "lateral_movement",
        sequence: &[
            ActionType::AgentCommunication,
            ActionType::CodeExecution,
            ActionType::AgentCommunication,
        ],
        weight: 0.8,
    },
    AttackPattern {
        name: "reconnaissance",
        sequence: &[
            ActionType::ApiCall,
            ActionType::ApiCall,
            ActionType::FileOperation,
            ActionType::NetworkRequest,
        ],
        weight: 0.7,
    },
    AttackPattern {
        name: "resource_hoarding",
        sequence: &[
            ActionType::ResourceAllocation,
            ActionType::ResourceAllocation,
            ActionType::ResourceAllocation,
        ],
        weight: 0.75,
    },
];

/// Feature-history samples required before deviation scoring starts.
const FEATURE_BURN_IN: usize = 10;

/// Cap on the rolling feature history per agent.
const FEATURE_HISTORY_CAP: usize = 1000;

/// Everything the analyzer knows about one agent. Owned exclusively by the
/// heuristic layer; lives for the process lifetime.
#[derive(Debug, Default)]
struct AgentProfile {
    action_counts: HashMap<ActionType, u64>,
    action_timings: HashMap<ActionType, Vec<DateTime<Utc>>>,
    interaction_graph: HashMap<String, Vec<DateTime<Utc>>>,
    sequence: VecDeque<ActionType>,
    feature_history: VecDeque<Vec<f64>>,
    baseline_established: bool,
    total_actions: u64,
    anomaly_count: u64,
    adaptive_threshold: Option<f64>,
}

/// Public per-agent profile report.
#[derive(Debug, Clone, Serialize)]
pub struct AgentProfileReport {
    pub agent_id: String,
    pub total_actions: u64,
    pub anomaly_count: u64,
    pub anomaly_rate: f64,
    pub baseline_established: bool,
    pub action_distribution: HashMap<String, u64>,
    pub adaptive_threshold: Option<f64>,
    pub known_interactions: usize,
}

/// Sequence-pattern, deviation, temporal, interaction, and escalation
/// detectors over per-agent behavioral profiles.
pub struct HeuristicAnalyzer {
    config: HeuristicsConfig,
    agents: RwLock<HashMap<String, Arc<Mutex<AgentProfile>>>>,
}

impl HeuristicAnalyzer {
    pub fn new(config: HeuristicsConfig) -> Self {
        Self {
            config,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Evaluate one action and fold it into the agent's profile.
    pub fn evaluate(&self, action: &AgentAction) -> Option<ThreatAssessment> {
        let profile_arc = self.profile_for(&action.agent_id);
        let mut profile = profile_arc.lock().expect("agent profile poisoned");

        self.update_profile(&mut profile, action);

        profile.sequence.push_back(action.action_type);
        while profile.sequence.len() > self.config.pattern_window_size {
            profile.sequence.pop_front();
        }

        let mut threats = Vec::new();
        if let Some(t) = self.detect_attack_patterns(&profile, action) {
            threats.push(t);
        }
        if let Some(t) = self.detect_behavioral_deviation(&mut profile, action) {
            threats.push(t);
        }
        if let Some(t) = self.detect_temporal_burst(&profile, action) {
            threats.push(t);
        }
        if let Some(t) = self.detect_interaction_flood(&mut profile, action) {
            threats.push(t);
        }
        if let Some(t) = self.detect_escalation(&profile, action) {
            threats.push(t);
        }

        let max = threats
            .into_iter()
            .reduce(|best, t| if t.threat_level > best.threat_level { t } else { best })?;

        if max.threat_level >= ThreatLevel::Suspicious {
            profile.anomaly_count += 1;
        }

        if self.config.enable_adaptive_learning {
            self.adapt_threshold(&mut profile);
        }

        warn!(
            agent_id = %action.agent_id,
            threat_level = %max.threat_level,
            "heuristic threat detected"
        );
        Some(max)
    }

    fn profile_for(&self, agent_id: &str) -> Arc<Mutex<AgentProfile>> {
        if let Some(profile) = self.agents.read().expect("agent map poisoned").get(agent_id) {
            return Arc::clone(profile);
        }
        let mut agents = self.agents.write().expect("agent map poisoned");
        Arc::clone(agents.entry(agent_id.to_string()).or_default())
    }

    fn update_profile(&self, profile: &mut AgentProfile, action: &AgentAction) {
        profile.total_actions += 1;
        *profile.action_counts.entry(action.action_type).or_default() += 1;
        profile
            .action_timings
            .entry(action.action_type)
            .or_default()
            .push(action.timestamp);

        if profile.total_actions >= self.config.baseline_actions_required
            && !profile.baseline_established
        {
            profile.baseline_established = true;
            info!(agent_id = %action.agent_id, "behavioral baseline established");
        }
    }

    /// Exact suffix match against the attack-sequence catalogue.
    fn detect_attack_patterns(
        &self,
        profile: &AgentProfile,
        action: &AgentAction,
    ) -> Option<ThreatAssessment> {
        if profile.sequence.len() < 3 {
            return None;
        }

        for pattern in ATTACK_PATTERNS {
            let len = pattern.sequence.len();
            if profile.sequence.len() < len {
                continue;
            }
            let suffix_matches = profile
                .sequence
                .iter()
                .rev()
                .take(len)
                .eq(pattern.sequence.iter().rev());
            if suffix_matches {
                let level = ThreatLevel::from_score(pattern.weight);
                let rendered: Vec<String> =
                    pattern.sequence.iter().map(|t| t.to_string()).collect();
                return Some(ThreatAssessment::new(
                    &action.id,
                    level,
                    pattern.weight,
                    vec![
                        format!("suspicious pattern detected: {}", pattern.name),
                        format!("sequence: {}", rendered.join(" -> ")),
                    ],
                    EnforcementAction::for_level(level),
                    AnalysisLayer::Heuristics,
                ));
            }
        }

        None
    }

    /// Mean absolute z-score of the current feature vector against the
    /// agent's rolling history. Only active once the baseline is in.
    fn detect_behavioral_deviation(
        &self,
        profile: &mut AgentProfile,
        action: &AgentAction,
    ) -> Option<ThreatAssessment> {
        if !profile.baseline_established {
            return None;
        }

        let features = extract_features(action, profile);
        let score = Self::deviation_score(profile, features);

        let threshold = profile
            .adaptive_threshold
            .unwrap_or(self.config.anomaly_threshold);

        if score > threshold {
            let level = ThreatLevel::from_score(score);
            return Some(ThreatAssessment::new(
                &action.id,
                level,
                score,
                vec![
                    format!("behavioral deviation detected: score {score:.2}"),
                    format!("threshold: {threshold:.2}"),
                    "behavior diverges from the established baseline".to_string(),
                ],
                EnforcementAction::for_level(level),
                AnalysisLayer::Heuristics,
            ));
        }

        None
    }

    fn deviation_score(profile: &mut AgentProfile, features: Vec<f64>) -> f64 {
        if profile.feature_history.len() < FEATURE_BURN_IN {
            profile.feature_history.push_back(features);
            return 0.0;
        }

        let dims = features.len();
        let n = profile.feature_history.len() as f64;

        let mut centroid = vec![0.0; dims];
        for sample in &profile.feature_history {
            for (c, v) in centroid.iter_mut().zip(sample) {
                *c += v;
            }
        }
        for c in &mut centroid {
            *c /= n;
        }

        let mut variance = vec![0.0; dims];
        for sample in &profile.feature_history {
            for ((var, v), c) in variance.iter_mut().zip(sample).zip(&centroid) {
                *var += (v - c).powi(2);
            }
        }

        let mut z_total = 0.0;
        for ((v, c), var) in features.iter().zip(&centroid).zip(&variance) {
            let std = (var / n).sqrt() + 1e-6;
            z_total += (v - c).abs() / std;
        }
        let score = ((z_total / dims as f64) / 3.0).min(1.0);

        profile.feature_history.push_back(features);
        while profile.feature_history.len() > FEATURE_HISTORY_CAP {
            profile.feature_history.pop_front();
        }

        score
    }

    /// Burst detection over same-type inter-arrival intervals.
    fn detect_temporal_burst(
        &self,
        profile: &AgentProfile,
        action: &AgentAction,
    ) -> Option<ThreatAssessment> {
        let timings = profile.action_timings.get(&action.action_type)?;
        if timings.len() < 10 {
            return None;
        }

        let window = &timings[timings.len().saturating_sub(20)..];
        let intervals: Vec<f64> = window
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64 / 1000.0)
            .collect();

        let n = intervals.len() as f64;
        let mean = intervals.iter().sum::<f64>() / n;
        let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();

        let current = *intervals.last()?;
        if current < mean - 2.0 * std {
            let recent = &intervals[intervals.len().saturating_sub(10)..];
            let burst_count = recent.iter().filter(|i| **i < mean * 0.5).count();
            if burst_count >= 5 {
                return Some(ThreatAssessment::new(
                    &action.id,
                    ThreatLevel::Suspicious,
                    0.75,
                    vec![
                        format!("activity burst detected: {burst_count} rapid actions"),
                        format!("current interval: {current:.2}s vs mean: {mean:.2}s"),
                    ],
                    EnforcementAction::Throttle,
                    AnalysisLayer::Heuristics,
                ));
            }
        }

        None
    }

    /// Message flooding toward a single peer agent.
    fn detect_interaction_flood(
        &self,
        profile: &mut AgentProfile,
        action: &AgentAction,
    ) -> Option<ThreatAssessment> {
        if action.action_type != ActionType::AgentCommunication {
            return None;
        }
        let target = action.str_param("target_agent")?.to_string();

        let window_start = action.timestamp - Duration::seconds(60);
        let timestamps = profile.interaction_graph.entry(target.clone()).or_default();
        timestamps.push(action.timestamp);
        let recent = timestamps.iter().filter(|t| **t > window_start).count();

        if recent > 10 {
            return Some(ThreatAssessment::new(
                &action.id,
                ThreatLevel::Concerning,
                0.8,
                vec![
                    format!("excessive communication with agent {target}"),
                    format!("{recent} messages within the last minute"),
                    "possible attack coordination".to_string(),
                ],
                EnforcementAction::Sandbox,
                AnalysisLayer::Heuristics,
            ));
        }

        None
    }

    /// Gradual climb toward more sensitive operation kinds.
    fn detect_escalation(
        &self,
        profile: &AgentProfile,
        action: &AgentAction,
    ) -> Option<ThreatAssessment> {
        if profile.sequence.len() < 10 {
            return None;
        }

        let recent: Vec<f64> = profile
            .sequence
            .iter()
            .rev()
            .take(10)
            .rev()
            .map(|t| t.sensitivity() as f64)
            .collect();

        let first_half = recent[..5].iter().sum::<f64>() / 5.0;
        let second_half = recent[5..].iter().sum::<f64>() / 5.0;
        let ratio = second_half / (first_half + 0.1);

        if ratio > 1.5 && second_half >= 3.0 {
            return Some(ThreatAssessment::new(
                &action.id,
                ThreatLevel::Dangerous,
                0.85,
                vec![
                    "gradual privilege escalation detected".to_string(),
                    format!("escalation ratio: {ratio:.2}"),
                    "agent is progressively attempting more sensitive actions".to_string(),
                ],
                EnforcementAction::Quarantine,
                AnalysisLayer::Heuristics,
            ));
        }

        None
    }

    /// Nudge the agent's detection threshold toward its observed anomaly
    /// rate: noisy agents get a less sensitive threshold, quiet agents a
    /// more sensitive one. Clamped to [0.5, 0.95].
    fn adapt_threshold(&self, profile: &mut AgentProfile) {
        let current = profile
            .adaptive_threshold
            .unwrap_or(self.config.anomaly_threshold);
        let anomaly_rate = profile.anomaly_count as f64 / profile.total_actions.max(1) as f64;

        let adjusted = if anomaly_rate > 0.1 {
            current + self.config.learning_rate
        } else if anomaly_rate < 0.01 {
            current - self.config.learning_rate
        } else {
            current
        };

        profile.adaptive_threshold = Some(adjusted.clamp(0.5, 0.95));
    }

    /// Detailed profile report for one agent, if it has been seen.
    pub fn agent_profile(&self, agent_id: &str) -> Option<AgentProfileReport> {
        let profile_arc = {
            let agents = self.agents.read().expect("agent map poisoned");
            Arc::clone(agents.get(agent_id)?)
        };
        let profile = profile_arc.lock().expect("agent profile poisoned");

        Some(AgentProfileReport {
            agent_id: agent_id.to_string(),
            total_actions: profile.total_actions,
            anomaly_count: profile.anomaly_count,
            anomaly_rate: profile.anomaly_count as f64 / profile.total_actions.max(1) as f64,
            baseline_established: profile.baseline_established,
            action_distribution: profile
                .action_counts
                .iter()
                .map(|(t, c)| (t.to_string(), *c))
                .collect(),
            adaptive_threshold: profile.adaptive_threshold,
            known_interactions: profile.interaction_graph.len(),
        })
    }
}

#[async_trait]
impl Analyzer for HeuristicAnalyzer {
    fn layer(&self) -> AnalysisLayer {
        AnalysisLayer::Heuristics
    }

    async fn analyze(
        &self,
        action: &AgentAction,
        _context: Option<&AnalysisContext>,
    ) -> Option<ThreatAssessment> {
        self.evaluate(action)
    }
}

/// Feature vector for deviation scoring: one-hot action type, hour-of-day
/// fraction, relative type frequency, and a hashed-parameter signal.
fn extract_features(action: &AgentAction, profile: &AgentProfile) -> Vec<f64> {
    let mut features = Vec::with_capacity(ActionType::ALL.len() + 3);

    for t in ActionType::ALL {
        features.push(if action.action_type == t { 1.0 } else { 0.0 });
    }

    let seconds_of_day = action.timestamp.time().num_seconds_from_midnight() as f64;
    features.push(seconds_of_day / 86_400.0);

    let total = profile.total_actions.max(1) as f64;
    let count = profile
        .action_counts
        .get(&action.action_type)
        .copied()
        .unwrap_or_default() as f64;
    features.push(count / total);

    let serialized = serde_json::to_string(&action.parameters).unwrap_or_default();
    let mut hasher = DefaultHasher::new();
    serialized.hash(&mut hasher);
    features.push((hasher.finish() % 100) as f64 / 100.0);

    features
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(agent: &str, action_type: ActionType) -> AgentAction {
        AgentAction::new(agent, action_type, "x")
    }

    fn analyzer() -> HeuristicAnalyzer {
        HeuristicAnalyzer::new(HeuristicsConfig {
            enable_adaptive_learning: false,
            ..HeuristicsConfig::default()
        })
    }

    #[test]
    fn test_privilege_escalation_pattern() {
        let h = analyzer();
        h.evaluate(&mk("ag1", ActionType::FileOperation));
        h.evaluate(&mk("ag1", ActionType::CodeExecution));
        let result = h.evaluate(&mk("ag1", ActionType::SelfModification)).unwrap();
        assert!(result.threat_level >= ThreatLevel::Dangerous);
        assert!(result.reasons[0].contains("privilege_escalation"));
    }

    #[test]
    fn test_data_exfiltration_pattern() {
        let h = analyzer();
        h.evaluate(&mk("ag1", ActionType::FileOperation));
        h.evaluate(&mk("ag1", ActionType::FileOperation));
        let result = h.evaluate(&mk("ag1", ActionType::NetworkRequest)).unwrap();
        assert_eq!(result.threat_level, ThreatLevel::Dangerous);
        assert!(result.reasons[0].contains("data_exfiltration"));
    }

    #[test]
    fn test_sequences_are_per_agent() {
        let h = analyzer();
        h.evaluate(&mk("ag1", ActionType::FileOperation));
        h.evaluate(&mk("ag2", ActionType::CodeExecution));
        // ag1's sequence is [file_operation, self_modification] — no pattern.
        assert!(h.evaluate(&mk("ag1", ActionType::SelfModification)).is_none());
    }

    #[test]
    fn test_escalation_ramp() {
        let h = analyzer();
        let ramp = [
            ActionType::ApiCall,
            ActionType::ApiCall,
            ActionType::FileOperation,
            ActionType::FileOperation,
            ActionType::NetworkRequest,
            ActionType::CodeExecution,
            ActionType::CodeExecution,
            ActionType::CodeExecution,
            ActionType::SelfModification,
            ActionType::SelfModification,
        ];

        let mut result = None;
        for action_type in ramp {
            result = h.evaluate(&mk("ag2", action_type));
        }
        let result = result.unwrap();
        assert!(result.threat_level >= ThreatLevel::Dangerous);
    }

    #[test]
    fn test_temporal_burst() {
        let h = analyzer();
        let base = Utc::now();
        let mut ts = base;

        // Fourteen calls at a calm 10s cadence.
        for _ in 0..14 {
            h.evaluate(&mk("ag3", ActionType::ApiCall).with_timestamp(ts));
            ts += Duration::seconds(10);
        }
        // Five at 3s — below half the rolling mean.
        for _ in 0..5 {
            h.evaluate(&mk("ag3", ActionType::ApiCall).with_timestamp(ts));
            ts += Duration::seconds(3);
        }
        // One nearly instantaneous call tips the detector.
        ts = ts - Duration::seconds(3) + Duration::milliseconds(10);
        let result = h
            .evaluate(&mk("ag3", ActionType::ApiCall).with_timestamp(ts))
            .unwrap();
        assert_eq!(result.threat_level, ThreatLevel::Suspicious);
        assert_eq!(result.recommended_action, EnforcementAction::Throttle);
        assert!(result.reasons[0].contains("burst"));
    }

    #[test]
    fn test_interaction_flood() {
        let h = analyzer();
        let base = Utc::now();

        let mut result = None;
        for i in 0..11 {
            let action = mk("ag4", ActionType::AgentCommunication)
                .with_parameter("target_agent", "peer-7")
                .with_timestamp(base + Duration::seconds(i));
            result = h.evaluate(&action);
        }
        let result = result.unwrap();
        assert_eq!(result.threat_level, ThreatLevel::Concerning);
        assert_eq!(result.recommended_action, EnforcementAction::Sandbox);
    }

    #[test]
    fn test_communication_without_target_ignored() {
        let h = analyzer();
        for _ in 0..15 {
            assert!(h.evaluate(&mk("ag5", ActionType::AgentCommunication)).is_none());
        }
    }

    #[test]
    fn test_behavioral_deviation_after_baseline() {
        let h = HeuristicAnalyzer::new(HeuristicsConfig {
            baseline_actions_required: 10,
            enable_adaptive_learning: false,
            ..HeuristicsConfig::default()
        });
        let base = Utc::now();

        // Nineteen identical calls: baseline lands at 10, the feature
        // history burns in over the next ten.
        for i in 0..19 {
            let action = mk("ag6", ActionType::ApiCall)
                .with_parameter("endpoint", "/v1/data")
                .with_timestamp(base + Duration::seconds(i));
            assert!(h.evaluate(&action).is_none());
        }

        // A completely different action shape is a strong outlier.
        let odd = mk("ag6", ActionType::SelfModification)
            .with_parameter("modification_type", "weights")
            .with_timestamp(base + Duration::seconds(19));
        let result = h.evaluate(&odd).unwrap();
        assert!(result.threat_level >= ThreatLevel::Concerning);
        assert!(result.reasons[0].contains("deviation"));
    }

    #[test]
    fn test_adaptive_threshold_rises_for_noisy_agent() {
        let h = HeuristicAnalyzer::new(HeuristicsConfig {
            learning_rate: 0.05,
            enable_adaptive_learning: true,
            ..HeuristicsConfig::default()
        });
        h.evaluate(&mk("ag7", ActionType::FileOperation));
        h.evaluate(&mk("ag7", ActionType::CodeExecution));
        h.evaluate(&mk("ag7", ActionType::SelfModification));

        let report = h.agent_profile("ag7").unwrap();
        assert_eq!(report.anomaly_count, 1);
        // One anomaly in three actions is a >10% rate, so the threshold
        // moved up from the 0.7 default.
        let threshold = report.adaptive_threshold.unwrap();
        assert!((threshold - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_profile_report() {
        let h = analyzer();
        h.evaluate(&mk("ag8", ActionType::ApiCall));
        h.evaluate(&mk("ag8", ActionType::ApiCall));
        h.evaluate(&mk("ag8", ActionType::FileOperation));

        let report = h.agent_profile("ag8").unwrap();
        assert_eq!(report.total_actions, 3);
        assert_eq!(report.action_distribution.get("api_call"), Some(&2));
        assert!(!report.baseline_established);
        assert!(h.agent_profile("nobody").is_none());
    }
}
