//! Threat assessments — the verdict each defense layer produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a detected threat.
///
/// The ordering is semantic and total: `Safe < Suspicious < Concerning <
/// Dangerous < Critical`. Aggregation, escalation gating, and enforcement
/// thresholds all compare levels, so the variant order here is a contract,
/// not an accident of declaration — see the pinning test below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatLevel {
    Safe,
    Suspicious,
    Concerning,
    Dangerous,
    Critical,
}

impl ThreatLevel {
    /// Numeric severity, 0 (safe) through 4 (critical).
    pub fn severity(self) -> u8 {
        match self {
            ThreatLevel::Safe => 0,
            ThreatLevel::Suspicious => 1,
            ThreatLevel::Concerning => 2,
            ThreatLevel::Dangerous => 3,
            ThreatLevel::Critical => 4,
        }
    }

    /// Map an anomaly score in [0, 1] onto a level using fixed bands.
    ///
    /// Shared by the heuristic pattern matcher and deviation detector.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.9 {
            ThreatLevel::Critical
        } else if score >= 0.75 {
            ThreatLevel::Dangerous
        } else if score >= 0.6 {
            ThreatLevel::Concerning
        } else if score >= 0.4 {
            ThreatLevel::Suspicious
        } else {
            ThreatLevel::Safe
        }
    }

    /// Lenient parse for levels reported by the completion backend.
    ///
    /// Unrecognized strings map to `Safe` so a creative backend cannot
    /// escalate (or crash) the pipeline on its own.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUSPICIOUS" => ThreatLevel::Suspicious,
            "CONCERNING" => ThreatLevel::Concerning,
            "DANGEROUS" => ThreatLevel::Dangerous,
            "CRITICAL" => ThreatLevel::Critical,
            _ => ThreatLevel::Safe,
        }
    }
}

impl std::fmt::Display for ThreatLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ThreatLevel::Safe => "SAFE",
            ThreatLevel::Suspicious => "SUSPICIOUS",
            ThreatLevel::Concerning => "CONCERNING",
            ThreatLevel::Dangerous => "DANGEROUS",
            ThreatLevel::Critical => "CRITICAL",
        };
        write!(f, "{name}")
    }
}

/// Containment response recommended for an assessed threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementAction {
    Allow,
    Log,
    Delay,
    RequireApproval,
    Sandbox,
    Throttle,
    Block,
    Quarantine,
    Kill,
}

impl EnforcementAction {
    /// The standard level→response mapping used by the heuristic, local-ai,
    /// and oracle layers when confidence is not in question.
    pub fn for_level(level: ThreatLevel) -> Self {
        match level {
            ThreatLevel::Critical => EnforcementAction::Kill,
            ThreatLevel::Dangerous => EnforcementAction::Quarantine,
            ThreatLevel::Concerning => EnforcementAction::Sandbox,
            ThreatLevel::Suspicious => EnforcementAction::RequireApproval,
            ThreatLevel::Safe => EnforcementAction::Log,
        }
    }

    /// Whether this response denies the action outright.
    pub fn denies(self) -> bool {
        matches!(
            self,
            EnforcementAction::Block | EnforcementAction::Quarantine | EnforcementAction::Kill
        )
    }
}

impl std::fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EnforcementAction::Allow => "allow",
            EnforcementAction::Log => "log",
            EnforcementAction::Delay => "delay",
            EnforcementAction::RequireApproval => "require_approval",
            EnforcementAction::Sandbox => "sandbox",
            EnforcementAction::Throttle => "throttle",
            EnforcementAction::Block => "block",
            EnforcementAction::Quarantine => "quarantine",
            EnforcementAction::Kill => "kill",
        };
        write!(f, "{name}")
    }
}

/// Which layer produced an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisLayer {
    Perimeter,
    Heuristics,
    LocalAi,
    Oracle,
    Aggregate,
}

impl std::fmt::Display for AnalysisLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AnalysisLayer::Perimeter => "perimeter",
            AnalysisLayer::Heuristics => "heuristics",
            AnalysisLayer::LocalAi => "local_ai",
            AnalysisLayer::Oracle => "oracle",
            AnalysisLayer::Aggregate => "aggregate",
        };
        write!(f, "{name}")
    }
}

/// The verdict a layer (or the aggregator) reached for one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatAssessment {
    pub action_id: String,
    pub threat_level: ThreatLevel,
    /// Confidence in the verdict, always within [0, 1].
    pub confidence: f64,
    /// Human-readable findings, in detection order.
    pub reasons: Vec<String>,
    pub recommended_action: EnforcementAction,
    pub analysis_layer: AnalysisLayer,
    pub timestamp: DateTime<Utc>,
}

impl ThreatAssessment {
    /// Build an assessment, clamping confidence into [0, 1].
    pub fn new(
        action_id: impl Into<String>,
        threat_level: ThreatLevel,
        confidence: f64,
        reasons: Vec<String>,
        recommended_action: EnforcementAction,
        analysis_layer: AnalysisLayer,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            threat_level,
            confidence: confidence.clamp(0.0, 1.0),
            reasons,
            recommended_action,
            analysis_layer,
            timestamp: Utc::now(),
        }
    }
}
