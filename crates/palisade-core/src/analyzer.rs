//! The analyzer capability — the plug-in point every defense layer
//! implements.
//!
//! The core holds ordered collections of analyzers per layer slot. Within a
//! slot each analyzer runs independently; the most severe non-null result
//! wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ActionType, AgentAction, AnalysisLayer, ThreatAssessment, ThreatLevel};

/// Compact view of a previously submitted action, carried in the analysis
/// context instead of the full record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSummary {
    pub action_type: ActionType,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&AgentAction> for ActionSummary {
    fn from(action: &AgentAction) -> Self {
        Self {
            action_type: action.action_type,
            description: action.description.clone(),
            timestamp: action.timestamp,
        }
    }
}

/// Compact view of a previously recorded threat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatSummary {
    pub threat_level: ThreatLevel,
    pub reasons: Vec<String>,
}

impl From<&ThreatAssessment> for ThreatSummary {
    fn from(assessment: &ThreatAssessment) -> Self {
        Self {
            threat_level: assessment.threat_level,
            reasons: assessment.reasons.clone(),
        }
    }
}

/// What the core knows about the submitting agent when a layer runs:
/// its most recent actions and the threats already recorded against it.
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    pub recent_actions: Vec<ActionSummary>,
    pub previous_threats: Vec<ThreatSummary>,
}

/// A single defense layer's analysis capability.
///
/// Returning `None` means "nothing to report" — it is not an error. Layers
/// must never panic on malformed input; anything unanalyzable is simply not
/// a finding.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Which layer this analyzer reports as.
    fn layer(&self) -> AnalysisLayer;

    /// Evaluate one action, with whatever context the core could supply.
    async fn analyze(
        &self,
        action: &AgentAction,
        context: Option<&AnalysisContext>,
    ) -> Option<ThreatAssessment>;
}
