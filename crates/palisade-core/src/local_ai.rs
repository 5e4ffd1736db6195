//! Local guardian — a lightweight offline outlier model.
//!
//! Keeps a rolling memory of feature vectors per agent and scores new
//! actions by z-distance to the centroid, blended with a keyword-risk
//! signal over the action's text. Enriches escalated analysis without
//! depending on the completion backend.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::Timelike;
use tracing::warn;

use crate::analyzer::{AnalysisContext, Analyzer};
use crate::config::LocalAiConfig;
use crate::domain::{
    ActionType, AgentAction, AnalysisLayer, EnforcementAction, ThreatAssessment, ThreatLevel,
};

const HIGH_RISK_TERMS: &[&str] = &[
    "sudo", "passwd", "shadow", "exfil", "disable", "kill", "bypass", "token",
];

const MEDIUM_RISK_TERMS: &[&str] = &[
    "exec", "shell", "upload", "chmod", "chown", "privilege", "systemctl",
];

/// Statistical outlier scorer with per-agent online memory.
pub struct LocalAiGuardian {
    config: LocalAiConfig,
    memory: RwLock<HashMap<String, Arc<Mutex<VecDeque<Vec<f64>>>>>>,
}

impl LocalAiGuardian {
    pub fn new(config: LocalAiConfig) -> Self {
        Self {
            config,
            memory: RwLock::new(HashMap::new()),
        }
    }

    pub fn evaluate(&self, action: &AgentAction) -> Option<ThreatAssessment> {
        let vector = vectorize(action);
        let history_arc = self.history_for(&action.agent_id);
        let mut history = history_arc.lock().expect("guardian memory poisoned");

        if history.len() < self.config.min_samples {
            Self::remember(&mut history, vector, self.config.memory_size);
            return None;
        }

        let dims = vector.len();
        let n = history.len() as f64;

        let mut centroid = vec![0.0; dims];
        for sample in history.iter() {
            for (c, v) in centroid.iter_mut().zip(sample) {
                *c += v;
            }
        }
        for c in &mut centroid {
            *c /= n;
        }

        let mut variance = vec![0.0; dims];
        for sample in history.iter() {
            for ((var, v), c) in variance.iter_mut().zip(sample).zip(&centroid) {
                *var += (v - c).powi(2);
            }
        }

        let mut z_total = 0.0;
        for ((v, c), var) in vector.iter().zip(&centroid).zip(&variance) {
            let std = (var / n).sqrt() + 1e-6;
            z_total += (v - c).abs() / std;
        }
        let z_dist = z_total / dims as f64;

        let keyword_risk = keyword_risk(action);
        let score = ((z_dist / self.config.sensitivity) * 0.7 + keyword_risk * 0.3).min(1.0);

        Self::remember(&mut history, vector, self.config.memory_size);

        if score < self.config.alert_threshold {
            return None;
        }

        let threat = score_to_level(score);
        warn!(
            agent_id = %action.agent_id,
            threat_level = %threat,
            score = format!("{score:.2}"),
            "local guardian detected outlier action"
        );
        Some(ThreatAssessment::new(
            &action.id,
            threat,
            score,
            vec![
                format!("local model detected a behavioral outlier (score={score:.2})"),
                "action falls outside the agent's historical pattern".to_string(),
            ],
            recommend(threat),
            AnalysisLayer::LocalAi,
        ))
    }

    fn history_for(&self, agent_id: &str) -> Arc<Mutex<VecDeque<Vec<f64>>>> {
        if let Some(history) = self.memory.read().expect("guardian map poisoned").get(agent_id) {
            return Arc::clone(history);
        }
        let mut memory = self.memory.write().expect("guardian map poisoned");
        Arc::clone(memory.entry(agent_id.to_string()).or_default())
    }

    fn remember(history: &mut VecDeque<Vec<f64>>, vector: Vec<f64>, cap: usize) {
        history.push_back(vector);
        while history.len() > cap {
            history.pop_front();
        }
    }
}

#[async_trait]
impl Analyzer for LocalAiGuardian {
    fn layer(&self) -> AnalysisLayer {
        AnalysisLayer::LocalAi
    }

    async fn analyze(
        &self,
        action: &AgentAction,
        _context: Option<&AnalysisContext>,
    ) -> Option<ThreatAssessment> {
        self.evaluate(action)
    }
}

/// One-hot type, hour fraction, and normalized text sizes for parameters,
/// description, and reasoning.
fn vectorize(action: &AgentAction) -> Vec<f64> {
    let mut vector = Vec::with_capacity(ActionType::ALL.len() + 4);
    for t in ActionType::ALL {
        vector.push(if action.action_type == t { 1.0 } else { 0.0 });
    }

    let seconds_of_day = action.timestamp.time().num_seconds_from_midnight() as f64;
    vector.push(seconds_of_day / 86_400.0);

    let params_len = serde_json::to_string(&action.parameters)
        .unwrap_or_default()
        .len() as f64;
    vector.push((params_len / 500.0).min(1.0));
    vector.push((action.description.len() as f64 / 200.0).min(1.0));
    let reasoning_len = action.reasoning.as_deref().unwrap_or_default().len() as f64;
    vector.push((reasoning_len / 250.0).min(1.0));

    vector
}

/// Weighted count of risk terms across the action's visible text.
fn keyword_risk(action: &AgentAction) -> f64 {
    let params = serde_json::to_string(&action.parameters).unwrap_or_default();
    let text = format!(
        "{} {} {}",
        action.description,
        action.reasoning.as_deref().unwrap_or_default(),
        params
    )
    .to_lowercase();

    let high_hits = HIGH_RISK_TERMS.iter().filter(|t| text.contains(**t)).count();
    let medium_hits = MEDIUM_RISK_TERMS.iter().filter(|t| text.contains(**t)).count();
    (high_hits as f64 * 0.25 + medium_hits as f64 * 0.12).min(1.0)
}

fn score_to_level(score: f64) -> ThreatLevel {
    if score >= 0.9 {
        ThreatLevel::Critical
    } else if score >= 0.78 {
        ThreatLevel::Dangerous
    } else if score >= 0.66 {
        ThreatLevel::Concerning
    } else {
        ThreatLevel::Suspicious
    }
}

fn recommend(threat: ThreatLevel) -> EnforcementAction {
    match threat {
        ThreatLevel::Critical => EnforcementAction::Kill,
        ThreatLevel::Dangerous => EnforcementAction::Quarantine,
        ThreatLevel::Concerning => EnforcementAction::Sandbox,
        _ => EnforcementAction::RequireApproval,
    }
}
