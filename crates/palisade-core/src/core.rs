//! Core orchestrator — runs the layered pipeline, applies the escalation
//! policy, aggregates verdicts, and owns the agent lifecycle state machine.
//!
//! Lifecycle per agent: `Active` → `Quarantined` (auto-released by a
//! deferred, cancellable task) or `Active` → `Killed` (terminal; the agent
//! joins a permanent block set and any pending release is aborted).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::analyzer::{AnalysisContext, Analyzer};
use crate::config::PalisadeConfig;
use crate::domain::{
    AgentAction, AnalysisLayer, EnforcementAction, ThreatAssessment, ThreatLevel,
};
use crate::heuristics::HeuristicAnalyzer;
use crate::local_ai::LocalAiGuardian;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::oracle::OracleAnalyzer;
use crate::perimeter::PerimeterDefense;

/// Pipeline slot an analyzer is registered into. Slots run in this order;
/// the escalation slot only runs when the escalation policy says so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerSlot {
    Perimeter,
    Heuristics,
    Escalation,
}

/// Lifecycle state of a monitored agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Quarantined,
    Killed,
}

/// Outcome of submitting an action for analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// Action accepted into the pipeline; carries the action id.
    Accepted(String),
    /// The agent is blocked; the action never entered the pipeline.
    Blocked,
}

/// Registration record for one monitored agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub registered_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
    pub action_count: u64,
    pub threat_count: u64,
    pub status: AgentStatus,
}

/// Detailed per-agent report.
#[derive(Debug, Clone, Serialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub record: AgentRecord,
    pub total_actions: usize,
    pub threats_detected: usize,
    pub threat_levels: HashMap<String, u64>,
    pub recent_actions: Vec<AgentAction>,
    pub recent_threats: Vec<ThreatAssessment>,
}

/// Enforcement side-effect observer, executed for every assessment that
/// reaches [`Palisade::enforce`], regardless of outcome. A failing hook is
/// logged and skipped; it never aborts enforcement.
pub trait EnforcementHook: Send + Sync {
    fn on_assessment(&self, assessment: &ThreatAssessment) -> anyhow::Result<()>;
}

struct CoreState {
    config: PalisadeConfig,
    perimeter: RwLock<Vec<Arc<dyn Analyzer>>>,
    heuristics: RwLock<Vec<Arc<dyn Analyzer>>>,
    escalation: RwLock<Vec<Arc<dyn Analyzer>>>,
    hooks: RwLock<Vec<Arc<dyn EnforcementHook>>>,
    agents: Mutex<HashMap<String, AgentRecord>>,
    blocked_agents: Mutex<HashSet<String>>,
    /// Pending quarantine release tasks, keyed by agent id.
    release_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    action_history: Mutex<Vec<AgentAction>>,
    threat_history: Mutex<Vec<ThreatAssessment>>,
    metrics: Metrics,
}

/// The central coordination engine.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Palisade {
    state: Arc<CoreState>,
}

impl Palisade {
    /// Build an empty engine — no analyzers registered yet.
    pub fn new(config: PalisadeConfig) -> Self {
        info!("palisade core initialised");
        Self {
            state: Arc::new(CoreState {
                config,
                perimeter: RwLock::new(Vec::new()),
                heuristics: RwLock::new(Vec::new()),
                escalation: RwLock::new(Vec::new()),
                hooks: RwLock::new(Vec::new()),
                agents: Mutex::new(HashMap::new()),
                blocked_agents: Mutex::new(HashSet::new()),
                release_tasks: Mutex::new(HashMap::new()),
                action_history: Mutex::new(Vec::new()),
                threat_history: Mutex::new(Vec::new()),
                metrics: Metrics::new(),
            }),
        }
    }

    /// Build with the standard four layers wired in: perimeter rules,
    /// behavioral heuristics, and the oracle plus the local guardian on the
    /// escalation slot.
    pub fn with_default_layers(config: PalisadeConfig) -> Self {
        let core = Self::new(config.clone());
        core.register_analyzer(
            LayerSlot::Perimeter,
            Arc::new(PerimeterDefense::new(config.perimeter)),
        );
        core.register_analyzer(
            LayerSlot::Heuristics,
            Arc::new(HeuristicAnalyzer::new(config.heuristics)),
        );
        core.register_analyzer(
            LayerSlot::Escalation,
            Arc::new(OracleAnalyzer::new(config.oracle)),
        );
        core.register_analyzer(
            LayerSlot::Escalation,
            Arc::new(LocalAiGuardian::new(config.local_ai)),
        );
        core
    }

    /// Register an analyzer into a pipeline slot. Order of registration is
    /// the tie-break order within the slot.
    pub fn register_analyzer(&self, slot: LayerSlot, analyzer: Arc<dyn Analyzer>) {
        let collection = match slot {
            LayerSlot::Perimeter => &self.state.perimeter,
            LayerSlot::Heuristics => &self.state.heuristics,
            LayerSlot::Escalation => &self.state.escalation,
        };
        collection.write().expect("layer registry poisoned").push(analyzer);
        info!(slot = ?slot, "analyzer registered");
    }

    /// Register an enforcement side-effect hook.
    pub fn register_enforcement_hook(&self, hook: Arc<dyn EnforcementHook>) {
        self.state.hooks.write().expect("hook registry poisoned").push(hook);
        info!("enforcement hook registered");
    }

    /// Idempotent upsert into the monitored-agent table. Re-registering
    /// refreshes metadata but preserves counters and status.
    pub fn register_agent(&self, agent_id: &str, metadata: BTreeMap<String, Value>) {
        let mut agents = self.state.agents.lock().expect("agent table poisoned");
        if let Some(record) = agents.get_mut(agent_id) {
            record.metadata = metadata;
        } else {
            agents.insert(
                agent_id.to_string(),
                AgentRecord {
                    registered_at: Utc::now(),
                    metadata,
                    action_count: 0,
                    threat_count: 0,
                    status: AgentStatus::Active,
                },
            );
        }
        info!(agent_id, "agent registered for monitoring");
    }

    /// Submit an action. Actions from blocked agents are rejected before
    /// entering the pipeline.
    pub fn submit_action(&self, action: &AgentAction) -> Submission {
        if self
            .state
            .blocked_agents
            .lock()
            .expect("block set poisoned")
            .contains(&action.agent_id)
        {
            warn!(agent_id = %action.agent_id, "action rejected: agent is blocked");
            return Submission::Blocked;
        }

        self.state
            .action_history
            .lock()
            .expect("action history poisoned")
            .push(action.clone());
        self.state.metrics.inc_total_actions();

        if let Some(record) = self
            .state
            .agents
            .lock()
            .expect("agent table poisoned")
            .get_mut(&action.agent_id)
        {
            record.action_count += 1;
        }

        Submission::Accepted(action.id.clone())
    }

    /// Run one action through the defense layers. Never fails: when no
    /// layer fires, the result is a synthesized SAFE/ALLOW assessment.
    pub async fn process_action(&self, action: &AgentAction) -> ThreatAssessment {
        info!(action_id = %action.id, agent_id = %action.agent_id, "processing action");

        let perimeter = self.run_slot(LayerSlot::Perimeter, action, None).await;

        // A dangerous perimeter verdict ends the pipeline immediately; the
        // costlier layers are never consulted.
        if let Some(assessment) = &perimeter {
            if assessment.threat_level >= ThreatLevel::Dangerous {
                let assessment = assessment.clone();
                self.record_assessment(action, &assessment);
                return assessment;
            }
        }

        let heuristics = self.run_slot(LayerSlot::Heuristics, action, None).await;

        let escalation = if self.should_escalate(action, &perimeter, &heuristics) {
            let context = self.build_context(&action.agent_id);
            self.run_slot(LayerSlot::Escalation, action, Some(&context)).await
        } else {
            None
        };

        let final_assessment = self.aggregate(action, [perimeter, heuristics, escalation]);
        self.record_assessment(action, &final_assessment);
        final_assessment
    }

    /// Escalation policy: analyze-everything mode, critical action types,
    /// or a sufficiently severe verdict from the cheaper layers.
    fn should_escalate(
        &self,
        action: &AgentAction,
        perimeter: &Option<ThreatAssessment>,
        heuristics: &Option<ThreatAssessment>,
    ) -> bool {
        let oracle_config = &self.state.config.oracle;

        if oracle_config.always_analyze {
            return true;
        }

        if oracle_config.critical_action_types.contains(&action.action_type) {
            return true;
        }

        [perimeter, heuristics]
            .iter()
            .filter_map(|a| a.as_ref())
            .map(|a| a.threat_level)
            .max()
            .is_some_and(|max| max >= oracle_config.min_escalation_level)
    }

    /// Run every analyzer in a slot, isolating failures, and return the
    /// most severe non-null result (ties go to the earliest registration).
    async fn run_slot(
        &self,
        slot: LayerSlot,
        action: &AgentAction,
        context: Option<&AnalysisContext>,
    ) -> Option<ThreatAssessment> {
        let analyzers: Vec<Arc<dyn Analyzer>> = {
            let collection = match slot {
                LayerSlot::Perimeter => &self.state.perimeter,
                LayerSlot::Heuristics => &self.state.heuristics,
                LayerSlot::Escalation => &self.state.escalation,
            };
            collection.read().expect("layer registry poisoned").clone()
        };

        let mut tasks = Vec::with_capacity(analyzers.len());
        for analyzer in analyzers {
            let action = action.clone();
            let context = context.cloned();
            tasks.push(tokio::spawn(async move {
                analyzer.analyze(&action, context.as_ref()).await
            }));
        }

        let mut best: Option<ThreatAssessment> = None;
        for task in tasks {
            match task.await {
                Ok(Some(assessment)) => {
                    if best
                        .as_ref()
                        .map_or(true, |b| assessment.threat_level > b.threat_level)
                    {
                        best = Some(assessment);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(slot = ?slot, error = %err, "analyzer failed; excluded from layer");
                }
            }
        }
        best
    }

    /// Merge the per-layer verdicts into the final assessment.
    ///
    /// The most severe verdict wins; ties resolve to the earlier layer
    /// (perimeter > heuristics > escalation) via a strictly-greater scan in
    /// layer order. Reasons concatenate in layer order, confidence averages
    /// across contributing layers.
    fn aggregate(
        &self,
        action: &AgentAction,
        layer_results: [Option<ThreatAssessment>; 3],
    ) -> ThreatAssessment {
        let contributing: Vec<ThreatAssessment> =
            layer_results.into_iter().flatten().collect();

        if contributing.is_empty() {
            return ThreatAssessment::new(
                &action.id,
                ThreatLevel::Safe,
                1.0,
                vec!["no threat detected in any layer".to_string()],
                EnforcementAction::Allow,
                AnalysisLayer::Aggregate,
            );
        }

        let most_severe = contributing
            .iter()
            .reduce(|best, a| if a.threat_level > best.threat_level { a } else { best })
            .expect("contributing layers are non-empty");

        let reasons: Vec<String> = contributing
            .iter()
            .flat_map(|a| a.reasons.iter().cloned())
            .collect();
        let confidence =
            contributing.iter().map(|a| a.confidence).sum::<f64>() / contributing.len() as f64;

        ThreatAssessment::new(
            &action.id,
            most_severe.threat_level,
            confidence,
            reasons,
            most_severe.recommended_action,
            AnalysisLayer::Aggregate,
        )
    }

    fn record_assessment(&self, action: &AgentAction, assessment: &ThreatAssessment) {
        self.state
            .threat_history
            .lock()
            .expect("threat history poisoned")
            .push(assessment.clone());

        if assessment.threat_level >= ThreatLevel::Concerning {
            self.state.metrics.inc_threats_detected();
            if let Some(record) = self
                .state
                .agents
                .lock()
                .expect("agent table poisoned")
                .get_mut(&action.agent_id)
            {
                record.threat_count += 1;
            }
        }
    }

    /// Context handed to the escalation layer: the agent's recent actions
    /// and recent recorded threats.
    fn build_context(&self, agent_id: &str) -> AnalysisContext {
        let actions = self.state.action_history.lock().expect("action history poisoned");
        let agent_actions: Vec<&AgentAction> =
            actions.iter().filter(|a| a.agent_id == agent_id).collect();

        let action_ids: HashSet<&str> =
            agent_actions.iter().map(|a| a.id.as_str()).collect();

        let recent_actions = agent_actions
            .iter()
            .rev()
            .take(5)
            .rev()
            .map(|a| (*a).into())
            .collect();

        let threats = self.state.threat_history.lock().expect("threat history poisoned");
        let matching_threats: Vec<&ThreatAssessment> = threats
            .iter()
            .filter(|t| action_ids.contains(t.action_id.as_str()))
            .collect();
        let previous_threats = matching_threats
            .iter()
            .rev()
            .take(3)
            .rev()
            .map(|t| (*t).into())
            .collect();

        AnalysisContext {
            recent_actions,
            previous_threats,
        }
    }

    /// Apply the recommended enforcement. Returns whether the action is
    /// allowed to proceed.
    pub async fn enforce(&self, assessment: &ThreatAssessment) -> bool {
        info!(
            action_id = %assessment.action_id,
            enforcement = %assessment.recommended_action,
            threat_level = %assessment.threat_level,
            "applying enforcement"
        );

        let hooks: Vec<Arc<dyn EnforcementHook>> = self
            .state
            .hooks
            .read()
            .expect("hook registry poisoned")
            .clone();
        for hook in hooks {
            if let Err(err) = hook.on_assessment(assessment) {
                error!(error = %err, "enforcement hook failed; skipped");
            }
        }

        self.log_policy_disagreement(assessment);

        match assessment.recommended_action {
            EnforcementAction::Block => {
                self.state.metrics.inc_blocked_actions();
                false
            }
            EnforcementAction::Kill => {
                if let Some(agent_id) = self.agent_for_action(&assessment.action_id) {
                    self.kill_agent(&agent_id);
                }
                false
            }
            EnforcementAction::Quarantine => {
                if let Some(agent_id) = self.agent_for_action(&assessment.action_id) {
                    self.quarantine_agent(&agent_id);
                }
                false
            }
            _ => true,
        }
    }

    /// The `auto_*_threshold` keys express what containment policy expects
    /// at a given severity. A weaker recommendation (e.g. the oracle's
    /// low-confidence downgrade) is surfaced, not overridden.
    fn log_policy_disagreement(&self, assessment: &ThreatAssessment) {
        let enforcement = &self.state.config.enforcement;
        if assessment.threat_level >= enforcement.auto_kill_threshold
            && assessment.recommended_action != EnforcementAction::Kill
        {
            warn!(
                action_id = %assessment.action_id,
                recommended = %assessment.recommended_action,
                "policy expects kill at this severity; keeping weaker recommendation"
            );
        } else if assessment.threat_level >= enforcement.auto_block_threshold
            && !assessment.recommended_action.denies()
        {
            warn!(
                action_id = %assessment.action_id,
                recommended = %assessment.recommended_action,
                "policy expects denial at this severity; keeping weaker recommendation"
            );
        }
    }

    /// Locate the submitting agent for an assessment via the action history
    /// (newest first).
    fn agent_for_action(&self, action_id: &str) -> Option<String> {
        self.state
            .action_history
            .lock()
            .expect("action history poisoned")
            .iter()
            .rev()
            .find(|a| a.id == action_id)
            .map(|a| a.agent_id.clone())
    }

    /// Kill switch — permanent containment, no release.
    fn kill_agent(&self, agent_id: &str) {
        error!(agent_id, "kill switch engaged");

        // A pending release must never fire after a kill.
        if let Some(task) = self
            .state
            .release_tasks
            .lock()
            .expect("release task map poisoned")
            .remove(agent_id)
        {
            task.abort();
        }

        self.state
            .blocked_agents
            .lock()
            .expect("block set poisoned")
            .insert(agent_id.to_string());
        if let Some(record) = self
            .state
            .agents
            .lock()
            .expect("agent table poisoned")
            .get_mut(agent_id)
        {
            record.status = AgentStatus::Killed;
        }
        self.state.metrics.inc_agent_kills();
    }

    /// Temporary containment with a deferred, cancellable release.
    fn quarantine_agent(&self, agent_id: &str) {
        warn!(agent_id, "agent quarantined");

        self.state
            .blocked_agents
            .lock()
            .expect("block set poisoned")
            .insert(agent_id.to_string());
        if let Some(record) = self
            .state
            .agents
            .lock()
            .expect("agent table poisoned")
            .get_mut(agent_id)
        {
            record.status = AgentStatus::Quarantined;
        }

        let duration = self.state.config.enforcement.quarantine_duration_seconds;
        let state = Arc::clone(&self.state);
        let agent = agent_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(duration)).await;
            release_quarantine(&state, &agent);
        });

        // Re-quarantining replaces any pending release.
        if let Some(previous) = self
            .state
            .release_tasks
            .lock()
            .expect("release task map poisoned")
            .insert(agent_id.to_string(), task)
        {
            previous.abort();
        }
    }

    /// Current lifecycle state of an agent.
    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.state
            .agents
            .lock()
            .expect("agent table poisoned")
            .get(agent_id)
            .map(|record| record.status)
    }

    /// System-wide counter snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        let monitored = self.state.agents.lock().expect("agent table poisoned").len();
        let blocked = self
            .state
            .blocked_agents
            .lock()
            .expect("block set poisoned")
            .len();
        self.state.metrics.snapshot(monitored, blocked)
    }

    /// Detailed report for one monitored agent.
    pub fn agent_report(&self, agent_id: &str) -> Option<AgentReport> {
        let record = self
            .state
            .agents
            .lock()
            .expect("agent table poisoned")
            .get(agent_id)?
            .clone();

        let actions = self.state.action_history.lock().expect("action history poisoned");
        let agent_actions: Vec<AgentAction> = actions
            .iter()
            .filter(|a| a.agent_id == agent_id)
            .cloned()
            .collect();
        drop(actions);

        let action_ids: HashSet<&str> = agent_actions.iter().map(|a| a.id.as_str()).collect();
        let threats = self.state.threat_history.lock().expect("threat history poisoned");
        let agent_threats: Vec<ThreatAssessment> = threats
            .iter()
            .filter(|t| action_ids.contains(t.action_id.as_str()))
            .cloned()
            .collect();
        drop(threats);

        let mut threat_levels: HashMap<String, u64> = [
            ThreatLevel::Safe,
            ThreatLevel::Suspicious,
            ThreatLevel::Concerning,
            ThreatLevel::Dangerous,
            ThreatLevel::Critical,
        ]
        .iter()
        .map(|level| (level.to_string(), 0))
        .collect();
        for threat in &agent_threats {
            *threat_levels.entry(threat.threat_level.to_string()).or_default() += 1;
        }

        let recent_actions = agent_actions
            .iter()
            .rev()
            .take(10)
            .rev()
            .cloned()
            .collect();
        let recent_threats = agent_threats
            .iter()
            .rev()
            .take(10)
            .rev()
            .cloned()
            .collect();

        Some(AgentReport {
            agent_id: agent_id.to_string(),
            record,
            total_actions: agent_actions.len(),
            threats_detected: agent_threats.len(),
            threat_levels,
            recent_actions,
            recent_threats,
        })
    }

    /// Teardown: abort pending releases, clear all registries and
    /// histories, zero the counters. Analyzer and hook registrations stay.
    pub fn reset(&self) {
        for (_, task) in self
            .state
            .release_tasks
            .lock()
            .expect("release task map poisoned")
            .drain()
        {
            task.abort();
        }
        self.state.agents.lock().expect("agent table poisoned").clear();
        self.state
            .blocked_agents
            .lock()
            .expect("block set poisoned")
            .clear();
        self.state
            .action_history
            .lock()
            .expect("action history poisoned")
            .clear();
        self.state
            .threat_history
            .lock()
            .expect("threat history poisoned")
            .clear();
        self.state.metrics.reset();
        info!("palisade core reset");
    }
}

/// Restore an agent to active unless a kill landed in the meantime.
fn release_quarantine(state: &Arc<CoreState>, agent_id: &str) {
    let mut agents = state.agents.lock().expect("agent table poisoned");
    match agents.get_mut(agent_id) {
        Some(record) if record.status == AgentStatus::Quarantined => {
            record.status = AgentStatus::Active;
        }
        Some(_) => return,
        None => {}
    }
    drop(agents);

    state
        .blocked_agents
        .lock()
        .expect("block set poisoned")
        .remove(agent_id);
    state
        .release_tasks
        .lock()
        .expect("release task map poisoned")
        .remove(agent_id);
    info!(agent_id, "agent released from quarantine");
}
