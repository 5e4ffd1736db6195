//! Enforcement and agent lifecycle tests: kill permanence, quarantine
//! auto-release, hook isolation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use palisade_core::{
    ActionType, AgentAction, AgentStatus, AnalysisLayer, EnforcementAction, EnforcementConfig,
    EnforcementHook, Palisade, PalisadeConfig, Submission, ThreatAssessment, ThreatLevel,
};

fn core_with_quarantine(seconds: u64) -> Palisade {
    Palisade::new(PalisadeConfig {
        enforcement: EnforcementConfig {
            quarantine_duration_seconds: seconds,
            ..EnforcementConfig::default()
        },
        ..PalisadeConfig::default()
    })
}

fn submit(core: &Palisade, agent: &str) -> AgentAction {
    let action = AgentAction::new(agent, ActionType::ApiCall, "test action");
    assert_eq!(core.submit_action(&action), Submission::Accepted(action.id.clone()));
    action
}

fn assessment(action: &AgentAction, level: ThreatLevel, enforcement: EnforcementAction) -> ThreatAssessment {
    ThreatAssessment::new(
        &action.id,
        level,
        1.0,
        vec!["test verdict".to_string()],
        enforcement,
        AnalysisLayer::Aggregate,
    )
}

#[tokio::test]
async fn test_kill_is_permanent() {
    let core = Palisade::new(PalisadeConfig::default());
    core.register_agent("rogue", BTreeMap::new());
    let action = submit(&core, "rogue");

    let verdict = assessment(&action, ThreatLevel::Critical, EnforcementAction::Kill);
    assert!(!core.enforce(&verdict).await);

    assert_eq!(core.agent_status("rogue"), Some(AgentStatus::Killed));
    assert_eq!(core.metrics().agent_kills, 1);
    assert_eq!(core.metrics().blocked_agents, 1);

    // Subsequent submissions are rejected without entering the pipeline.
    let retry = AgentAction::new("rogue", ActionType::ApiCall, "try again");
    assert_eq!(core.submit_action(&retry), Submission::Blocked);
    assert_eq!(core.metrics().total_actions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_quarantine_releases_after_duration() {
    let core = core_with_quarantine(30);
    core.register_agent("flaky", BTreeMap::new());
    let action = submit(&core, "flaky");

    let verdict = assessment(&action, ThreatLevel::Dangerous, EnforcementAction::Quarantine);
    assert!(!core.enforce(&verdict).await);

    assert_eq!(core.agent_status("flaky"), Some(AgentStatus::Quarantined));
    let blocked = AgentAction::new("flaky", ActionType::ApiCall, "during quarantine");
    assert_eq!(core.submit_action(&blocked), Submission::Blocked);

    // Past the configured duration the agent is active again.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(core.agent_status("flaky"), Some(AgentStatus::Active));
    let retry = AgentAction::new("flaky", ActionType::ApiCall, "after release");
    assert!(matches!(core.submit_action(&retry), Submission::Accepted(_)));
}

#[tokio::test(start_paused = true)]
async fn test_kill_cancels_pending_release() {
    let core = core_with_quarantine(30);
    core.register_agent("rogue", BTreeMap::new());
    let action = submit(&core, "rogue");

    let quarantine = assessment(&action, ThreatLevel::Dangerous, EnforcementAction::Quarantine);
    core.enforce(&quarantine).await;
    assert_eq!(core.agent_status("rogue"), Some(AgentStatus::Quarantined));

    let kill = assessment(&action, ThreatLevel::Critical, EnforcementAction::Kill);
    core.enforce(&kill).await;
    assert_eq!(core.agent_status("rogue"), Some(AgentStatus::Killed));

    // The quarantine release must never fire after the kill.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(core.agent_status("rogue"), Some(AgentStatus::Killed));
    let retry = AgentAction::new("rogue", ActionType::ApiCall, "still dead");
    assert_eq!(core.submit_action(&retry), Submission::Blocked);
}

#[tokio::test(start_paused = true)]
async fn test_requarantine_replaces_pending_release() {
    let core = core_with_quarantine(30);
    core.register_agent("flaky", BTreeMap::new());
    let action = submit(&core, "flaky");

    let verdict = assessment(&action, ThreatLevel::Dangerous, EnforcementAction::Quarantine);
    core.enforce(&verdict).await;

    // Twenty seconds in, a second quarantine restarts the clock.
    tokio::time::sleep(Duration::from_secs(20)).await;
    core.enforce(&verdict).await;

    // The first release time passes without effect.
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(core.agent_status("flaky"), Some(AgentStatus::Quarantined));

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(core.agent_status("flaky"), Some(AgentStatus::Active));
}

#[tokio::test]
async fn test_block_denies_and_counts() {
    let core = Palisade::new(PalisadeConfig::default());
    core.register_agent("noisy", BTreeMap::new());
    let action = submit(&core, "noisy");

    let verdict = assessment(&action, ThreatLevel::Dangerous, EnforcementAction::Block);
    assert!(!core.enforce(&verdict).await);
    assert_eq!(core.metrics().blocked_actions, 1);

    // Blocking an action does not block the agent.
    assert_eq!(core.agent_status("noisy"), Some(AgentStatus::Active));
    assert!(matches!(
        core.submit_action(&AgentAction::new("noisy", ActionType::ApiCall, "next")),
        Submission::Accepted(_)
    ));
}

#[tokio::test]
async fn test_non_denying_recommendations_allow() {
    let core = Palisade::new(PalisadeConfig::default());
    let action = submit(&core, "calm");

    for enforcement in [
        EnforcementAction::Allow,
        EnforcementAction::Log,
        EnforcementAction::Delay,
        EnforcementAction::RequireApproval,
        EnforcementAction::Sandbox,
        EnforcementAction::Throttle,
    ] {
        let verdict = assessment(&action, ThreatLevel::Suspicious, enforcement);
        assert!(core.enforce(&verdict).await, "{enforcement} should allow");
    }
}

struct RecordingHook {
    seen: Mutex<Vec<String>>,
}

impl EnforcementHook for RecordingHook {
    fn on_assessment(&self, assessment: &ThreatAssessment) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(assessment.action_id.clone());
        Ok(())
    }
}

struct FailingHook;

impl EnforcementHook for FailingHook {
    fn on_assessment(&self, _assessment: &ThreatAssessment) -> anyhow::Result<()> {
        anyhow::bail!("hook backend unavailable")
    }
}

#[tokio::test]
async fn test_hooks_observe_every_assessment_and_failures_are_isolated() {
    let core = Palisade::new(PalisadeConfig::default());
    let recording = Arc::new(RecordingHook {
        seen: Mutex::new(Vec::new()),
    });
    // The failing hook runs first; it must not stop the recording hook.
    core.register_enforcement_hook(Arc::new(FailingHook));
    core.register_enforcement_hook(Arc::clone(&recording) as Arc<dyn EnforcementHook>);

    let action = submit(&core, "watched");
    let allow = assessment(&action, ThreatLevel::Safe, EnforcementAction::Allow);
    let block = assessment(&action, ThreatLevel::Dangerous, EnforcementAction::Block);

    assert!(core.enforce(&allow).await);
    assert!(!core.enforce(&block).await);

    let seen = recording.seen.lock().unwrap();
    assert_eq!(seen.len(), 2, "hooks run for allowed and denied outcomes alike");
}
