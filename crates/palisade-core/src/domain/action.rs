//! Agent actions — the unit of work every defense layer evaluates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of operation an autonomous agent is proposing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ApiCall,
    FileOperation,
    NetworkRequest,
    CodeExecution,
    SelfModification,
    AgentCommunication,
    ResourceAllocation,
}

impl ActionType {
    /// All variants in a fixed order — one-hot feature encoding and
    /// histogram reports rely on this ordering staying stable.
    pub const ALL: [ActionType; 7] = [
        ActionType::ApiCall,
        ActionType::FileOperation,
        ActionType::NetworkRequest,
        ActionType::CodeExecution,
        ActionType::SelfModification,
        ActionType::AgentCommunication,
        ActionType::ResourceAllocation,
    ];

    /// How sensitive this kind of operation is, on a 1–4 scale.
    ///
    /// Consumed by the gradual-escalation detector: a run of actions whose
    /// mean sensitivity climbs sharply is treated as privilege escalation.
    pub fn sensitivity(self) -> u8 {
        match self {
            ActionType::ApiCall => 1,
            ActionType::FileOperation => 2,
            ActionType::NetworkRequest => 2,
            ActionType::CodeExecution => 3,
            ActionType::AgentCommunication => 2,
            ActionType::ResourceAllocation => 2,
            ActionType::SelfModification => 4,
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionType::ApiCall => "api_call",
            ActionType::FileOperation => "file_operation",
            ActionType::NetworkRequest => "network_request",
            ActionType::CodeExecution => "code_execution",
            ActionType::SelfModification => "self_modification",
            ActionType::AgentCommunication => "agent_communication",
            ActionType::ResourceAllocation => "resource_allocation",
        };
        write!(f, "{name}")
    }
}

/// A single action proposed by an agent, submitted for evaluation.
///
/// Actions are created by the agent wrapper and never mutated afterwards;
/// every layer sees the same record. `parameters` uses a `BTreeMap` so the
/// serialized form is deterministic — the oracle's content-addressed cache
/// key depends on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAction {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    pub agent_id: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl AgentAction {
    /// Create an action stamped with a fresh v4 id and the current time.
    pub fn new(
        agent_id: impl Into<String>,
        action_type: ActionType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action_type,
            description: description.into(),
            parameters: BTreeMap::new(),
            agent_id: agent_id.into(),
            reasoning: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a parameter (builder style).
    pub fn with_parameter(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    /// Attach the agent's declared reasoning.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Override the timestamp (useful for replay and tests).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Fetch a parameter as a string slice, if present and textual.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_type_serde_names() {
        let json = serde_json::to_string(&ActionType::SelfModification).unwrap();
        assert_eq!(json, "\"self_modification\"");
        let back: ActionType = serde_json::from_str("\"api_call\"").unwrap();
        assert_eq!(back, ActionType::ApiCall);
    }

    #[test]
    fn test_sensitivity_scale() {
        assert_eq!(ActionType::ApiCall.sensitivity(), 1);
        assert_eq!(ActionType::CodeExecution.sensitivity(), 3);
        assert_eq!(ActionType::SelfModification.sensitivity(), 4);
    }

    #[test]
    fn test_action_builder() {
        let action = AgentAction::new("agent-1", ActionType::NetworkRequest, "fetch data")
            .with_parameter("url", "https://example.com/data")
            .with_reasoning("need the dataset");

        assert_eq!(action.agent_id, "agent-1");
        assert_eq!(action.str_param("url"), Some("https://example.com/data"));
        assert_eq!(action.reasoning.as_deref(), Some("need the dataset"));
        assert!(!action.id.is_empty());
    }

    #[test]
    fn test_parameters_serialize_deterministically() {
        let a = AgentAction::new("a", ActionType::ApiCall, "x")
            .with_parameter("zeta", 1)
            .with_parameter("alpha", 2);
        let json = serde_json::to_string(&a.parameters).unwrap();
        assert_eq!(json, "{\"alpha\":2,\"zeta\":1}");
    }
}
