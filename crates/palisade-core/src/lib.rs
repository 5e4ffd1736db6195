//! Palisade Core Library
//!
//! Layered monitoring and containment for autonomous AI agents: a perimeter
//! rule-checker, behavioral heuristics, a local statistical guardian, and an
//! LLM-backed oracle, merged into one verdict by an escalation policy and an
//! enforcement engine with a per-agent lifecycle state machine.

pub mod analyzer;
pub mod config;
pub mod core;
pub mod domain;
pub mod heuristics;
pub mod local_ai;
pub mod metrics;
pub mod oracle;
pub mod perimeter;
pub mod telemetry;

pub use analyzer::{ActionSummary, AnalysisContext, Analyzer, ThreatSummary};

pub use config::{
    EnforcementConfig, HeuristicsConfig, LocalAiConfig, OracleConfig, PalisadeConfig,
    PerimeterConfig,
};

pub use domain::{
    ActionType, AgentAction, AnalysisLayer, BackendError, EnforcementAction, PalisadeError,
    Result, ThreatAssessment, ThreatLevel,
};

pub use crate::core::{
    AgentRecord, AgentReport, AgentStatus, EnforcementHook, LayerSlot, Palisade, Submission,
};

pub use heuristics::{AgentProfileReport, HeuristicAnalyzer};
pub use local_ai::LocalAiGuardian;
pub use metrics::{Metrics, MetricsSnapshot};
pub use oracle::backend::{CompletionBackend, CompletionRequest, HttpCompletionBackend};
pub use oracle::{OracleAnalyzer, OracleStats};
pub use perimeter::{FixedResourceSampler, PerimeterDefense, PerimeterStats, ResourceSampler};
pub use telemetry::init_tracing;

/// Palisade version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
