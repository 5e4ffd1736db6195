//! Domain model: actions, assessments, and the error taxonomy.

pub mod action;
pub mod assessment;
pub mod error;

pub use action::{ActionType, AgentAction};
pub use assessment::{AnalysisLayer, EnforcementAction, ThreatAssessment, ThreatLevel};
pub use error::{BackendError, PalisadeError, Result};
