//! Error taxonomy for Palisade.
//!
//! Most failure modes are recovered inside the pipeline (backend outages
//! degrade to rule-based analysis, malformed payloads become absent
//! dimensions), so these types surface at the collaborator seams rather
//! than out of `process_action`.

/// Failures talking to the completion backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend returned status {status}")]
    Status { status: u16 },

    #[error("backend request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("backend transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend response missing completion text")]
    EmptyCompletion,
}

/// Palisade domain errors.
#[derive(Debug, thiserror::Error)]
pub enum PalisadeError {
    #[error("completion backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("malformed analysis payload: {0}")]
    MalformedAnalysis(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),
}

/// Result type for Palisade operations.
pub type Result<T> = std::result::Result<T, PalisadeError>;
