//! Error taxonomy for the orchestration engine.
//!
//! Every failure mode that crosses a public API boundary is a distinct
//! [`EngineError`] variant rather than a bare string. Recoverable tool-level
//! failures ([`EngineError::ToolSchemaError`], [`EngineError::ToolExecutionError`])
//! are normally folded into a `ToolResult` and surfaced to the agent inside the
//! conversation; the variants exist here for the rare cases where the failure
//! must propagate as an error instead.

use std::error::Error;
use std::fmt;

/// Unified error type for plan, tool, workspace, agent, and orchestrator
/// operations.
///
/// # Example
///
/// ```
/// use taskmesh::error::EngineError;
///
/// let err = EngineError::AgentUnknown("researcher".into());
/// assert_eq!(err.to_string(), "Unknown agent: researcher");
/// ```
#[derive(Debug, Clone)]
pub enum EngineError {
    /// The plan is structurally invalid: cyclic dependency graph, duplicate
    /// or unknown item IDs, or a malformed item (e.g. empty action).
    PlanInvalid(String),

    /// The planning brain could not produce a valid plan within the bounded
    /// number of repair attempts.
    PlanGenerationFailed(String),

    /// A plan item references an agent name that is not part of the team.
    AgentUnknown(String),

    /// A brain transport failure persisted past the retry budget.
    BrainUnavailable(String),

    /// Tool arguments did not match the published schema. Normally returned
    /// to the agent as a failed `ToolResult`, not raised.
    ToolSchemaError(String),

    /// A tool raised an error or exceeded its timeout. Normally returned to
    /// the agent as a failed `ToolResult`, not raised.
    ToolExecutionError(String),

    /// An agent signalled completion but a declared artifact was not found
    /// in the workspace.
    ArtifactMissing(String),

    /// An artifact name attempted to escape the task's workspace root.
    PathEscape(String),

    /// The operation was aborted by the task's cancellation signal.
    Cancelled,

    /// A deadline elapsed (per tool call, per step, or per task).
    Timeout(String),

    /// Underlying storage I/O failed while persisting plan, history, or
    /// artifacts.
    Storage(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::PlanInvalid(msg) => write!(f, "Invalid plan: {}", msg),
            EngineError::PlanGenerationFailed(msg) => {
                write!(f, "Plan generation failed: {}", msg)
            }
            EngineError::AgentUnknown(name) => write!(f, "Unknown agent: {}", name),
            EngineError::BrainUnavailable(msg) => write!(f, "Brain unavailable: {}", msg),
            EngineError::ToolSchemaError(msg) => write!(f, "schema: {}", msg),
            EngineError::ToolExecutionError(msg) => write!(f, "Tool execution failed: {}", msg),
            EngineError::ArtifactMissing(name) => write!(f, "Artifact missing: {}", name),
            EngineError::PathEscape(name) => {
                write!(f, "Path escapes workspace root: {}", name)
            }
            EngineError::Cancelled => write!(f, "Cancelled"),
            EngineError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            EngineError::Storage(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Storage(err.to_string())
    }
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
