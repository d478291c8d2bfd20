// src/lib.rs

// Import the top-level `taskmesh` module.
pub mod taskmesh;

// Re-exporting key items for easier external access.
pub use crate::taskmesh::agent::{self, AgentRuntime, StepContext, StepOutcome};
pub use crate::taskmesh::brain::{
    self, Brain, BrainChunk, BrainError, BrainReply, ChatMessage, ChatRole, TokenUsage,
};
pub use crate::taskmesh::config::{self, TeamConfig};
pub use crate::taskmesh::error::{self, EngineError, EngineResult};
pub use crate::taskmesh::event_bus::{self, EventBus, EventKind, EventSubscriber, TaskEvent};
pub use crate::taskmesh::message::{self, History, Message, MessagePart, MessageRole};
pub use crate::taskmesh::orchestrator::{self, Orchestrator};
pub use crate::taskmesh::plan::{self, ItemStatus, OnFailure, Plan, PlanGraph, PlanItem};
pub use crate::taskmesh::task::{self, Task, TaskStatus};
pub use crate::taskmesh::tool_protocol::{self, Tool, ToolExecutor, ToolRegistry, ToolResult};
pub use crate::taskmesh::tools;
pub use crate::taskmesh::workspace::{self, Workspace};
