//! Team and execution configuration.
//!
//! A [`TeamConfig`] describes the roster of agents, the orchestrator's own
//! brain settings, advisory handoff rules for the planner, and execution
//! limits. Configurations deserialize from JSON via serde; `brain_config`
//! entries are opaque JSON values handed verbatim to whatever constructs the
//! concrete [`Brain`](crate::taskmesh::brain::Brain) implementations; the
//! engine itself never interprets them.
//!
//! # Example
//!
//! ```
//! use taskmesh::config::TeamConfig;
//!
//! let cfg = TeamConfig::from_json(r#"{
//!     "name": "doc-team",
//!     "agents": [
//!         "researcher",
//!         { "name": "writer", "description": "Long-form writer", "tools": ["write_file"] }
//!     ],
//!     "execution": { "mode": "autonomous", "max_rounds": 8 }
//! }"#).unwrap();
//!
//! assert_eq!(cfg.name, "doc-team");
//! assert_eq!(cfg.agent_names(), vec!["researcher", "writer"]);
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level team configuration. Immutable once attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Team identifier used for logging and task labelling.
    pub name: String,

    /// Optional human-readable description of the team's purpose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Agent roster. Each entry is either a preset name or a full record.
    #[serde(default)]
    pub agents: Vec<AgentEntry>,

    /// Orchestrator-level brain and loop settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<OrchestratorConfig>,

    /// Advisory rules describing when one agent's output should feed
    /// another. Input to plan generation, not a runtime mechanism.
    #[serde(default)]
    pub handoffs: Vec<Handoff>,

    /// Execution mode and limits.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl TeamConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Names of every agent in the roster, in declaration order.
    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.name()).collect()
    }

    /// Look up a full agent record by name. Preset entries have no record.
    pub fn agent_config(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find_map(|a| match a {
            AgentEntry::Full(cfg) if cfg.name == name => Some(cfg),
            _ => None,
        })
    }
}

/// An agent roster entry: a bare preset name, or a full record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentEntry {
    /// Reference to a preset agent by name.
    Preset(String),
    /// Fully specified agent record.
    Full(AgentConfig),
}

impl AgentEntry {
    /// The agent name regardless of entry form.
    pub fn name(&self) -> &str {
        match self {
            AgentEntry::Preset(name) => name,
            AgentEntry::Full(cfg) => &cfg.name,
        }
    }
}

/// Full agent record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent name, referenced by plan items.
    pub name: String,

    /// Description folded into the agent's system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Path to the agent's prompt template file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template_path: Option<PathBuf>,

    /// Names of the tool methods this agent may call.
    #[serde(default)]
    pub tools: Vec<String>,

    /// Opaque brain configuration passed to the brain constructor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brain_config: Option<serde_json::Value>,
}

/// Orchestrator-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Opaque brain configuration for the planning brain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brain_config: Option<serde_json::Value>,

    /// Upper bound on plan items executed for one task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<usize>,

    /// Global per-task timeout in seconds. Absent means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Advisory handoff rule given to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    /// Producing agent.
    pub from_agent: String,
    /// Consuming agent.
    pub to_agent: String,
    /// Natural-language condition under which the handoff applies.
    pub condition: String,
}

/// Whether the engine drives the plan autonomously or waits on the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// The caller loops `step()` until the plan terminates.
    Autonomous,
    /// Each step is explicitly requested by the user.
    Interactive,
}

/// Execution limits applied while driving a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Execution mode.
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,

    /// Maximum tool rounds per agent step.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Per-step timeout in seconds.
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,

    /// Agent to prefer for the first plan item, when the planner has no
    /// stronger signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_agent: Option<String>,
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Autonomous
}

fn default_max_rounds() -> usize {
    10
}

fn default_step_timeout() -> u64 {
    300
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            max_rounds: default_max_rounds(),
            timeout_seconds: default_step_timeout(),
            initial_agent: None,
        }
    }
}
