//! The task aggregate.
//!
//! A [`Task`] is the root of ownership for one orchestration session: it
//! exclusively owns its plan, workspace, history, event bus, tool registry,
//! and agent runtimes, and everything is torn down with it. Nothing in a
//! task is reachable from another task; workspace and registry isolation
//! fall out of this ownership rule.
//!
//! On-disk layout, rooted at `<tasks_dir>/<task_id>/`:
//!
//! ```text
//! plan.json        serialised plan, rewritten after every status transition
//! history.jsonl    append-only message log
//! artifacts/       versioned workspace (objects/ + manifests/)
//! logs/events.log  mirror of log_entry events
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::taskmesh::agent::AgentRuntime;
use crate::taskmesh::config::TeamConfig;
use crate::taskmesh::error::EngineResult;
use crate::taskmesh::event_bus::{EventBus, EventKind};
use crate::taskmesh::message::History;
use crate::taskmesh::plan::PlanGraph;
use crate::taskmesh::tool_protocol::{Tool, ToolExecutor, ToolRegistry};
use crate::taskmesh::workspace::Workspace;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    AwaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Root aggregate binding plan, workspace, history, events, and agents.
pub struct Task {
    /// Opaque task identifier.
    pub id: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    config: TeamConfig,
    dir: PathBuf,
    status: Mutex<TaskStatus>,
    plan: tokio::sync::Mutex<Option<PlanGraph>>,
    history: tokio::sync::Mutex<History>,
    workspace: Arc<Workspace>,
    bus: Arc<EventBus>,
    registry: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    agents: HashMap<String, Arc<AgentRuntime>>,
    cancel: CancellationToken,
}

impl Task {
    /// Create a task directory under `tasks_dir` and wire up its owned
    /// subsystems. `tools` are registered into this task's registry only;
    /// `agents` is the runtime roster keyed by agent name.
    pub fn create(
        tasks_dir: PathBuf,
        config: TeamConfig,
        tools: Vec<Arc<dyn Tool>>,
        agents: HashMap<String, Arc<AgentRuntime>>,
    ) -> EngineResult<Arc<Self>> {
        let id = Uuid::new_v4().to_string();
        let dir = tasks_dir.join(&id);
        fs::create_dir_all(dir.join("logs"))?;

        let bus = Arc::new(
            EventBus::new(id.clone()).with_log_sink(&dir.join("logs").join("events.log"))?,
        );
        let workspace =
            Arc::new(Workspace::open(dir.join("artifacts"))?.with_event_bus(bus.clone()));

        let mut registry = ToolRegistry::new();
        // Built-in workspace I/O, bound to this task's workspace.
        registry.register(Arc::new(
            crate::taskmesh::tools::WorkspaceIoTool::new(workspace.clone()),
        ));
        for tool in tools {
            registry.register(tool);
        }
        let registry = Arc::new(registry);

        let executor = Arc::new(
            ToolExecutor::new(registry.clone())
                .with_event_bus(bus.clone())
                .with_workspace(workspace.clone()),
        );

        let history = History::open(dir.join("history.jsonl"))?;

        Ok(Arc::new(Self {
            id,
            created_at: Utc::now(),
            config,
            dir,
            status: Mutex::new(TaskStatus::Pending),
            plan: tokio::sync::Mutex::new(None),
            history: tokio::sync::Mutex::new(history),
            workspace,
            bus,
            registry,
            executor,
            agents,
            cancel: CancellationToken::new(),
        }))
    }

    /// The immutable team configuration.
    pub fn config(&self) -> &TeamConfig {
        &self.config
    }

    /// The task's on-disk directory.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Where the plan is persisted.
    pub fn plan_path(&self) -> PathBuf {
        self.dir.join("plan.json")
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        *self.status.lock().expect("task status lock poisoned")
    }

    /// Transition the status and announce it on the bus. No-op when the
    /// status is unchanged.
    pub fn set_status(&self, status: TaskStatus, detail: Option<String>) {
        {
            let mut guard = self.status.lock().expect("task status lock poisoned");
            if *guard == status && detail.is_none() {
                return;
            }
            *guard = status;
        }
        self.bus.publish(EventKind::TaskUpdate { status, detail });
    }

    /// The plan slot; `None` until plan generation succeeds.
    pub fn plan(&self) -> &tokio::sync::Mutex<Option<PlanGraph>> {
        &self.plan
    }

    /// The append-only conversation history.
    pub fn history(&self) -> &tokio::sync::Mutex<History> {
        &self.history
    }

    /// The task's versioned workspace.
    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// The task's event bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The task-scoped tool registry.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// The task-scoped tool executor.
    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    /// The agent roster.
    pub fn agents(&self) -> &HashMap<String, Arc<AgentRuntime>> {
        &self.agents
    }

    /// Look up one agent runtime by name.
    pub fn agent(&self, name: &str) -> Option<&Arc<AgentRuntime>> {
        self.agents.get(name)
    }

    /// The cancellation signal every operation of this task observes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
