//! The lead coordinator.
//!
//! An [`Orchestrator`] owns one task end to end: it asks its planning brain
//! to turn the user's goal into a dependency-ordered plan, dispatches
//! actionable plan items to agent runtimes one step at a time, verifies that
//! each item actually produced the artifacts its action names, applies
//! failure policies, and handles conversational input, including plan
//! revision that preserves completed work.
//!
//! ```text
//! start(goal)            step()                              chat(message)
//!    │                     │                                     │
//!    ▼                     ▼                                     ▼
//! persist goal      ensure plan ─▶ select actionable      classify (brain)
//!                        │              │                  qa / approval /
//!                        │              ▼                     revision
//!                        │        brief + dispatch agent        │
//!                        │              │                       ▼
//!                        │              ▼                 revised plan with
//!                        │        verify artifacts        completed items
//!                        │              │                 preserved verbatim
//!                        │              ▼
//!                        └──▶ persist plan, emit task_update
//! ```
//!
//! One `step()` call advances the plan by exactly one item. Callers that
//! want autonomy loop `while !orchestrator.is_complete() { step() }`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::taskmesh::agent::{AgentRuntime, StepContext};
use crate::taskmesh::brain::{Brain, BrainError, ChatMessage, ChatRole};
use crate::taskmesh::config::{AgentEntry, TeamConfig};
use crate::taskmesh::error::{EngineError, EngineResult};
use crate::taskmesh::event_bus::{EventKind, EventSubscriber};
use crate::taskmesh::message::Message;
use crate::taskmesh::plan::{ItemStatus, OnFailure, Plan, PlanGraph, PlanItem};
use crate::taskmesh::task::{Task, TaskStatus};
use crate::taskmesh::tool_protocol::Tool;

/// Bounded attempts for plan generation and plan revision.
const PLAN_ATTEMPTS: u32 = 3;

/// Bounded retries for planning-brain transport failures.
const PLANNER_TRANSPORT_ATTEMPTS: u32 = 3;

/// Tool methods granted to agents that do not declare an explicit tool set.
const DEFAULT_AGENT_TOOLS: [&str; 3] = ["write_file", "read_file", "list_files"];

const PLANNER_SYSTEM_PROMPT: &str = "You are the planning coordinator of a team of \
specialised agents. You decompose goals into small, dependency-ordered work items \
and answer strictly in JSON when asked for structured output.";

/// What one pass over the plan decided to do.
enum Selection {
    Dispatch(PlanItem),
    AllDone { failed: Vec<String> },
    Blocked(Vec<(String, OnFailure)>),
    Stalled,
}

/// How the user's chat message was classified by the brain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatVerdict {
    Qa,
    Revision,
    Approval,
}

/// The coordinator for one task.
pub struct Orchestrator {
    task: Arc<Task>,
    planning_brain: Arc<dyn Brain>,
    goal: tokio::sync::Mutex<Option<String>>,
    started_at: Mutex<Option<Instant>>,
    step_lock: tokio::sync::Mutex<()>,
}

impl Orchestrator {
    /// Wire up a task from a team configuration.
    ///
    /// `agent_brains` supplies the concrete brain behind every agent in the
    /// roster (keyed by agent name); `planning_brain` is the orchestrator's
    /// own brain. `extra_tools` are registered into the task's registry in
    /// addition to the built-in workspace I/O tool.
    pub fn new(
        tasks_dir: PathBuf,
        config: TeamConfig,
        planning_brain: Arc<dyn Brain>,
        agent_brains: HashMap<String, Arc<dyn Brain>>,
        extra_tools: Vec<Arc<dyn Tool>>,
    ) -> EngineResult<Self> {
        let mut agents: HashMap<String, Arc<AgentRuntime>> = HashMap::new();
        for entry in &config.agents {
            let name = entry.name().to_string();
            let brain = agent_brains.get(&name).cloned().ok_or_else(|| {
                EngineError::BrainUnavailable(format!("no brain provided for agent '{}'", name))
            })?;

            let mut runtime = AgentRuntime::new(name.clone(), brain)
                .with_max_tool_rounds(config.execution.max_rounds);

            let mut tool_names: Vec<String> = DEFAULT_AGENT_TOOLS
                .iter()
                .map(|s| s.to_string())
                .collect();

            if let AgentEntry::Full(agent_cfg) = entry {
                if let Some(description) = &agent_cfg.description {
                    runtime = runtime.with_description(description.clone());
                }
                if let Some(path) = &agent_cfg.prompt_template_path {
                    let template = std::fs::read_to_string(path)?;
                    runtime = runtime.with_prompt_template(template);
                }
                if !agent_cfg.tools.is_empty() {
                    tool_names = agent_cfg.tools.clone();
                }
            }
            runtime = runtime.with_tools(tool_names);
            agents.insert(name, Arc::new(runtime));
        }

        let task = Task::create(tasks_dir, config, extra_tools, agents)?;

        // Fail fast on tool names that do not resolve in this task's
        // registry, rather than at first dispatch.
        for agent in task.agents().values() {
            task.registry().schemas(agent.tool_names())?;
        }

        Ok(Self {
            task,
            planning_brain,
            goal: tokio::sync::Mutex::new(None),
            started_at: Mutex::new(None),
            step_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The owned task.
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Record the goal and the initial user message. Execution does not
    /// begin until the first [`step`](Orchestrator::step) call.
    pub async fn start(&self, goal: &str) -> EngineResult<String> {
        {
            let mut slot = self.goal.lock().await;
            *slot = Some(goal.to_string());
        }
        {
            let mut started = self.started_at.lock().expect("start time lock poisoned");
            started.get_or_insert_with(Instant::now);
        }
        let message = Message::user(goal);
        {
            let mut history = self.task.history().lock().await;
            history.push(message.clone())?;
        }
        self.task.bus().publish(EventKind::Message { message });
        log::info!("task {} started: {}", self.task.id, preview(goal));
        Ok(self.task.id.clone())
    }

    /// Whether the task reached `completed`.
    pub fn is_complete(&self) -> bool {
        self.task.status() == TaskStatus::Completed
    }

    /// Subscribe to the task's live event stream. `None` once the bus has
    /// closed.
    pub fn subscribe_events(&self) -> Option<EventSubscriber> {
        self.task.bus().subscribe()
    }

    /// Abort the task: signal cancellation to in-flight brain and tool
    /// calls, fail the current item, emit the terminal `task_update`, and
    /// close the event bus.
    pub async fn cancel(&self) {
        self.task.cancel_token().cancel();

        {
            let mut plan_slot = self.task.plan().lock().await;
            if let Some(graph) = plan_slot.as_mut() {
                let in_flight: Vec<String> = graph
                    .items()
                    .iter()
                    .filter(|item| item.status == ItemStatus::InProgress)
                    .map(|item| item.id.clone())
                    .collect();
                for id in in_flight {
                    graph.update_status(&id, ItemStatus::Failed);
                    log::info!("task {}: item '{}' failed: cancelled", self.task.id, id);
                }
                let _ = graph.save(&self.task.plan_path());
            }
        }

        self.task
            .set_status(TaskStatus::Cancelled, Some("cancelled".to_string()));
        self.task.bus().close();
    }

    /// Advance the plan by one dispatchable item.
    ///
    /// Returns a human-readable description of what happened this step. A
    /// terminated task returns immediately with `"already terminated"`.
    pub async fn step(&self) -> EngineResult<String> {
        let _exclusive = self.step_lock.lock().await;

        let status = self.task.status();
        if status.is_terminal() {
            return Ok("already terminated".to_string());
        }
        if status == TaskStatus::AwaitingInput {
            return Ok("awaiting user input".to_string());
        }
        if let Some(text) = self.check_global_timeout() {
            return Ok(text);
        }

        self.ensure_plan().await?;
        if self.task.status() == TaskStatus::Pending {
            self.task.set_status(TaskStatus::Running, None);
        }

        loop {
            let selection = {
                let plan_slot = self.task.plan().lock().await;
                let graph = plan_slot.as_ref().expect("plan ensured above");
                select(graph)
            };

            match selection {
                Selection::Dispatch(item) => return self.dispatch(item).await,
                Selection::AllDone { failed } => {
                    let detail = if failed.is_empty() {
                        "plan complete".to_string()
                    } else {
                        format!("plan finished; failed items: {}", failed.join(", "))
                    };
                    self.task
                        .set_status(TaskStatus::Completed, Some(detail.clone()));
                    self.task.bus().close();
                    return Ok(detail);
                }
                Selection::Blocked(blocked) => {
                    let mut skipped = Vec::new();
                    for (id, policy) in blocked {
                        match policy {
                            OnFailure::Proceed => {
                                let mut plan_slot = self.task.plan().lock().await;
                                let graph = plan_slot.as_mut().expect("plan ensured above");
                                graph.update_status(&id, ItemStatus::Skipped);
                                graph.save(&self.task.plan_path())?;
                                skipped.push(id);
                            }
                            OnFailure::Halt => {
                                let detail = format!(
                                    "item '{}' is blocked by a failed dependency (policy: halt)",
                                    id
                                );
                                self.task
                                    .set_status(TaskStatus::Failed, Some(detail.clone()));
                                self.task.bus().close();
                                return Ok(detail);
                            }
                            OnFailure::Escalate => {
                                let detail = format!(
                                    "item '{}' is blocked by a failed dependency; awaiting user input",
                                    id
                                );
                                self.task
                                    .set_status(TaskStatus::AwaitingInput, Some(detail.clone()));
                                return Ok(detail);
                            }
                        }
                    }
                    log::info!(
                        "task {}: skipped blocked items: {}",
                        self.task.id,
                        skipped.join(", ")
                    );
                    // Re-select: skipping may have unblocked the terminal
                    // accounting or exposed further blocked items.
                    continue;
                }
                Selection::Stalled => {
                    return Ok("no actionable items; work is in flight".to_string());
                }
            }
        }
    }

    /// Conversational entry point: Q&A, approval to resume, or plan
    /// revision. Never autonomously executes plan items.
    pub async fn chat(&self, text: &str) -> EngineResult<String> {
        let message = Message::user(text);
        {
            let mut history = self.task.history().lock().await;
            history.push(message.clone())?;
        }
        self.task.bus().publish(EventKind::Message { message });

        let verdict = self.classify(text).await?;
        let reply = match verdict {
            ChatVerdict::Revision => self.revise_plan(text).await?,
            ChatVerdict::Approval => {
                if self.task.status() == TaskStatus::AwaitingInput {
                    self.task
                        .set_status(TaskStatus::Running, Some("resumed by user".to_string()));
                    "Resuming the plan.".to_string()
                } else {
                    self.answer_question(text).await?
                }
            }
            ChatVerdict::Qa => self.answer_question(text).await?,
        };

        let assistant = Message::assistant("orchestrator", reply.as_str());
        {
            let mut history = self.task.history().lock().await;
            history.push(assistant.clone())?;
        }
        self.task
            .bus()
            .publish(EventKind::Message { message: assistant });
        Ok(reply)
    }

    // ── plan generation ──────────────────────────────────────────────────

    async fn ensure_plan(&self) -> EngineResult<()> {
        {
            let plan_slot = self.task.plan().lock().await;
            if plan_slot.is_some() {
                return Ok(());
            }
        }

        let goal = self.goal.lock().await.clone().ok_or_else(|| {
            EngineError::PlanGenerationFailed("no goal recorded; call start() first".to_string())
        })?;

        let roster = self.describe_roster();
        let mut last_error = String::new();

        for attempt in 1..=PLAN_ATTEMPTS {
            let prompt = self.plan_prompt(&goal, &roster, &last_error, attempt);
            let response = self.planner_generate(&prompt).await?;

            match self.validate_generated_plan(&response) {
                Ok(graph) => {
                    graph.save(&self.task.plan_path())?;
                    self.task.bus().log(
                        "info",
                        format!("plan generated with {} items", graph.items().len()),
                    );
                    let mut plan_slot = self.task.plan().lock().await;
                    *plan_slot = Some(graph);
                    return Ok(());
                }
                Err(err) => {
                    log::warn!(
                        "task {}: plan attempt {}/{} rejected: {}",
                        self.task.id,
                        attempt,
                        PLAN_ATTEMPTS,
                        err
                    );
                    last_error = err.to_string();
                }
            }
        }

        let detail = format!(
            "no valid plan after {} attempts: {}",
            PLAN_ATTEMPTS, last_error
        );
        self.task
            .set_status(TaskStatus::Failed, Some(detail.clone()));
        self.task.bus().close();
        Err(EngineError::PlanGenerationFailed(detail))
    }

    fn plan_prompt(&self, goal: &str, roster: &str, last_error: &str, attempt: u32) -> String {
        let mut prompt = format!(
            "Decompose the following goal into a plan for the team.\n\n\
             ## Goal\n{}\n\n\
             ## Team\n{}\n",
            goal, roster
        );
        if !self.task.config().handoffs.is_empty() {
            prompt.push_str("\n## Handoffs (advisory)\n");
            for handoff in &self.task.config().handoffs {
                prompt.push_str(&format!(
                    "- {} -> {}: {}\n",
                    handoff.from_agent, handoff.to_agent, handoff.condition
                ));
            }
        }
        prompt.push_str(
            "\n## Output format\n\
             Respond with ONLY a JSON object:\n\
             {\"items\": [{\"id\": \"t1\", \"agent\": \"<team agent name>\", \
             \"action\": \"<instruction naming every artifact file to write>\", \
             \"dependencies\": [\"<id>\"], \"on_failure\": \"proceed|halt|escalate\"}]}\n\
             Item ids must be unique, dependencies must reference earlier items, \
             and every action must explicitly name the artifact filename(s) the \
             agent has to write.\n",
        );
        if attempt > 1 {
            prompt.push_str(&format!(
                "\nYour previous plan was rejected: {}. Produce a corrected plan.\n",
                last_error
            ));
        }
        prompt
    }

    fn describe_roster(&self) -> String {
        let mut roster = String::new();
        for entry in &self.task.config().agents {
            let name = entry.name();
            match self.task.config().agent_config(name) {
                Some(cfg) => {
                    let description = cfg.description.as_deref().unwrap_or("(no description)");
                    roster.push_str(&format!("- {}: {}\n", name, description));
                }
                None => roster.push_str(&format!("- {}\n", name)),
            }
        }
        roster
    }

    fn validate_generated_plan(&self, response: &str) -> EngineResult<PlanGraph> {
        let mut plan: Plan = parse_json_payload(response)?;
        // A freshly generated plan always starts from scratch, whatever
        // statuses the brain decided to include.
        for item in &mut plan.items {
            item.status = ItemStatus::Pending;
            item.result_ref = None;
        }
        let graph = PlanGraph::new(plan)?;
        let names = self.task.config().agent_names();
        graph.validate_agents(&names)?;
        Ok(graph)
    }

    // ── dispatch ─────────────────────────────────────────────────────────

    async fn dispatch(&self, item: PlanItem) -> EngineResult<String> {
        let agent = match self.task.agent(&item.agent) {
            Some(agent) => agent.clone(),
            None => {
                // Plans are validated against the roster, so this is a
                // defect; fail the item through the normal policy path.
                return self
                    .fail_item(
                        &item,
                        EngineError::AgentUnknown(item.agent.clone()).to_string(),
                    )
                    .await;
            }
        };

        let (briefing, dependency_summary) = self.build_briefing(&item).await;
        let user_message = Message::user(briefing);
        {
            let mut history = self.task.history().lock().await;
            history.push(user_message.clone())?;
        }
        self.task
            .bus()
            .publish(EventKind::Message {
                message: user_message,
            });

        {
            let mut plan_slot = self.task.plan().lock().await;
            let graph = plan_slot.as_mut().expect("plan ensured above");
            graph.update_status(&item.id, ItemStatus::InProgress);
            graph.save(&self.task.plan_path())?;
        }
        log::info!(
            "task {}: dispatching item '{}' to agent '{}'",
            self.task.id,
            item.id,
            item.agent
        );

        let ctx = StepContext {
            task_id: &self.task.id,
            history: self.task.history(),
            registry: self.task.registry(),
            executor: self.task.executor(),
            bus: self.task.bus(),
            cancel: self.task.cancel_token(),
            workspace_summary: dependency_summary,
            plan_fragment: Some(item.action.clone()),
            system_override: None,
        };

        let step_timeout =
            Duration::from_secs(self.task.config().execution.timeout_seconds.max(1));
        let outcome = tokio::time::timeout(step_timeout, agent.step(&ctx)).await;

        match outcome {
            Err(_) => {
                let reason = EngineError::Timeout(format!(
                    "step exceeded {}s",
                    step_timeout.as_secs()
                ));
                self.fail_item(&item, reason.to_string()).await
            }
            Ok(Err(EngineError::Cancelled)) => {
                // cancel() owns the terminal bookkeeping.
                Ok(format!("item '{}' cancelled", item.id))
            }
            Ok(Err(err)) => self.fail_item(&item, err.to_string()).await,
            Ok(Ok(step_outcome)) => {
                let declared = extract_artifact_names(&item.action);
                let mut missing = Vec::new();
                for name in &declared {
                    if !self.task.workspace().has(name).await {
                        missing.push(name.clone());
                    }
                }
                if !missing.is_empty() {
                    return self
                        .fail_item(
                            &item,
                            EngineError::ArtifactMissing(missing.join(", ")).to_string(),
                        )
                        .await;
                }

                {
                    let mut plan_slot = self.task.plan().lock().await;
                    let graph = plan_slot.as_mut().expect("plan ensured above");
                    graph.update_status(&item.id, ItemStatus::Completed);
                    if let Some(first) = declared.first() {
                        graph.set_result_ref(&item.id, first.clone());
                    }
                    graph.save(&self.task.plan_path())?;
                }

                let summary = {
                    let plan_slot = self.task.plan().lock().await;
                    plan_slot
                        .as_ref()
                        .expect("plan ensured above")
                        .progress_summary()
                };
                let detail = format!("item '{}' completed ({})", item.id, summary);
                self.task
                    .set_status(TaskStatus::Running, Some(detail.clone()));
                if let Some(tokens) = &step_outcome.tokens_used {
                    log::debug!(
                        "task {}: item '{}' used {} tokens over {} tool rounds",
                        self.task.id,
                        item.id,
                        tokens.total_tokens,
                        step_outcome.tool_rounds
                    );
                }

                if let Some(final_detail) = self.maybe_finalize().await {
                    return Ok(final_detail);
                }
                Ok(detail)
            }
        }
    }

    /// Mark an item failed, persist, and apply the item's own failure
    /// policy to the task.
    async fn fail_item(&self, item: &PlanItem, reason: String) -> EngineResult<String> {
        {
            let mut plan_slot = self.task.plan().lock().await;
            let graph = plan_slot.as_mut().expect("plan ensured above");
            graph.update_status(&item.id, ItemStatus::Failed);
            graph.save(&self.task.plan_path())?;
        }
        self.task.bus().log(
            "error",
            format!("item '{}' failed: {}", item.id, reason),
        );

        match item.on_failure {
            OnFailure::Proceed => {
                let detail = format!("item '{}' failed ({}); proceeding", item.id, reason);
                self.task
                    .set_status(TaskStatus::Running, Some(detail.clone()));
                if let Some(final_detail) = self.maybe_finalize().await {
                    return Ok(final_detail);
                }
                Ok(detail)
            }
            OnFailure::Halt => {
                let detail = format!("item '{}' failed ({}); halting task", item.id, reason);
                self.task
                    .set_status(TaskStatus::Failed, Some(detail.clone()));
                self.task.bus().close();
                Ok(detail)
            }
            OnFailure::Escalate => {
                let detail = format!(
                    "item '{}' failed ({}); awaiting user input",
                    item.id, reason
                );
                self.task
                    .set_status(TaskStatus::AwaitingInput, Some(detail.clone()));
                Ok(detail)
            }
        }
    }

    /// When every item is terminal, conclude the task.
    async fn maybe_finalize(&self) -> Option<String> {
        let (all_terminal, failed): (bool, Vec<String>) = {
            let plan_slot = self.task.plan().lock().await;
            let graph = plan_slot.as_ref()?;
            let all_terminal = graph.items().iter().all(|item| {
                matches!(
                    item.status,
                    ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Skipped
                )
            });
            let failed = graph
                .items()
                .iter()
                .filter(|item| item.status == ItemStatus::Failed)
                .map(|item| item.id.clone())
                .collect();
            (all_terminal, failed)
        };
        if !all_terminal {
            return None;
        }
        let detail = if failed.is_empty() {
            "plan complete".to_string()
        } else {
            format!("plan finished; failed items: {}", failed.join(", "))
        };
        self.task
            .set_status(TaskStatus::Completed, Some(detail.clone()));
        self.task.bus().close();
        Some(detail)
    }

    /// Assemble the briefing for one item: its action plus the artifacts its
    /// satisfied dependencies produced, and nothing else.
    async fn build_briefing(&self, item: &PlanItem) -> (String, Option<String>) {
        let mut dependency_artifacts: Vec<String> = Vec::new();
        {
            let plan_slot = self.task.plan().lock().await;
            if let Some(graph) = plan_slot.as_ref() {
                for dep_id in &item.dependencies {
                    if let Some(dep) = graph.item(dep_id) {
                        if let Some(result_ref) = &dep.result_ref {
                            if !dependency_artifacts.contains(result_ref) {
                                dependency_artifacts.push(result_ref.clone());
                            }
                        }
                        for name in extract_artifact_names(&dep.action) {
                            if !dependency_artifacts.contains(&name) {
                                dependency_artifacts.push(name);
                            }
                        }
                    }
                }
            }
        }

        let mut present = Vec::new();
        for name in dependency_artifacts {
            if self.task.workspace().has(&name).await {
                present.push(name);
            }
        }

        let mut briefing = item.action.clone();
        let summary = if present.is_empty() {
            None
        } else {
            let listing = present
                .iter()
                .map(|name| format!("- {}", name))
                .collect::<Vec<_>>()
                .join("\n");
            briefing.push_str("\n\nArtifacts produced by your dependencies:\n");
            briefing.push_str(&listing);
            Some(listing)
        };
        (briefing, summary)
    }

    // ── chat: classification, Q&A, revision ──────────────────────────────

    async fn classify(&self, text: &str) -> EngineResult<ChatVerdict> {
        let plan_json = self.plan_json().await;
        let prompt = format!(
            "Classify the user's message against the current plan.\n\n\
             ## Current plan\n{}\n\n\
             ## User message\n{}\n\n\
             ## Rubric\n\
             - \"revision\": the user asks to change what will be done or how \
             (scope, tone, ordering, adding or removing work).\n\
             - \"approval\": the user approves, confirms, or asks to continue.\n\
             - \"qa\": anything else (questions, status requests, small talk).\n\n\
             Respond with ONLY a JSON object: {{\"kind\": \"qa|revision|approval\"}}",
            plan_json, text
        );
        let response = self.planner_generate(&prompt).await?;
        let verdict: serde_json::Value = match parse_json_payload(&response) {
            Ok(value) => value,
            Err(_) => return Ok(ChatVerdict::Qa),
        };
        Ok(match verdict["kind"].as_str() {
            Some("revision") => ChatVerdict::Revision,
            Some("approval") => ChatVerdict::Approval,
            _ => ChatVerdict::Qa,
        })
    }

    async fn answer_question(&self, text: &str) -> EngineResult<String> {
        let plan_json = self.plan_json().await;
        let goal = self.goal.lock().await.clone().unwrap_or_default();
        let prompt = format!(
            "You are coordinating this task.\n\n## Goal\n{}\n\n## Current plan\n{}\n\n\
             ## User message\n{}\n\nAnswer the user directly and concisely.",
            goal, plan_json, text
        );
        self.planner_generate(&prompt).await
    }

    async fn revise_plan(&self, request: &str) -> EngineResult<String> {
        let (old_plan_json, preserved): (String, HashMap<String, String>) = {
            let plan_slot = self.task.plan().lock().await;
            match plan_slot.as_ref() {
                None => {
                    return Ok(
                        "There is no plan yet; the revision will shape the initial plan \
                         once the task starts."
                            .to_string(),
                    )
                }
                Some(graph) => {
                    let preserved = graph
                        .items()
                        .iter()
                        .filter(|item| item.status == ItemStatus::Completed)
                        .map(|item| (item.id.clone(), item.action.clone()))
                        .collect();
                    (
                        serde_json::to_string_pretty(graph.plan())?,
                        preserved,
                    )
                }
            }
        };

        let preserved_ids: Vec<&str> = preserved.keys().map(|s| s.as_str()).collect();
        let mut last_error = String::new();

        for attempt in 1..=PLAN_ATTEMPTS {
            let mut prompt = format!(
                "Revise the current plan according to the user's request.\n\n\
                 ## Current plan\n{}\n\n## User request\n{}\n\n\
                 ## Rules\n\
                 - Items with these ids are COMPLETED and must be preserved \
                 unchanged (same id, same action, status \"completed\"): [{}]\n\
                 - Incomplete items may be replaced, re-ordered, or dropped; new \
                 items get fresh ids.\n\
                 - Respond with ONLY the full revised plan as JSON: \
                 {{\"items\": [...]}} in the same shape as the current plan.\n",
                old_plan_json,
                request,
                preserved_ids.join(", ")
            );
            if attempt > 1 {
                prompt.push_str(&format!(
                    "\nYour previous revision was rejected: {}. Try again.\n",
                    last_error
                ));
            }

            let response = self.planner_generate(&prompt).await?;
            match self.validate_revised_plan(&response, &preserved) {
                Ok(graph) => {
                    let regenerated: Vec<String> = graph
                        .items()
                        .iter()
                        .filter(|item| !preserved.contains_key(&item.id))
                        .map(|item| item.id.clone())
                        .collect();
                    graph.save(&self.task.plan_path())?;
                    {
                        let mut plan_slot = self.task.plan().lock().await;
                        *plan_slot = Some(graph);
                    }
                    let mut preserved_sorted: Vec<String> =
                        preserved.keys().cloned().collect();
                    preserved_sorted.sort();
                    let detail = format!(
                        "plan_revised preserved=[{}] regenerated=[{}]",
                        preserved_sorted.join(", "),
                        regenerated.join(", ")
                    );
                    self.task.bus().publish(EventKind::TaskUpdate {
                        status: self.task.status(),
                        detail: Some(detail.clone()),
                    });
                    log::info!("task {}: {}", self.task.id, detail);
                    return Ok(format!(
                        "Plan revised. Preserved completed items: [{}]; new or \
                         regenerated items: [{}].",
                        preserved_sorted.join(", "),
                        regenerated.join(", ")
                    ));
                }
                Err(err) => {
                    log::warn!(
                        "task {}: revision attempt {}/{} rejected: {}",
                        self.task.id,
                        attempt,
                        PLAN_ATTEMPTS,
                        err
                    );
                    last_error = err.to_string();
                }
            }
        }

        // The old plan stays in place; the failure is reported, not fatal.
        Ok(format!(
            "I could not produce a valid revision after {} attempts ({}); the \
             existing plan is unchanged.",
            PLAN_ATTEMPTS, last_error
        ))
    }

    fn validate_revised_plan(
        &self,
        response: &str,
        preserved: &HashMap<String, String>,
    ) -> EngineResult<PlanGraph> {
        let mut plan: Plan = parse_json_payload(response)?;

        for (id, action) in preserved {
            match plan.items.iter().find(|item| &item.id == id) {
                None => {
                    return Err(EngineError::PlanInvalid(format!(
                        "completed item '{}' was dropped by the revision",
                        id
                    )))
                }
                Some(item) => {
                    if &item.action != action {
                        return Err(EngineError::PlanInvalid(format!(
                            "completed item '{}' had its action altered",
                            id
                        )));
                    }
                }
            }
        }

        for item in &mut plan.items {
            if preserved.contains_key(&item.id) {
                item.status = ItemStatus::Completed;
            } else {
                item.status = ItemStatus::Pending;
                item.result_ref = None;
            }
        }

        let graph = PlanGraph::new(plan)?;
        let names = self.task.config().agent_names();
        graph.validate_agents(&names)?;
        Ok(graph)
    }

    // ── helpers ──────────────────────────────────────────────────────────

    async fn plan_json(&self) -> String {
        let plan_slot = self.task.plan().lock().await;
        match plan_slot.as_ref() {
            Some(graph) => {
                serde_json::to_string_pretty(graph.plan()).unwrap_or_else(|_| "{}".to_string())
            }
            None => "(no plan yet)".to_string(),
        }
    }

    /// One planning-brain call with bounded transport retries. Refusals are
    /// returned as text so the surrounding repair loops can react.
    async fn planner_generate(&self, prompt: &str) -> EngineResult<String> {
        let messages = [ChatMessage::new(ChatRole::User, prompt)];
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .planning_brain
                .generate(&messages, None, Some(PLANNER_SYSTEM_PROMPT))
                .await
            {
                Ok(reply) => return Ok(reply.message.content.to_string()),
                Err(BrainError::Refusal(text)) => return Ok(text),
                Err(BrainError::Transport(msg)) => {
                    if attempt < PLANNER_TRANSPORT_ATTEMPTS {
                        log::warn!(
                            "planning brain transport failure (attempt {}/{}): {}",
                            attempt,
                            PLANNER_TRANSPORT_ATTEMPTS,
                            msg
                        );
                        tokio::time::sleep(Duration::from_millis(200) * attempt).await;
                        continue;
                    }
                    self.task
                        .bus()
                        .log("error", format!("planning brain unavailable: {}", msg));
                    return Err(EngineError::BrainUnavailable(msg));
                }
            }
        }
    }

    fn check_global_timeout(&self) -> Option<String> {
        let limit = self.task.config().orchestrator.as_ref()?.timeout?;
        let started = (*self.started_at.lock().expect("start time lock poisoned"))?;
        if started.elapsed() < Duration::from_secs(limit) {
            return None;
        }
        let detail = format!("task exceeded its global timeout of {}s", limit);
        self.task
            .set_status(TaskStatus::Failed, Some(detail.clone()));
        self.task.bus().close();
        Some(detail)
    }
}

/// Decide what the next step should do, given the current plan state.
fn select(graph: &PlanGraph) -> Selection {
    if let Some(item) = graph.next_actionable() {
        return Selection::Dispatch(item.clone());
    }
    let all_terminal = graph.items().iter().all(|item| {
        matches!(
            item.status,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Skipped
        )
    });
    if all_terminal {
        let failed = graph
            .items()
            .iter()
            .filter(|item| item.status == ItemStatus::Failed)
            .map(|item| item.id.clone())
            .collect();
        return Selection::AllDone { failed };
    }
    let blocked: Vec<(String, OnFailure)> = graph
        .blocked_ids()
        .into_iter()
        .filter_map(|id| graph.item(&id).map(|item| (id, item.on_failure)))
        .collect();
    if !blocked.is_empty() {
        return Selection::Blocked(blocked);
    }
    Selection::Stalled
}

/// Extract the artifact filenames an action names.
///
/// Tokens that look like filenames with a known artifact extension count;
/// URLs and prose abbreviations do not. Order of first mention is preserved.
pub(crate) fn extract_artifact_names(action: &str) -> Vec<String> {
    const KNOWN_EXTENSIONS: [&str; 24] = [
        "md", "txt", "json", "csv", "html", "htm", "pdf", "docx", "xlsx", "pptx", "py", "rs",
        "js", "ts", "css", "yaml", "yml", "toml", "xml", "svg", "png", "jpg", "log", "sh",
    ];

    let mut names: Vec<String> = Vec::new();
    for raw in action.split(|c: char| {
        c.is_whitespace()
            || matches!(
                c,
                ',' | ';' | '(' | ')' | '[' | ']' | '{' | '}' | '"' | '\'' | '`' | '<' | '>'
            )
    }) {
        let token = raw.trim_matches(|c: char| matches!(c, '.' | ':' | '!' | '?' | '*'));
        if token.len() < 3 || token.contains("://") {
            continue;
        }
        let dot = match token.rfind('.') {
            Some(dot) if dot > 0 && dot + 1 < token.len() => dot,
            _ => continue,
        };
        let extension = token[dot + 1..].to_ascii_lowercase();
        if !KNOWN_EXTENSIONS.contains(&extension.as_str()) {
            continue;
        }
        if !names.iter().any(|existing| existing == token) {
            names.push(token.to_string());
        }
    }
    names
}

/// Extract and parse the first JSON object embedded in a response.
///
/// Models frequently wrap JSON in prose or code fences; this takes the
/// outermost `{ ... }` span and parses it.
fn parse_json_payload<T: serde::de::DeserializeOwned>(response: &str) -> EngineResult<T> {
    let start = response.find('{').ok_or_else(|| {
        EngineError::PlanInvalid("response contains no JSON object".to_string())
    })?;
    let end = response.rfind('}').ok_or_else(|| {
        EngineError::PlanInvalid("response contains an unterminated JSON object".to_string())
    })?;
    if end < start {
        return Err(EngineError::PlanInvalid(
            "response contains no JSON object".to_string(),
        ));
    }
    serde_json::from_str(&response[start..=end])
        .map_err(|e| EngineError::PlanInvalid(format!("unparseable JSON payload: {}", e)))
}

fn preview(text: &str) -> String {
    const MAX_PREVIEW_CHARS: usize = 120;
    let normalized = text.replace('\n', " ");
    let mut chars = normalized.chars();
    let preview: String = chars.by_ref().take(MAX_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}
