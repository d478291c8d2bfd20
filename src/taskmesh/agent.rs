//! Agent runtimes.
//!
//! An [`AgentRuntime`] is a configured record (name, brain, permitted tool
//! names, prompt template) plus one generic step algorithm. The difference
//! between a "researcher" and a "writer" is data, not a subclass.
//!
//! A step drives the bounded tool-call loop for a single response:
//!
//! ```text
//! compose system prompt (template + injected context + tool schemas)
//!   └─ brain turn ──▶ terminal text ──▶ append message, done
//!        │
//!        └─▶ tool calls ──▶ append assistant message with calls
//!             dispatch all calls concurrently through the executor
//!             append one tool message per result
//!             decrement round budget, loop
//! ```
//!
//! The streaming path is the only implementation: terminal text arrives as
//! `stream_chunk` events ending in an `is_final` chunk, then the full
//! message is appended. Brains without streaming support are adapted by
//! emitting their complete response as a single chunk, so there is exactly
//! one copy of the loop.
//!
//! A runtime processes at most one step at a time (its history would
//! otherwise race); concurrent step requests queue on an internal lock.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use futures_util::StreamExt;

use crate::taskmesh::brain::{
    Brain, BrainChunk, BrainError, BrainToolCall, ChatMessage, ChatRole, TokenUsage,
    ToolDefinition,
};
use crate::taskmesh::error::{EngineError, EngineResult};
use crate::taskmesh::event_bus::{AgentActivity, EventBus, EventKind};
use crate::taskmesh::message::{History, Message, MessagePart, MessageRole};
use crate::taskmesh::tool_protocol::{ToolCallRequest, ToolExecutor, ToolRegistry};

/// Default bound on tool rounds within one step.
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 10;

/// Bounded retries for brain transport failures within one step.
const BRAIN_TRANSPORT_ATTEMPTS: u32 = 3;

/// Everything a runtime needs for one step, borrowed from the owning task.
///
/// The task handle itself is never stored inside the runtime; context is
/// passed into each call, so there are no pointer cycles between tasks,
/// agents, and the orchestrator.
pub struct StepContext<'a> {
    /// Owning task id, stamped into emitted events by the bus.
    pub task_id: &'a str,
    /// The task's conversation history.
    pub history: &'a tokio::sync::Mutex<History>,
    /// The task's tool registry (for schema lookup).
    pub registry: &'a ToolRegistry,
    /// The task's validated tool dispatcher.
    pub executor: &'a ToolExecutor,
    /// The task's event bus.
    pub bus: &'a EventBus,
    /// The task's cancellation signal.
    pub cancel: &'a CancellationToken,
    /// Summary of the artifacts this step is allowed to see (the
    /// orchestrator restricts it to dependency outputs).
    pub workspace_summary: Option<String>,
    /// The current plan item's instruction, injected into the system prompt.
    pub plan_fragment: Option<String>,
    /// Overrides the agent's prompt template entirely when set.
    pub system_override: Option<String>,
}

/// Result of one completed step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// The terminal assistant text.
    pub content: String,
    /// Token usage aggregated across every brain call in the step.
    pub tokens_used: Option<TokenUsage>,
    /// Number of tool rounds that were executed.
    pub tool_rounds: usize,
}

/// One brain round-trip, already flattened from the chunk stream.
struct TurnOutput {
    message_id: String,
    text: String,
    tool_calls: Vec<BrainToolCall>,
    usage: Option<TokenUsage>,
}

/// A configured agent: identity, brain, tool permissions, prompt template.
pub struct AgentRuntime {
    /// Name referenced by plan items and message attribution.
    pub name: String,
    /// Description folded into the system prompt.
    pub description: Option<String>,

    brain: Arc<dyn Brain>,
    tool_names: Vec<String>,
    prompt_template: Option<String>,
    max_tool_rounds: usize,
    step_lock: tokio::sync::Mutex<()>,
}

impl AgentRuntime {
    /// Create a runtime with the mandatory identity and brain.
    pub fn new(name: impl Into<String>, brain: Arc<dyn Brain>) -> Self {
        Self {
            name: name.into(),
            description: None,
            brain,
            tool_names: Vec::new(),
            prompt_template: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            step_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Attach a description of the agent's role (builder pattern).
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Grant the agent a set of tool method names (builder pattern). Only
    /// these methods' schemas are shown to the brain, and calls outside the
    /// set are refused without reaching the executor.
    pub fn with_tools(mut self, tool_names: Vec<String>) -> Self {
        self.tool_names = tool_names;
        self
    }

    /// Set the base prompt template (builder pattern).
    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = Some(template.into());
        self
    }

    /// Override the tool-round budget (builder pattern).
    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds;
        self
    }

    /// The tool method names this agent may call.
    pub fn tool_names(&self) -> &[String] {
        &self.tool_names
    }

    /// Run one step: drive the tool-call loop until the brain produces a
    /// terminal response, the round budget forces one, or the task is
    /// cancelled.
    pub async fn step(&self, ctx: &StepContext<'_>) -> EngineResult<StepOutcome> {
        let _exclusive = self.step_lock.lock().await;

        ctx.bus.publish(EventKind::AgentStatus {
            agent: self.name.clone(),
            activity: AgentActivity::Working,
        });
        let result = self.run_loop(ctx).await;
        ctx.bus.publish(EventKind::AgentStatus {
            agent: self.name.clone(),
            activity: AgentActivity::Idle,
        });
        result
    }

    async fn run_loop(&self, ctx: &StepContext<'_>) -> EngineResult<StepOutcome> {
        let system_prompt = self.compose_system_prompt(ctx);
        let schemas = ctx.registry.schemas(&self.tool_names)?;

        let mut usage_total = TokenUsage::default();
        let mut saw_usage = false;
        let mut rounds_left = self.max_tool_rounds;
        let mut tool_rounds = 0usize;
        let mut budget_note_sent = false;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let messages = self.chat_view(ctx).await;
            let tools_enabled = rounds_left > 0 && !schemas.is_empty();
            let tools: Option<&[ToolDefinition]> = if tools_enabled {
                Some(&schemas)
            } else {
                None
            };

            let turn = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                turn = self.brain_turn(ctx, &messages, tools, &system_prompt) => turn?,
            };

            if let Some(usage) = &turn.usage {
                usage_total.absorb(usage);
                saw_usage = true;
            }

            if turn.tool_calls.is_empty() || !tools_enabled {
                let mut message = Message::assistant(self.name.as_str(), turn.text.as_str());
                message.id = turn.message_id;
                self.push_and_emit(ctx, message).await?;
                return Ok(StepOutcome {
                    content: turn.text,
                    tokens_used: if saw_usage { Some(usage_total) } else { None },
                    tool_rounds,
                });
            }

            // Tool round: record the assistant message with its calls, then
            // dispatch them all concurrently.
            let calls: Vec<(String, String, serde_json::Value)> = turn
                .tool_calls
                .iter()
                .map(|c| (c.id.clone(), c.name.clone(), c.arguments.clone()))
                .collect();
            let leading_text = if turn.text.is_empty() {
                None
            } else {
                Some(turn.text.clone())
            };
            let mut message = Message::assistant_tool_calls(self.name.as_str(), leading_text, calls);
            message.id = turn.message_id;
            self.push_and_emit(ctx, message).await?;

            ctx.bus.publish(EventKind::AgentStatus {
                agent: self.name.clone(),
                activity: AgentActivity::Waiting,
            });
            let results = self.dispatch_tool_calls(ctx, turn.tool_calls).await?;
            ctx.bus.publish(EventKind::AgentStatus {
                agent: self.name.clone(),
                activity: AgentActivity::Working,
            });

            for result in results {
                let mut message = Message::tool_result(
                    self.name.as_str(),
                    result.call_id.as_str(),
                    result.success,
                    result.output.clone(),
                    result.error.clone(),
                );
                if let Some(artifact) = &result.artifact_ref {
                    message = message.with_attachment(artifact.clone(), None);
                }
                self.push_and_emit(ctx, message).await?;
            }

            // Safe cancellation point: every tool result is persisted.
            if ctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            tool_rounds += 1;
            rounds_left = rounds_left.saturating_sub(1);
            if rounds_left == 0 && !budget_note_sent {
                budget_note_sent = true;
                let note = Message::system(
                    "Tool-call budget exhausted. Provide your final answer now \
                     without calling any more tools.",
                );
                self.push_and_emit(ctx, note).await?;
            }
        }
    }

    /// One brain round-trip with bounded transport retries and stream
    /// flattening. A refusal is treated as terminal assistant text.
    async fn brain_turn(
        &self,
        ctx: &StepContext<'_>,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        system_prompt: &str,
    ) -> EngineResult<TurnOutput> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_turn(ctx, messages, tools, system_prompt).await {
                Ok(turn) => return Ok(turn),
                Err(BrainError::Refusal(text)) => {
                    return Ok(TurnOutput {
                        message_id: Uuid::new_v4().to_string(),
                        text,
                        tool_calls: Vec::new(),
                        usage: None,
                    });
                }
                Err(BrainError::Transport(msg)) => {
                    if attempt < BRAIN_TRANSPORT_ATTEMPTS {
                        log::warn!(
                            "agent '{}': brain transport failure (attempt {}/{}): {}",
                            self.name,
                            attempt,
                            BRAIN_TRANSPORT_ATTEMPTS,
                            msg
                        );
                        tokio::time::sleep(Duration::from_millis(200) * attempt).await;
                        continue;
                    }
                    ctx.bus.log(
                        "error",
                        format!("agent '{}': brain unavailable: {}", self.name, msg),
                    );
                    return Err(EngineError::BrainUnavailable(msg));
                }
            }
        }
    }

    async fn try_turn(
        &self,
        ctx: &StepContext<'_>,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        system_prompt: &str,
    ) -> Result<TurnOutput, BrainError> {
        let message_id = Uuid::new_v4().to_string();

        match self.brain.stream(messages, tools, Some(system_prompt)).await? {
            Some(mut chunks) => {
                let mut text = String::new();
                let mut tool_calls = Vec::new();
                let mut usage = None;
                while let Some(chunk) = chunks.next().await {
                    match chunk? {
                        BrainChunk::Text(delta) => {
                            ctx.bus.publish(EventKind::StreamChunk {
                                message_id: message_id.clone(),
                                agent: self.name.clone(),
                                delta: delta.clone(),
                                is_final: false,
                            });
                            text.push_str(&delta);
                        }
                        BrainChunk::ToolCalls(calls) => tool_calls = calls,
                        BrainChunk::End { usage: reported } => usage = reported,
                    }
                }
                if tool_calls.is_empty() {
                    ctx.bus.publish(EventKind::StreamChunk {
                        message_id: message_id.clone(),
                        agent: self.name.clone(),
                        delta: String::new(),
                        is_final: true,
                    });
                }
                Ok(TurnOutput {
                    message_id,
                    text,
                    tool_calls,
                    usage,
                })
            }
            None => {
                // Non-streaming backend: collect-the-stream in reverse; the
                // full response becomes a single chunk followed by the final
                // marker, so consumers see one protocol either way.
                let reply = self.brain.generate(messages, tools, Some(system_prompt)).await?;
                let text = reply.message.content.to_string();
                if reply.message.tool_calls.is_empty() {
                    if !text.is_empty() {
                        ctx.bus.publish(EventKind::StreamChunk {
                            message_id: message_id.clone(),
                            agent: self.name.clone(),
                            delta: text.clone(),
                            is_final: false,
                        });
                    }
                    ctx.bus.publish(EventKind::StreamChunk {
                        message_id: message_id.clone(),
                        agent: self.name.clone(),
                        delta: String::new(),
                        is_final: true,
                    });
                }
                Ok(TurnOutput {
                    message_id,
                    text,
                    tool_calls: reply.message.tool_calls,
                    usage: reply.usage,
                })
            }
        }
    }

    /// Dispatch all of one round's tool calls concurrently, preserving call
    /// order in the returned results. Calls outside the agent's permitted
    /// set are refused without reaching the executor.
    async fn dispatch_tool_calls(
        &self,
        ctx: &StepContext<'_>,
        calls: Vec<BrainToolCall>,
    ) -> EngineResult<Vec<crate::taskmesh::tool_protocol::ToolResult>> {
        let futures: Vec<_> = calls
            .into_iter()
            .map(|call| {
                let permitted = self.tool_names.iter().any(|n| n == &call.name);
                let executor = ctx.executor;
                async move {
                    if !permitted {
                        return crate::taskmesh::tool_protocol::ToolResult::failure(
                            call.id,
                            format!("tool '{}' is not available to this agent", call.name),
                        );
                    }
                    executor
                        .execute(ToolCallRequest::new(call.id, call.name, call.arguments))
                        .await
                }
            })
            .collect();

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(EngineError::Cancelled),
            results = futures_util::future::join_all(futures) => Ok(results),
        }
    }

    /// Fold the agent identity, injected context, and tool surface into the
    /// effective system prompt for this step.
    fn compose_system_prompt(&self, ctx: &StepContext<'_>) -> String {
        let mut prompt = match &ctx.system_override {
            Some(system) => system.clone(),
            None => self.prompt_template.clone().unwrap_or_else(|| {
                format!(
                    "You are {}, an agent on a collaborative team. Complete the \
                     assignment you are given, writing every artifact it names.",
                    self.name
                )
            }),
        };
        if let Some(description) = &self.description {
            prompt.push_str("\n\nRole: ");
            prompt.push_str(description);
        }
        if let Some(summary) = &ctx.workspace_summary {
            prompt.push_str("\n\nArtifacts available to you:\n");
            prompt.push_str(summary);
        }
        if let Some(fragment) = &ctx.plan_fragment {
            prompt.push_str("\n\nCurrent assignment:\n");
            prompt.push_str(fragment);
        }
        prompt
    }

    /// Flatten the history into the model-facing conversation.
    async fn chat_view(&self, ctx: &StepContext<'_>) -> Vec<ChatMessage> {
        let history = ctx.history.lock().await;
        let mut view = Vec::with_capacity(history.len());
        for message in history.messages() {
            match message.role {
                MessageRole::User => {
                    view.push(ChatMessage::new(ChatRole::User, message.text()));
                }
                MessageRole::System => {
                    view.push(ChatMessage::new(ChatRole::System, message.text()));
                }
                MessageRole::Assistant => {
                    let mut chat = ChatMessage::new(ChatRole::Assistant, message.text());
                    for part in &message.parts {
                        if let MessagePart::ToolCall {
                            call_id,
                            name,
                            arguments,
                        } = part
                        {
                            chat.tool_calls.push(BrainToolCall {
                                id: call_id.clone(),
                                name: name.clone(),
                                arguments: arguments.clone(),
                            });
                        }
                    }
                    view.push(chat);
                }
                MessageRole::Tool => {
                    for part in &message.parts {
                        if let MessagePart::ToolResult {
                            call_id,
                            success,
                            payload,
                            error,
                        } = part
                        {
                            let content = if *success {
                                payload.to_string()
                            } else {
                                error.clone().unwrap_or_else(|| "tool failed".to_string())
                            };
                            view.push(ChatMessage::new(
                                ChatRole::Tool {
                                    call_id: call_id.clone(),
                                },
                                content,
                            ));
                        }
                    }
                }
            }
        }
        view
    }

    /// Append to history and announce the message on the bus.
    async fn push_and_emit(&self, ctx: &StepContext<'_>, message: Message) -> EngineResult<()> {
        {
            let mut history = ctx.history.lock().await;
            history.push(message.clone())?;
        }
        ctx.bus.publish(EventKind::Message { message });
        Ok(())
    }
}
