//! Shared primitives for provider-agnostic language-model backends.
//!
//! The engine never talks to a concrete LLM vendor. Everything that needs a
//! model goes through the [`Brain`] trait, which abstracts a chat-completion
//! endpoint with native tool calling and optional streaming. The supporting
//! data types describe chat messages, tool schemas, streaming chunks, and
//! token accounting.
//!
//! Transport failures and content-level refusals are deliberately distinct
//! ([`BrainError::Transport`] vs [`BrainError::Refusal`]): only the former is
//! retried by callers.
//!
//! # Request/response shape
//!
//! ```text
//! AgentRuntime ──generate(messages, tools, system)──▶ Brain
//!              ◀── BrainReply { message: terminal text │ tool_calls } ──
//! ```
//!
//! Streaming is the same protocol delivered incrementally: a sequence of
//! [`BrainChunk::Text`] deltas, an optional [`BrainChunk::ToolCalls`], and a
//! terminating [`BrainChunk::End`]. Backends without streaming support simply
//! inherit the default [`Brain::stream`], which returns `None` and lets the
//! caller fall back to [`Brain::generate`].

use async_trait::async_trait;
use futures_util::stream::Stream;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

/// Conversation roles in the model-facing message format.
#[derive(Debug, Clone)]
pub enum ChatRole {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message (model output).
    Assistant,
    /// A tool-result message correlating with a prior assistant
    /// [`BrainToolCall`] via its `call_id`.
    Tool { call_id: String },
}

/// A single tool call requested by the model in a native function-calling
/// response.
///
/// The `id` is echoed back in the correlated `ChatRole::Tool` message so the
/// model can match results to requests.
#[derive(Debug, Clone)]
pub struct BrainToolCall {
    /// Opaque call ID, unique within the response.
    pub id: String,
    /// Tool name matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the model for this call.
    pub arguments: serde_json::Value,
}

/// Provider-agnostic tool schema passed to the model along with a request.
///
/// Produced from registered tool metadata via
/// [`ToolMetadata::to_tool_definition`](crate::taskmesh::tool_protocol::ToolMetadata::to_tool_definition).
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name as the model will reference it.
    pub name: String,
    /// Human-readable description surfaced to the model to aid selection.
    pub description: String,
    /// JSON Schema object describing the accepted arguments.
    pub parameters_schema: serde_json::Value,
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Clone, Debug, Default)]
pub struct TokenUsage {
    /// Prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Fold another usage report into this one.
    pub fn absorb(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A message in the model-facing conversation format.
///
/// This is the flattened view the [`Brain`] consumes; the richer history
/// records live in [`message`](crate::taskmesh::message). Content is stored
/// as `Arc<str>` so conversations can be cheaply cloned when fanned out.
#[derive(Clone, Debug)]
pub struct ChatMessage {
    /// The role associated with the message.
    pub role: ChatRole,
    /// The message body.
    pub content: Arc<str>,
    /// Native tool calls requested by the assistant. Non-empty only on
    /// assistant messages that select one or more tools.
    pub tool_calls: Vec<BrainToolCall>,
}

impl ChatMessage {
    /// Build a plain message with the given role and no tool calls.
    pub fn new(role: ChatRole, content: impl AsRef<str>) -> Self {
        Self {
            role,
            content: Arc::from(content.as_ref()),
            tool_calls: Vec::new(),
        }
    }
}

/// The terminal output of a single [`Brain::generate`] call.
#[derive(Clone, Debug)]
pub struct BrainReply {
    /// The assistant message: terminal text, or text plus `tool_calls`.
    pub message: ChatMessage,
    /// Token accounting for this call, when the provider reports it.
    pub usage: Option<TokenUsage>,
}

/// One element of a streaming response.
#[derive(Clone, Debug)]
pub enum BrainChunk {
    /// An incremental piece of assistant text.
    Text(String),
    /// The model selected one or more tools. At most one `ToolCalls` chunk
    /// appears per response, after which the stream ends.
    ToolCalls(Vec<BrainToolCall>),
    /// End of the response, with token accounting when available.
    End { usage: Option<TokenUsage> },
}

/// Errors surfaced by [`Brain`] implementations.
///
/// Callers retry `Transport` failures within a bounded budget and never
/// retry `Refusal`s: a refusal is a well-formed answer the model chose to
/// give, not an infrastructure problem.
#[derive(Debug, Clone)]
pub enum BrainError {
    /// Network, authentication, rate-limit, or serialization failure between
    /// the engine and the provider.
    Transport(String),
    /// The model declined to produce the requested content.
    Refusal(String),
}

impl fmt::Display for BrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrainError::Transport(msg) => write!(f, "Brain transport error: {}", msg),
            BrainError::Refusal(msg) => write!(f, "Brain refusal: {}", msg),
        }
    }
}

impl Error for BrainError {}

/// Type alias for a stream of brain chunks compatible with `Send` executors.
pub type BrainChunkStream = Pin<Box<dyn Stream<Item = Result<BrainChunk, BrainError>> + Send>>;

/// Trait-driven abstraction for a language-model backend.
///
/// Implementations must be thread-safe (`Send + Sync`) so they can be shared
/// between agents and tokio tasks via `Arc<dyn Brain>`.
#[async_trait]
pub trait Brain: Send + Sync {
    /// Send a full request/response style chat completion.
    ///
    /// `messages` carries the conversation so far in model order. `tools`
    /// holds the schemas of every tool the model is permitted to call for
    /// this turn; pass `None` to disable tool calling entirely (used for the
    /// forced-final call after the tool-round budget is exhausted).
    /// `system_prompt`, when present, primes the model before `messages`.
    ///
    /// On success the reply's message either is terminal assistant text or
    /// carries one or more [`BrainToolCall`]s in
    /// [`ChatMessage::tool_calls`].
    async fn generate(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        system_prompt: Option<&str>,
    ) -> Result<BrainReply, BrainError>;

    /// Request a streaming response.
    ///
    /// Backends without streaming support inherit this default, which
    /// resolves to `Ok(None)`; callers then fall back to
    /// [`generate`](Brain::generate) and synthesize a single-chunk stream.
    /// A `Some(BrainChunkStream)` must yield [`BrainChunk::Text`] deltas
    /// and/or one [`BrainChunk::ToolCalls`], terminated by
    /// [`BrainChunk::End`].
    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
        _system_prompt: Option<&str>,
    ) -> Result<Option<BrainChunkStream>, BrainError> {
        Ok(None)
    }

    /// Identifier of the upstream model (e.g. `"gpt-4.1"`), for logging and
    /// diagnostics.
    fn model_name(&self) -> &str;
}
