//! Tool protocol: per-task registry, schema generation, and validated
//! execution.
//!
//! A [`Tool`] exposes one or more named methods, each described by a
//! [`ToolMetadata`] whose [`ArgSpec`]s double as the validation rules and
//! the source of the model-facing JSON schema. Registration happens at
//! agent wiring time into the task's own [`ToolRegistry`]: there is no
//! process-wide registry, and a tool registered in one task is invisible to
//! every other task.
//!
//! ```text
//! AgentRuntime ─▶ ToolExecutor ─▶ ToolRegistry ─▶ Tool::invoke
//!                    │
//!                    ├─ schema validation (mismatch → schema_error result)
//!                    ├─ per-call timeout + optional concurrency cap
//!                    ├─ transport-only retries
//!                    └─ tool_call_start / tool_call_result events + stats
//! ```
//!
//! The executor never raises for tool-level problems: schema mismatches,
//! timeouts, and tool failures all come back as a failed [`ToolResult`] so
//! the agent sees the error inside the conversation and may retry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::taskmesh::brain::ToolDefinition;
use crate::taskmesh::error::{EngineError, EngineResult};
use crate::taskmesh::event_bus::{EventBus, EventKind};
use crate::taskmesh::workspace::Workspace;

/// Default per-call execution deadline.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Tool results larger than this (serialised) are spilled to the workspace
/// and replaced in history by an artifact reference.
pub const SPILL_THRESHOLD_BYTES: usize = 64 * 1024;

/// The JSON type an argument accepts.
///
/// Compound types carry their inner shape inline: an `Array` knows its
/// element type and an `Object` lists its fields, so a single `ArgType`
/// value describes an entire nested schema. The same value drives both
/// argument validation and schema generation, which keeps the two from
/// drifting apart.
#[derive(Debug, Clone)]
pub enum ArgType {
    String,
    Number,
    Integer,
    Boolean,
    /// Homogeneous array of the given element type.
    Array(Box<ArgType>),
    /// Object with the given named fields.
    Object(Vec<ArgSpec>),
}

impl ArgType {
    fn json_name(&self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Number => "number",
            ArgType::Integer => "integer",
            ArgType::Boolean => "boolean",
            ArgType::Array(_) => "array",
            ArgType::Object(_) => "object",
        }
    }

    /// JSON-schema fragment for this type, recursing into compound shapes.
    fn schema_fragment(&self) -> serde_json::Value {
        match self {
            ArgType::Array(element) => serde_json::json!({
                "type": "array",
                "items": element.schema_fragment(),
            }),
            ArgType::Object(fields) => {
                let mut properties = serde_json::Map::new();
                let mut required = Vec::new();
                for field in fields {
                    properties.insert(field.name.clone(), field.schema());
                    if field.required {
                        required.push(serde_json::Value::String(field.name.clone()));
                    }
                }
                let mut schema = serde_json::Map::new();
                schema.insert(
                    "type".to_string(),
                    serde_json::Value::String("object".to_string()),
                );
                schema.insert(
                    "properties".to_string(),
                    serde_json::Value::Object(properties),
                );
                if !required.is_empty() {
                    schema.insert("required".to_string(), serde_json::Value::Array(required));
                }
                serde_json::Value::Object(schema)
            }
            scalar => serde_json::json!({ "type": scalar.json_name() }),
        }
    }
}

/// One argument of a tool method: its name, the [`ArgType`] it accepts, and
/// whether the model may omit it.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: String,
    pub arg_type: ArgType,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<serde_json::Value>,
}

impl ArgSpec {
    /// An optional argument of the given name and type.
    pub fn new(name: impl Into<String>, arg_type: ArgType) -> Self {
        Self {
            name: name.into(),
            arg_type,
            description: None,
            required: false,
            default: None,
        }
    }

    /// Explain the argument to the model; the text lands in the schema.
    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = Some(text.into());
        self
    }

    /// The model must supply this argument.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Value assumed when the model omits the argument.
    pub fn with_default(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }

    fn schema(&self) -> serde_json::Value {
        let mut fragment = self.arg_type.schema_fragment();
        if let Some(object) = fragment.as_object_mut() {
            if let Some(text) = &self.description {
                object.insert(
                    "description".to_string(),
                    serde_json::Value::String(text.clone()),
                );
            }
            if let Some(value) = &self.default {
                object.insert("default".to_string(), value.clone());
            }
        }
        fragment
    }
}

/// Describes one invocable method: name, purpose, and argument specs.
#[derive(Debug, Clone)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub args: Vec<ArgSpec>,
}

impl ToolMetadata {
    /// Metadata for a method taking no arguments.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args: Vec::new(),
        }
    }

    /// Declare an argument (builder pattern).
    pub fn with_arg(mut self, arg: ArgSpec) -> Self {
        self.args.push(arg);
        self
    }

    /// Build the model-facing schema for this method. The argument list is
    /// itself an object shape, so this is just the object schema of `args`.
    pub fn to_tool_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: ArgType::Object(self.args.clone()).schema_fragment(),
        }
    }
}

/// Error types for tool operations.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Requested method is not registered in the current registry.
    NotFound(String),
    /// Lower level transport failure (network, process spawn, ...). The only
    /// variant the executor retries.
    Transport(String),
    /// The tool ran and reported an application level failure.
    Execution(String),
    /// The provided JSON arguments failed validation or deserialization.
    InvalidParameters(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {}", name),
            ToolError::Transport(msg) => write!(f, "Tool transport error: {}", msg),
            ToolError::Execution(msg) => write!(f, "Tool execution failed: {}", msg),
            ToolError::InvalidParameters(msg) => write!(f, "Invalid parameters: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// A capability that agents can invoke.
///
/// One `Tool` may expose several named methods; [`Tool::methods`] is the
/// discovery hook called at agent wiring time, and [`Tool::invoke`] routes a
/// call to the named method.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The methods this tool exposes.
    fn methods(&self) -> Vec<ToolMetadata>;

    /// Execute one method with already-validated arguments.
    async fn invoke(
        &self,
        method: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError>;
}

/// The result of a tool execution, correlated to its call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Echo of the originating call id.
    pub call_id: String,
    /// Whether the execution succeeded.
    pub success: bool,
    /// Output payload (or `null` on failure).
    pub output: serde_json::Value,
    /// Error message when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when an oversized output was spilled to the workspace; names the
    /// artifact holding the full payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
}

impl ToolResult {
    /// Convenience constructor for successful execution.
    pub fn ok(call_id: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output,
            error: None,
            artifact_ref: None,
        }
    }

    /// Convenience constructor for failed execution.
    pub fn failure(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            artifact_ref: None,
        }
    }

    /// A failure describing a schema validation mismatch. The error string is
    /// prefixed with `schema:` so agents (and tests) can distinguish it from
    /// runtime failures.
    pub fn schema_error(call_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::failure(call_id, format!("schema: {}", detail.into()))
    }

    /// Whether this result represents a schema validation failure.
    pub fn is_schema_error(&self) -> bool {
        self.error
            .as_deref()
            .map(|e| e.starts_with("schema:"))
            .unwrap_or(false)
    }
}

/// Retry policy for transport-level failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base backoff; attempt `n` sleeps `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(200),
        }
    }
}

/// One tool invocation as dispatched by an agent.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Correlation id echoed into the [`ToolResult`].
    pub call_id: String,
    /// Method name to execute.
    pub name: String,
    /// JSON arguments.
    pub arguments: serde_json::Value,
    /// Optional retry policy for transport failures.
    pub retry: Option<RetryPolicy>,
}

impl ToolCallRequest {
    /// Build a call with no retry policy.
    pub fn new(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments,
            retry: None,
        }
    }

    /// Attach a retry policy (builder pattern).
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

struct RegisteredMethod {
    metadata: ToolMetadata,
    tool: Arc<dyn Tool>,
    timeout: Duration,
}

/// Per-task catalog of invocable methods.
///
/// Effectively immutable after task startup: agents are wired first, then
/// the registry only serves lookups.
pub struct ToolRegistry {
    methods: HashMap<String, RegisteredMethod>,
    order: Vec<String>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register every method a tool exposes, with the default timeout.
    /// A method name that already exists is replaced.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.register_with_timeout(tool, DEFAULT_TOOL_TIMEOUT);
    }

    /// Register every method a tool exposes with a per-call timeout override.
    pub fn register_with_timeout(&mut self, tool: Arc<dyn Tool>, timeout: Duration) {
        for metadata in tool.methods() {
            let name = metadata.name.clone();
            if self
                .methods
                .insert(
                    name.clone(),
                    RegisteredMethod {
                        metadata,
                        tool: tool.clone(),
                        timeout,
                    },
                )
                .is_none()
            {
                self.order.push(name);
            }
        }
    }

    /// Registered method names, in registration order.
    pub fn list(&self) -> Vec<&str> {
        self.order.iter().map(|s| s.as_str()).collect()
    }

    /// Metadata for one method.
    pub fn get(&self, name: &str) -> Option<&ToolMetadata> {
        self.methods.get(name).map(|m| &m.metadata)
    }

    /// Model-facing schemas for exactly the given method names. An unknown
    /// name is an error, not a silent omission.
    pub fn schemas(&self, names: &[String]) -> EngineResult<Vec<ToolDefinition>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.methods.get(name) {
                Some(method) => out.push(method.metadata.to_tool_definition()),
                None => {
                    return Err(EngineError::ToolExecutionError(format!(
                        "unknown tool '{}'",
                        name
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Schemas for every registered method, in registration order.
    pub fn all_schemas(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.methods.get(name))
            .map(|m| m.metadata.to_tool_definition())
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate JSON arguments against a method's argument specs.
///
/// Returns a human-readable description of the first mismatch. A method
/// with no declared arguments accepts anything.
pub fn validate_arguments(metadata: &ToolMetadata, args: &serde_json::Value) -> Result<(), String> {
    if metadata.args.is_empty() {
        return Ok(());
    }
    let object = match args.as_object() {
        Some(object) => object,
        None => return Err("expected a JSON object of arguments".to_string()),
    };
    for spec in &metadata.args {
        match object.get(&spec.name) {
            Some(value) => check_value(&spec.name, &spec.arg_type, value)?,
            None => {
                if spec.required && spec.default.is_none() {
                    return Err(format!("missing required argument '{}'", spec.name));
                }
            }
        }
    }
    Ok(())
}

fn check_value(name: &str, arg_type: &ArgType, value: &serde_json::Value) -> Result<(), String> {
    let mismatch = || {
        Err(format!(
            "expected {} for argument '{}'",
            arg_type.json_name(),
            name
        ))
    };
    match arg_type {
        ArgType::String if value.is_string() => Ok(()),
        ArgType::Number if value.is_number() => Ok(()),
        ArgType::Integer if value.is_i64() || value.is_u64() => Ok(()),
        ArgType::Boolean if value.is_boolean() => Ok(()),
        ArgType::Array(element) => match value.as_array() {
            Some(items) => {
                let element_name = format!("{}[]", name);
                for item in items {
                    check_value(&element_name, element, item)?;
                }
                Ok(())
            }
            None => mismatch(),
        },
        ArgType::Object(fields) => match value.as_object() {
            Some(object) => {
                for field in fields {
                    match object.get(&field.name) {
                        Some(nested) => check_value(&field.name, &field.arg_type, nested)?,
                        None => {
                            if field.required && field.default.is_none() {
                                return Err(format!(
                                    "missing required field '{}' in argument '{}'",
                                    field.name, name
                                ));
                            }
                        }
                    }
                }
                Ok(())
            }
            None => mismatch(),
        },
        _ => mismatch(),
    }
}

/// Per-method execution counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolStats {
    pub calls: u64,
    pub errors: u64,
    pub total_latency_ms: u64,
}

/// Validated tool dispatcher for one task.
///
/// All tool-level failures come back as failed [`ToolResult`]s; `execute`
/// itself never errors.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    bus: Option<Arc<EventBus>>,
    workspace: Option<Arc<Workspace>>,
    semaphore: Option<Arc<Semaphore>>,
    stats: Mutex<HashMap<String, ToolStats>>,
    spill_threshold: usize,
}

impl ToolExecutor {
    /// Build an executor over a task's registry.
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            bus: None,
            workspace: None,
            semaphore: None,
            stats: Mutex::new(HashMap::new()),
            spill_threshold: SPILL_THRESHOLD_BYTES,
        }
    }

    /// Emit `tool_call_start` / `tool_call_result` events (builder pattern).
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Enable spilling of oversized outputs into the task workspace
    /// (builder pattern).
    pub fn with_workspace(mut self, workspace: Arc<Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Cap the number of concurrently executing tool calls (builder pattern).
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.semaphore = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    /// Override the spill threshold (builder pattern).
    pub fn with_spill_threshold(mut self, bytes: usize) -> Self {
        self.spill_threshold = bytes;
        self
    }

    /// The registry this executor dispatches into.
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one validated tool call.
    pub async fn execute(&self, call: ToolCallRequest) -> ToolResult {
        if let Some(bus) = &self.bus {
            bus.publish(EventKind::ToolCallStart {
                call_id: call.call_id.clone(),
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
            });
        }

        let started = Instant::now();
        let tool_name = call.name.clone();
        let result = self.execute_inner(call).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        {
            let mut stats = self.stats.lock().expect("tool stats lock poisoned");
            let entry = stats.entry(tool_name.clone()).or_default();
            entry.calls += 1;
            entry.total_latency_ms += elapsed_ms;
            if !result.success {
                entry.errors += 1;
            }
        }

        if let Some(bus) = &self.bus {
            bus.publish(EventKind::ToolCallResult {
                call_id: result.call_id.clone(),
                tool: tool_name,
                success: result.success,
                error: result.error.clone(),
            });
        }

        result
    }

    async fn execute_inner(&self, call: ToolCallRequest) -> ToolResult {
        let method = match self.registry.methods.get(&call.name) {
            Some(method) => method,
            None => {
                return ToolResult::failure(
                    call.call_id,
                    format!("unknown tool '{}'", call.name),
                )
            }
        };

        if let Err(detail) = validate_arguments(&method.metadata, &call.arguments) {
            return ToolResult::schema_error(call.call_id, detail);
        }

        let _permit = match &self.semaphore {
            Some(semaphore) => match semaphore.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    return ToolResult::failure(call.call_id, "executor shut down".to_string())
                }
            },
            None => None,
        };

        let retry = call.retry.unwrap_or_default();
        let attempts = retry.max_attempts.max(1);
        let mut last_transport_error = String::new();

        for attempt in 1..=attempts {
            let invocation = method.tool.invoke(&call.name, call.arguments.clone());
            match tokio::time::timeout(method.timeout, invocation).await {
                Err(_) => {
                    return ToolResult::failure(
                        call.call_id,
                        format!(
                            "timed out after {}s",
                            method.timeout.as_secs()
                        ),
                    );
                }
                Ok(Ok(output)) => {
                    return self.finish(call.call_id, output).await;
                }
                Ok(Err(ToolError::Transport(msg))) => {
                    last_transport_error = msg;
                    if attempt < attempts {
                        log::warn!(
                            "tool '{}' transport failure (attempt {}/{}): {}",
                            call.name,
                            attempt,
                            attempts,
                            last_transport_error
                        );
                        tokio::time::sleep(retry.backoff * attempt).await;
                    }
                }
                Ok(Err(err)) => {
                    return ToolResult::failure(call.call_id, err.to_string());
                }
            }
        }

        ToolResult::failure(
            call.call_id,
            format!("transport failure after {} attempts: {}", attempts, last_transport_error),
        )
    }

    /// Wrap a successful output, spilling it to the workspace when it
    /// exceeds the threshold.
    async fn finish(&self, call_id: String, output: serde_json::Value) -> ToolResult {
        let serialised = output.to_string();
        if serialised.len() > self.spill_threshold {
            if let Some(workspace) = &self.workspace {
                let artifact = format!("tool_outputs/{}.json", call_id);
                match workspace
                    .write(
                        &artifact,
                        serialised.as_bytes(),
                        "application/json",
                        Some("oversized tool output"),
                    )
                    .await
                {
                    Ok(_) => {
                        let mut result = ToolResult::ok(
                            call_id,
                            serde_json::json!({
                                "spilled": true,
                                "artifact": artifact,
                                "bytes": serialised.len(),
                            }),
                        );
                        result.artifact_ref = Some(artifact);
                        return result;
                    }
                    Err(err) => {
                        log::warn!("failed to spill oversized tool output: {}", err);
                    }
                }
            }
        }
        ToolResult::ok(call_id, output)
    }

    /// Snapshot of per-method execution counters.
    pub fn stats(&self) -> HashMap<String, ToolStats> {
        self.stats.lock().expect("tool stats lock poisoned").clone()
    }
}
