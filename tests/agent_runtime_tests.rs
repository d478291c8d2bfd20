use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use taskmesh::agent::{AgentRuntime, StepContext};
use taskmesh::brain::{
    Brain, BrainChunk, BrainError, BrainReply, BrainToolCall, ChatMessage, ChatRole,
    TokenUsage, ToolDefinition,
};
use taskmesh::error::EngineError;
use taskmesh::event_bus::{EventBus, EventKind};
use taskmesh::message::{History, Message, MessageRole};
use taskmesh::tool_protocol::{
    ArgSpec, ArgType, Tool, ToolError, ToolExecutor, ToolMetadata, ToolRegistry,
};

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn methods(&self) -> Vec<ToolMetadata> {
        vec![ToolMetadata::new("echo", "Echo the input")
            .with_arg(ArgSpec::new("text", ArgType::String).required())]
    }

    async fn invoke(
        &self,
        _method: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        Ok(serde_json::json!({ "echo": arguments["text"] }))
    }
}

fn text_reply(text: &str) -> BrainReply {
    BrainReply {
        message: ChatMessage::new(ChatRole::Assistant, text),
        usage: Some(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        }),
    }
}

fn echo_call_reply(call_id: &str, text: &str) -> BrainReply {
    let mut message = ChatMessage::new(ChatRole::Assistant, "");
    message.tool_calls = vec![BrainToolCall {
        id: call_id.to_string(),
        name: "echo".to_string(),
        arguments: serde_json::json!({ "text": text }),
    }];
    BrainReply {
        message,
        usage: Some(TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        }),
    }
}

/// Replays a fixed sequence of replies, then a fallback text.
struct ScriptedBrain {
    replies: Mutex<VecDeque<BrainReply>>,
}

impl ScriptedBrain {
    fn new(replies: Vec<BrainReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Brain for ScriptedBrain {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
        _system_prompt: Option<&str>,
    ) -> Result<BrainReply, BrainError> {
        let next = self.replies.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| text_reply("nothing left to say")))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Requests a tool call on every turn while tools are enabled; answers with
/// terminal text once they are disabled.
struct LoopingBrain;

#[async_trait]
impl Brain for LoopingBrain {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
        _system_prompt: Option<&str>,
    ) -> Result<BrainReply, BrainError> {
        match tools {
            Some(_) => Ok(echo_call_reply(
                &uuid::Uuid::new_v4().to_string(),
                "again",
            )),
            None => Ok(text_reply("final answer without tools")),
        }
    }

    fn model_name(&self) -> &str {
        "looping"
    }
}

/// Streams "Hello, " + "world" as two chunks.
struct StreamingBrain;

#[async_trait]
impl Brain for StreamingBrain {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
        _system_prompt: Option<&str>,
    ) -> Result<BrainReply, BrainError> {
        Ok(text_reply("Hello, world"))
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
        _system_prompt: Option<&str>,
    ) -> Result<Option<taskmesh::brain::BrainChunkStream>, BrainError> {
        let chunks: Vec<Result<BrainChunk, BrainError>> = vec![
            Ok(BrainChunk::Text("Hello, ".to_string())),
            Ok(BrainChunk::Text("world".to_string())),
            Ok(BrainChunk::End { usage: None }),
        ];
        Ok(Some(Box::pin(futures_util::stream::iter(chunks))))
    }

    fn model_name(&self) -> &str {
        "streaming"
    }
}

/// Never answers; used to exercise cancellation.
struct StalledBrain;

#[async_trait]
impl Brain for StalledBrain {
    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
        _system_prompt: Option<&str>,
    ) -> Result<BrainReply, BrainError> {
        tokio::time::sleep(std::time::Duration::from_secs(600)).await;
        Ok(text_reply("too late"))
    }

    fn model_name(&self) -> &str {
        "stalled"
    }
}

struct Fixture {
    history: tokio::sync::Mutex<History>,
    registry: Arc<ToolRegistry>,
    executor: ToolExecutor,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl Fixture {
    fn new() -> Self {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let registry = Arc::new(registry);
        let bus = Arc::new(EventBus::new("test-task"));
        let executor = ToolExecutor::new(registry.clone()).with_event_bus(bus.clone());
        Self {
            history: tokio::sync::Mutex::new(History::new()),
            registry,
            executor,
            bus,
            cancel: CancellationToken::new(),
        }
    }

    fn ctx(&self) -> StepContext<'_> {
        StepContext {
            task_id: "test-task",
            history: &self.history,
            registry: &self.registry,
            executor: &self.executor,
            bus: &self.bus,
            cancel: &self.cancel,
            workspace_summary: None,
            plan_fragment: Some("echo something back".to_string()),
            system_override: None,
        }
    }
}

#[tokio::test]
async fn tool_loop_round_trips_and_keeps_pairing() {
    let fixture = Fixture::new();
    fixture
        .history
        .lock()
        .await
        .push(Message::user("please echo 'hi'"))
        .unwrap();

    let brain = Arc::new(ScriptedBrain::new(vec![
        echo_call_reply("c1", "hi"),
        text_reply("the echo said hi"),
    ]));
    let agent = AgentRuntime::new("worker", brain).with_tools(vec!["echo".to_string()]);

    let mut subscriber = fixture.bus.subscribe().unwrap();
    let outcome = agent.step(&fixture.ctx()).await.unwrap();

    assert_eq!(outcome.content, "the echo said hi");
    assert_eq!(outcome.tool_rounds, 1);
    assert_eq!(outcome.tokens_used.as_ref().unwrap().total_tokens, 30);

    let history = fixture.history.lock().await;
    assert!(history.tool_pairing_holds());
    let roles: Vec<MessageRole> = history.messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Assistant, // tool call
            MessageRole::Tool,      // result
            MessageRole::Assistant, // terminal
        ]
    );

    // tool_call_start and tool_call_result both appear, in order.
    let mut saw_start = false;
    let mut saw_result = false;
    while let Ok(Some(event)) = subscriber.try_next_event() {
        match event.kind {
            EventKind::ToolCallStart { ref call_id, .. } => {
                assert_eq!(call_id, "c1");
                assert!(!saw_result);
                saw_start = true;
            }
            EventKind::ToolCallResult {
                ref call_id,
                success,
                ..
            } => {
                assert_eq!(call_id, "c1");
                assert!(success);
                saw_result = true;
            }
            _ => {}
        }
    }
    assert!(saw_start && saw_result);
}

#[tokio::test]
async fn exhausted_budget_forces_tool_free_final_answer() {
    let fixture = Fixture::new();
    fixture
        .history
        .lock()
        .await
        .push(Message::user("loop forever"))
        .unwrap();

    let agent = AgentRuntime::new("worker", Arc::new(LoopingBrain))
        .with_tools(vec!["echo".to_string()])
        .with_max_tool_rounds(2);

    let outcome = agent.step(&fixture.ctx()).await.unwrap();
    assert_eq!(outcome.content, "final answer without tools");
    assert_eq!(outcome.tool_rounds, 2);

    let history = fixture.history.lock().await;
    assert!(history.tool_pairing_holds());
    // The budget note was injected as a system message before the final call.
    assert!(history.messages().iter().any(|m| {
        m.role == MessageRole::System && m.text().contains("budget exhausted")
    }));
}

#[tokio::test]
async fn streaming_emits_chunks_then_full_message() {
    let fixture = Fixture::new();
    fixture
        .history
        .lock()
        .await
        .push(Message::user("say hello"))
        .unwrap();

    let agent = AgentRuntime::new("worker", Arc::new(StreamingBrain));
    let mut subscriber = fixture.bus.subscribe().unwrap();

    let outcome = agent.step(&fixture.ctx()).await.unwrap();
    assert_eq!(outcome.content, "Hello, world");

    let mut deltas = Vec::new();
    let mut final_seen = false;
    let mut chunk_message_id = None;
    let mut full_message_after_final = false;
    while let Ok(Some(event)) = subscriber.try_next_event() {
        match event.kind {
            EventKind::StreamChunk {
                message_id,
                delta,
                is_final,
                ..
            } => {
                assert!(!final_seen, "no chunks after the final marker");
                chunk_message_id = Some(message_id);
                if is_final {
                    final_seen = true;
                } else {
                    deltas.push(delta);
                }
            }
            EventKind::Message { message } => {
                if message.role == MessageRole::Assistant {
                    assert!(final_seen, "full message must follow the final chunk");
                    assert_eq!(message.text(), "Hello, world");
                    assert_eq!(Some(message.id), chunk_message_id);
                    full_message_after_final = true;
                }
            }
            _ => {}
        }
    }
    assert_eq!(deltas.join(""), "Hello, world");
    assert!(final_seen);
    assert!(full_message_after_final);
}

#[tokio::test]
async fn cancellation_aborts_brain_call() {
    let fixture = Fixture::new();
    fixture
        .history
        .lock()
        .await
        .push(Message::user("never answered"))
        .unwrap();

    let cancel = fixture.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let agent = AgentRuntime::new("worker", Arc::new(StalledBrain));
    let err = agent.step(&fixture.ctx()).await.unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
}

#[tokio::test]
async fn unpermitted_tool_calls_are_refused_in_conversation() {
    let fixture = Fixture::new();
    fixture
        .history
        .lock()
        .await
        .push(Message::user("try a forbidden tool"))
        .unwrap();

    // The brain asks for a tool outside the agent's granted set. The call
    // must come back as a failed result inside the conversation, never an
    // error, and the agent recovers on its next turn.
    let mut call = ChatMessage::new(ChatRole::Assistant, "");
    call.tool_calls = vec![BrainToolCall {
        id: "c1".to_string(),
        name: "forbidden_op".to_string(),
        arguments: serde_json::json!({}),
    }];
    let brain = Arc::new(ScriptedBrain::new(vec![
        BrainReply {
            message: call,
            usage: None,
        },
        text_reply("recovered"),
    ]));

    let agent = AgentRuntime::new("worker", brain).with_tools(vec!["echo".to_string()]);
    let outcome = agent.step(&fixture.ctx()).await.unwrap();
    assert_eq!(outcome.content, "recovered");

    let history = fixture.history.lock().await;
    assert!(history.tool_pairing_holds());
    let refused = history.messages().iter().any(|m| {
        m.role == MessageRole::Tool
            && m.parts.iter().any(|p| match p {
                taskmesh::message::MessagePart::ToolResult { success, error, .. } => {
                    !*success && error.as_deref().unwrap_or("").contains("not available")
                }
                _ => false,
            })
    });
    assert!(refused);
}
