use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use taskmesh::brain::{
    Brain, BrainError, BrainReply, BrainToolCall, ChatMessage, ChatRole, ToolDefinition,
};
use taskmesh::config::TeamConfig;
use taskmesh::event_bus::EventKind;
use taskmesh::orchestrator::Orchestrator;
use taskmesh::plan::ItemStatus;
use taskmesh::task::TaskStatus;
use taskmesh::tool_protocol::{ArgSpec, ArgType, Tool, ToolError, ToolMetadata};

/// One scripted brain reply: terminal text, or a batch of tool calls.
enum Reply {
    Text(String),
    Calls(Vec<(&'static str, serde_json::Value)>),
}

/// Replays a fixed reply sequence; answers a fallback text when exhausted.
struct ScriptedBrain {
    replies: Mutex<VecDeque<Reply>>,
}

impl ScriptedBrain {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().collect()),
        })
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
        let reply = match next {
            Some(Reply::Text(text)) => BrainReply {
                message: ChatMessage::new(ChatRole::Assistant, text),
                usage: None,
            },
            Some(Reply::Calls(calls)) => {
                let mut message = ChatMessage::new(ChatRole::Assistant, "");
                message.tool_calls = calls
                    .into_iter()
                    .map(|(name, arguments)| BrainToolCall {
                        id: uuid::Uuid::new_v4().to_string(),
                        name: name.to_string(),
                        arguments,
                    })
                    .collect();
                BrainReply {
                    message,
                    usage: None,
                }
            }
            None => BrainReply {
                message: ChatMessage::new(ChatRole::Assistant, "done"),
                usage: None,
            },
        };
        Ok(reply)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

fn write_call(path: &str, content: &str) -> (&'static str, serde_json::Value) {
    (
        "write_file",
        serde_json::json!({ "path": path, "content": content }),
    )
}

fn two_agent_config() -> TeamConfig {
    TeamConfig::from_json(
        r#"{
            "name": "doc-team",
            "agents": ["researcher", "writer"]
        }"#,
    )
    .unwrap()
}

const S1_PLAN: &str = r#"{"items": [
    {"id": "t1", "agent": "researcher", "action": "produce research_hello.md",
     "dependencies": []},
    {"id": "t2", "agent": "writer",
     "action": "produce report.md using research_hello.md",
     "dependencies": ["t1"]}
]}"#;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// S1: linear plan of two items driven to completion in two steps.
#[tokio::test]
async fn s1_linear_plan_completes_in_two_steps() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    let planner = ScriptedBrain::new(vec![Reply::Text(S1_PLAN.to_string())]);
    let researcher = ScriptedBrain::new(vec![
        Reply::Calls(vec![write_call("research_hello.md", "hello facts")]),
        Reply::Text("research complete".to_string()),
    ]);
    let writer = ScriptedBrain::new(vec![
        Reply::Calls(vec![write_call("report.md", "# Hello World Report")]),
        Reply::Text("report written".to_string()),
    ]);

    let mut brains: HashMap<String, Arc<dyn Brain>> = HashMap::new();
    brains.insert("researcher".to_string(), researcher);
    brains.insert("writer".to_string(), writer);

    let orchestrator = Orchestrator::new(
        dir.path().to_path_buf(),
        two_agent_config(),
        planner,
        brains,
        vec![],
    )
    .unwrap();

    orchestrator.start("write hello world report").await.unwrap();
    let mut subscriber = orchestrator.subscribe_events().unwrap();

    let first = orchestrator.step().await.unwrap();
    assert!(first.contains("t1"), "unexpected step text: {}", first);
    assert!(!orchestrator.is_complete());

    let second = orchestrator.step().await.unwrap();
    assert!(second.contains("plan complete"), "unexpected: {}", second);
    assert!(orchestrator.is_complete());

    // Workspace contains both artifacts.
    let task = orchestrator.task();
    let research = task
        .workspace()
        .read("research_hello.md", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(research, b"hello facts");
    assert!(task.workspace().has("report.md").await);

    // Two tool_call_start/result pairs and at least two task_update
    // transitions appear on the stream.
    let mut starts = 0;
    let mut results = 0;
    let mut updates = 0;
    let mut created = 0;
    while let Some(event) = subscriber.next_event().await {
        match event.kind {
            EventKind::ToolCallStart { .. } => starts += 1,
            EventKind::ToolCallResult { success, .. } => {
                assert!(success);
                results += 1;
            }
            EventKind::TaskUpdate { .. } => updates += 1,
            EventKind::ArtifactCreated { .. } => created += 1,
            _ => {}
        }
    }
    assert_eq!(starts, 2);
    assert_eq!(results, 2);
    assert!(updates >= 2);
    assert_eq!(created, 2);

    // The conversation obeys the tool pairing invariant throughout.
    assert!(task.history().lock().await.tool_pairing_holds());
}

struct AdderTool;

#[async_trait]
impl Tool for AdderTool {
    fn methods(&self) -> Vec<ToolMetadata> {
        vec![ToolMetadata::new("add", "Add two integers")
            .with_arg(ArgSpec::new("a", ArgType::Integer).required())
            .with_arg(ArgSpec::new("b", ArgType::Integer).required())]
    }

    async fn invoke(
        &self,
        _method: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let a = arguments["a"].as_i64().unwrap_or(0);
        let b = arguments["b"].as_i64().unwrap_or(0);
        Ok(serde_json::json!({ "sum": a + b }))
    }
}

/// S2: schema error surfaces to the agent as a failed result; the agent
/// corrects the call and the item completes.
#[tokio::test]
async fn s2_schema_error_recovery() {
    let dir = tempfile::tempdir().unwrap();

    let config = TeamConfig::from_json(
        r#"{
            "name": "math-team",
            "agents": [{ "name": "checker", "tools": ["add"] }]
        }"#,
    )
    .unwrap();

    let planner = ScriptedBrain::new(vec![Reply::Text(
        r#"{"items": [{"id": "t1", "agent": "checker",
            "action": "add two and three, then report the sum"}]}"#
            .to_string(),
    )]);
    let checker = ScriptedBrain::new(vec![
        Reply::Calls(vec![("add", serde_json::json!({ "a": "2", "b": 3 }))]),
        Reply::Calls(vec![("add", serde_json::json!({ "a": 2, "b": 3 }))]),
        Reply::Text("the sum is 5".to_string()),
    ]);

    let mut brains: HashMap<String, Arc<dyn Brain>> = HashMap::new();
    brains.insert("checker".to_string(), checker);

    let orchestrator = Orchestrator::new(
        dir.path().to_path_buf(),
        config,
        planner,
        brains,
        vec![Arc::new(AdderTool)],
    )
    .unwrap();

    orchestrator.start("add 2 and 3").await.unwrap();
    orchestrator.step().await.unwrap();
    assert!(orchestrator.is_complete());

    let task = orchestrator.task();
    let history = task.history().lock().await;
    assert!(history.tool_pairing_holds());

    // The first attempt came back as a schema error the agent could see.
    let schema_errors = history
        .messages()
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter(|p| match p {
            taskmesh::message::MessagePart::ToolResult { success, error, .. } => {
                !*success
                    && error
                        .as_deref()
                        .map(|e| e.starts_with("schema:") && e.contains("expected integer"))
                        .unwrap_or(false)
            }
            _ => false,
        })
        .count();
    assert_eq!(schema_errors, 1);
}

const S3_REVISED_PLAN: &str = r#"{"items": [
    {"id": "t1", "agent": "researcher", "action": "produce research_hello.md",
     "dependencies": [], "status": "completed"},
    {"id": "t2b", "agent": "writer",
     "action": "produce report.md in a French tone using research_hello.md",
     "dependencies": ["t1"]}
]}"#;

/// S3: a chat-triggered revision preserves the completed item verbatim and
/// regenerates the rest.
#[tokio::test]
async fn s3_revision_preserves_completed_work() {
    let dir = tempfile::tempdir().unwrap();

    let planner = ScriptedBrain::new(vec![
        Reply::Text(S1_PLAN.to_string()),
        Reply::Text(r#"{"kind": "revision"}"#.to_string()),
        Reply::Text(S3_REVISED_PLAN.to_string()),
    ]);
    let researcher = ScriptedBrain::new(vec![
        Reply::Calls(vec![write_call("research_hello.md", "hello facts")]),
        Reply::Text("research complete".to_string()),
    ]);
    let writer = ScriptedBrain::new(vec![
        Reply::Calls(vec![write_call("report.md", "Rapport: bonjour le monde")]),
        Reply::Text("c'est fait".to_string()),
    ]);

    let mut brains: HashMap<String, Arc<dyn Brain>> = HashMap::new();
    brains.insert("researcher".to_string(), researcher);
    brains.insert("writer".to_string(), writer);

    let orchestrator = Orchestrator::new(
        dir.path().to_path_buf(),
        two_agent_config(),
        planner,
        brains,
        vec![],
    )
    .unwrap();

    orchestrator.start("write hello world report").await.unwrap();
    orchestrator.step().await.unwrap(); // completes t1
    let mut subscriber = orchestrator.subscribe_events().unwrap();

    let reply = orchestrator
        .chat("use a French tone in the final report")
        .await
        .unwrap();
    assert!(reply.contains("Plan revised"), "unexpected: {}", reply);

    // Property 7: the completed item keeps id, action, and status.
    {
        let plan_slot = orchestrator.task().plan().lock().await;
        let graph = plan_slot.as_ref().unwrap();
        let t1 = graph.item("t1").unwrap();
        assert_eq!(t1.status, ItemStatus::Completed);
        assert_eq!(t1.action, "produce research_hello.md");
        assert!(graph.item("t2").is_none());
        let t2b = graph.item("t2b").unwrap();
        assert_eq!(t2b.status, ItemStatus::Pending);
        assert!(t2b.action.contains("French tone"));
    }

    // The revision was announced on the event stream.
    let mut announced = false;
    while let Ok(Some(event)) = subscriber.try_next_event() {
        if let EventKind::TaskUpdate {
            detail: Some(detail),
            ..
        } = event.kind
        {
            if detail.contains("plan_revised") && detail.contains("preserved=[t1]") {
                announced = true;
            }
        }
    }
    assert!(announced);

    // The revised plan still drives to completion.
    orchestrator.step().await.unwrap();
    assert!(orchestrator.is_complete());
    let report = orchestrator
        .task()
        .workspace()
        .read("report.md", None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report, b"Rapport: bonjour le monde");
}

/// S4: an item with the `halt` policy fails (declared artifact missing);
/// the task fails and later steps return immediately.
#[tokio::test]
async fn s4_halt_policy_fails_task() {
    let dir = tempfile::tempdir().unwrap();

    let config = TeamConfig::from_json(
        r#"{ "name": "solo", "agents": ["worker"] }"#,
    )
    .unwrap();
    let planner = ScriptedBrain::new(vec![Reply::Text(
        r#"{"items": [{"id": "t1", "agent": "worker",
            "action": "produce out.md", "on_failure": "halt"}]}"#
            .to_string(),
    )]);
    // The worker claims success without writing the declared artifact.
    let worker = ScriptedBrain::new(vec![Reply::Text("all done, trust me".to_string())]);

    let mut brains: HashMap<String, Arc<dyn Brain>> = HashMap::new();
    brains.insert("worker".to_string(), worker);

    let orchestrator =
        Orchestrator::new(dir.path().to_path_buf(), config, planner, brains, vec![]).unwrap();

    orchestrator.start("produce out.md").await.unwrap();
    let mut subscriber = orchestrator.subscribe_events().unwrap();

    let first = orchestrator.step().await.unwrap();
    assert!(first.contains("halting"), "unexpected: {}", first);
    assert_eq!(orchestrator.task().status(), TaskStatus::Failed);
    assert_eq!(
        orchestrator.task().plan().lock().await.as_ref().unwrap().item("t1").unwrap().status,
        ItemStatus::Failed
    );

    let second = orchestrator.step().await.unwrap();
    assert_eq!(second, "already terminated");

    // Consumers observe a terminal task_update and then end-of-stream.
    let mut last_status = None;
    while let Some(event) = subscriber.next_event().await {
        if let EventKind::TaskUpdate { status, .. } = event.kind {
            last_status = Some(status);
        }
    }
    assert_eq!(last_status, Some(TaskStatus::Failed));
}

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn methods(&self) -> Vec<ToolMetadata> {
        vec![ToolMetadata::new("slow_op", "Takes a very long time")]
    }

    async fn invoke(
        &self,
        _method: &str,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        Ok(serde_json::json!({ "done": true }))
    }
}

/// S5: cancellation while a tool is in flight: the task reaches
/// `cancelled`, the bus emits the final update and closes, and no message
/// or tool events follow.
#[tokio::test]
async fn s5_cancellation_mid_tool() {
    let dir = tempfile::tempdir().unwrap();

    let config = TeamConfig::from_json(
        r#"{ "name": "solo", "agents": [{ "name": "worker", "tools": ["slow_op"] }] }"#,
    )
    .unwrap();
    let planner = ScriptedBrain::new(vec![Reply::Text(
        r#"{"items": [{"id": "t1", "agent": "worker", "action": "run the slow operation"}]}"#
            .to_string(),
    )]);
    let worker = ScriptedBrain::new(vec![Reply::Calls(vec![(
        "slow_op",
        serde_json::json!({}),
    )])]);

    let mut brains: HashMap<String, Arc<dyn Brain>> = HashMap::new();
    brains.insert("worker".to_string(), worker);

    let orchestrator = Arc::new(
        Orchestrator::new(
            dir.path().to_path_buf(),
            config,
            planner,
            brains,
            vec![Arc::new(SlowTool)],
        )
        .unwrap(),
    );

    orchestrator.start("run the slow operation").await.unwrap();
    let mut subscriber = orchestrator.subscribe_events().unwrap();

    let stepper = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.step().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    orchestrator.cancel().await;

    let step_text = stepper.await.unwrap().unwrap();
    assert!(step_text.contains("cancelled"), "unexpected: {}", step_text);
    assert_eq!(orchestrator.task().status(), TaskStatus::Cancelled);

    // Drain the stream: after the cancelled task_update there must be no
    // further message or tool_call events, and the stream must end.
    let mut events = Vec::new();
    while let Some(event) = subscriber.next_event().await {
        events.push(event);
    }
    let cancel_index = events
        .iter()
        .position(|event| {
            matches!(
                event.kind,
                EventKind::TaskUpdate {
                    status: TaskStatus::Cancelled,
                    ..
                }
            )
        })
        .expect("cancelled task_update must be emitted");
    for event in &events[cancel_index + 1..] {
        assert!(
            !matches!(
                event.kind,
                EventKind::Message { .. }
                    | EventKind::ToolCallStart { .. }
                    | EventKind::ToolCallResult { .. }
            ),
            "unexpected event after cancellation: {:?}",
            event.kind
        );
    }
}

struct MarkerTool;

#[async_trait]
impl Tool for MarkerTool {
    fn methods(&self) -> Vec<ToolMetadata> {
        vec![ToolMetadata::new("only_in_a", "Marker method for task A")]
    }

    async fn invoke(
        &self,
        _method: &str,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        Ok(serde_json::json!({ "marker": true }))
    }
}

/// S6: two tasks write the same artifact name into isolated workspaces,
/// and neither task's registry lists the other's custom tools.
#[tokio::test]
async fn s6_tasks_are_isolated() {
    let dir = tempfile::tempdir().unwrap();

    let build = |content: &'static str, extra: Vec<Arc<dyn Tool>>| {
        let config =
            TeamConfig::from_json(r#"{ "name": "solo", "agents": ["worker"] }"#).unwrap();
        let planner = ScriptedBrain::new(vec![Reply::Text(
            r#"{"items": [{"id": "t1", "agent": "worker", "action": "produce report.md"}]}"#
                .to_string(),
        )]);
        let worker = ScriptedBrain::new(vec![
            Reply::Calls(vec![write_call("report.md", content)]),
            Reply::Text("written".to_string()),
        ]);
        let mut brains: HashMap<String, Arc<dyn Brain>> = HashMap::new();
        brains.insert("worker".to_string(), worker);
        Orchestrator::new(dir.path().to_path_buf(), config, planner, brains, extra).unwrap()
    };

    let task_a = build("contents for task A", vec![Arc::new(MarkerTool)]);
    let task_b = build("contents for task B", vec![]);

    task_a.start("produce report.md").await.unwrap();
    task_b.start("produce report.md").await.unwrap();
    task_a.step().await.unwrap();
    task_b.step().await.unwrap();
    assert!(task_a.is_complete());
    assert!(task_b.is_complete());

    let a_bytes = task_a
        .task()
        .workspace()
        .read("report.md", None)
        .await
        .unwrap()
        .unwrap();
    let b_bytes = task_b
        .task()
        .workspace()
        .read("report.md", None)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(a_bytes, b_bytes);
    assert_eq!(a_bytes, b"contents for task A");

    assert!(task_a.task().registry().list().contains(&"only_in_a"));
    assert!(!task_b.task().registry().list().contains(&"only_in_a"));
    assert!(task_b.task().registry().get("only_in_a").is_none());
}

/// Deadlock handling: a failed dependency with `proceed` dependants skips
/// them and the task concludes.
#[tokio::test]
async fn proceed_policy_skips_blocked_items() {
    let dir = tempfile::tempdir().unwrap();

    let config = TeamConfig::from_json(
        r#"{ "name": "duo", "agents": ["worker", "writer"] }"#,
    )
    .unwrap();
    let planner = ScriptedBrain::new(vec![Reply::Text(
        r#"{"items": [
            {"id": "t1", "agent": "worker", "action": "produce base.md",
             "on_failure": "proceed"},
            {"id": "t2", "agent": "writer", "action": "produce final.md",
             "dependencies": ["t1"], "on_failure": "proceed"}
        ]}"#
            .to_string(),
    )]);
    // t1 fails: nothing written despite the declared artifact.
    let worker = ScriptedBrain::new(vec![Reply::Text("oops, no file".to_string())]);
    let writer = ScriptedBrain::new(vec![]);

    let mut brains: HashMap<String, Arc<dyn Brain>> = HashMap::new();
    brains.insert("worker".to_string(), worker);
    brains.insert("writer".to_string(), writer);

    let orchestrator =
        Orchestrator::new(dir.path().to_path_buf(), config, planner, brains, vec![]).unwrap();

    orchestrator.start("produce the files").await.unwrap();
    let first = orchestrator.step().await.unwrap();
    assert!(first.contains("proceeding"), "unexpected: {}", first);

    // Next step finds t2 permanently blocked and skips it per policy; the
    // plan is then fully terminal.
    let second = orchestrator.step().await.unwrap();
    assert!(second.contains("failed items: t1"), "unexpected: {}", second);
    assert_eq!(orchestrator.task().status(), TaskStatus::Completed);
    {
        let plan_slot = orchestrator.task().plan().lock().await;
        let graph = plan_slot.as_ref().unwrap();
        assert_eq!(graph.item("t1").unwrap().status, ItemStatus::Failed);
        assert_eq!(graph.item("t2").unwrap().status, ItemStatus::Skipped);
    }
}

/// Plan generation repair: the first plan references an unknown agent and
/// is rejected; the corrected second attempt is accepted.
#[tokio::test]
async fn plan_repair_retries_invalid_plans() {
    let dir = tempfile::tempdir().unwrap();

    let config = TeamConfig::from_json(
        r#"{ "name": "solo", "agents": ["worker"] }"#,
    )
    .unwrap();
    let planner = ScriptedBrain::new(vec![
        Reply::Text(
            r#"{"items": [{"id": "t1", "agent": "ghost", "action": "produce out.md"}]}"#
                .to_string(),
        ),
        Reply::Text(
            r#"{"items": [{"id": "t1", "agent": "worker", "action": "produce out.md"}]}"#
                .to_string(),
        ),
    ]);
    let worker = ScriptedBrain::new(vec![
        Reply::Calls(vec![write_call("out.md", "content")]),
        Reply::Text("done".to_string()),
    ]);

    let mut brains: HashMap<String, Arc<dyn Brain>> = HashMap::new();
    brains.insert("worker".to_string(), worker);

    let orchestrator =
        Orchestrator::new(dir.path().to_path_buf(), config, planner, brains, vec![]).unwrap();

    orchestrator.start("produce out.md").await.unwrap();
    orchestrator.step().await.unwrap();
    assert!(orchestrator.is_complete());
    assert!(orchestrator.task().workspace().has("out.md").await);
}
