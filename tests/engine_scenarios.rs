//! End-to-end driver scenarios over a scripted backend: no network, real
//! registry, cache, and executor.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use parley::api::{ChatRequest, ChatStreamResponse, Usage};
use parley::core::cache::{CachePolicy, ToolCache};
use parley::core::engine::{ConversationEngine, EngineEvent, EngineSettings};
use parley::core::error::EngineError;
use parley::core::message::{ConversationState, Message, Outcome, Role, ToolCall};
use parley::core::stream::ChunkEvent;
use parley::core::transport::{ChatBackend, Delivery, StreamHandle};
use parley::tools::fs::ListFiles;
use parley::tools::{ToolExecutor, ToolHandler, ToolKind, ToolRegistry};

/// One scripted response the backend will hand out.
enum Script {
    Atomic(Message, Option<Usage>),
    Stream(Vec<ChunkEvent>),
    /// Stream that delivers its events and then hangs without ending.
    StalledStream(Vec<ChunkEvent>),
}

struct ScriptedBackend {
    script: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn request(&self, index: usize) -> Vec<(String, Option<String>)> {
        self.requests.lock().unwrap()[index]
            .messages
            .iter()
            .map(|message| (message.role.clone(), message.tool_call_id.clone()))
            .collect()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn request(&self, request: ChatRequest) -> Result<Delivery, EngineError> {
        self.requests.lock().unwrap().push(request);
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("backend received more requests than were scripted");
        match next {
            Script::Atomic(message, usage) => Ok(Delivery::Atomic { message, usage }),
            Script::Stream(events) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for event in events {
                    let _ = tx.send(event);
                }
                let _ = tx.send(ChunkEvent::End);
                Ok(Delivery::Stream(StreamHandle::new(rx)))
            }
            Script::StalledStream(events) => {
                let (tx, rx) = mpsc::unbounded_channel();
                for event in events {
                    let _ = tx.send(event);
                }
                // Park the sender so the channel stays open.
                tokio::spawn(async move {
                    let _tx = tx;
                    futures_util::future::pending::<()>().await;
                });
                Ok(Delivery::Stream(StreamHandle::new(rx)))
            }
        }
    }
}

struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes its arguments back"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    async fn run(&self, args: Map<String, Value>) -> Result<Value, String> {
        Ok(json!({ "echo": Value::Object(args) }))
    }
}

/// A tool whose dispatch never returns.
struct HangingTool;

#[async_trait]
impl ToolHandler for HangingTool {
    fn name(&self) -> &str {
        "hang"
    }

    fn description(&self) -> &str {
        "Never completes"
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Volatile
    }

    async fn run(&self, _args: Map<String, Value>) -> Result<Value, String> {
        futures_util::future::pending::<()>().await;
        unreachable!()
    }
}

fn call(id: &str, name: &str, arguments: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
        parsed: serde_json::from_str(arguments).ok(),
    }
}

fn assistant_with_calls(calls: Vec<ToolCall>) -> Message {
    Message {
        role: Role::Assistant,
        content: None,
        tool_calls: calls,
        tool_call_id: None,
    }
}

fn chunk(payload: Value) -> ChunkEvent {
    let parsed: ChatStreamResponse = serde_json::from_value(payload).unwrap();
    ChunkEvent::Chunk(parsed)
}

struct Harness {
    backend: Arc<ScriptedBackend>,
    engine: ConversationEngine,
    events: mpsc::UnboundedReceiver<EngineEvent>,
    cancel: CancellationToken,
}

fn harness(script: Vec<Script>, registry: ToolRegistry, max_iterations: u32) -> Harness {
    let backend = Arc::new(ScriptedBackend::new(script));
    let (tx, events) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let executor = ToolExecutor::new(
        Arc::new(registry),
        Arc::new(ToolCache::new(CachePolicy::default())),
    );
    let engine = ConversationEngine::new(
        Arc::clone(&backend) as Arc<dyn ChatBackend>,
        executor,
        tx,
        cancel.clone(),
        EngineSettings {
            model: "test-model".to_string(),
            streaming: false,
            max_iterations,
        },
    );
    Harness {
        backend,
        engine,
        events,
        cancel,
    }
}

fn echo_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool)).unwrap();
    registry
}

#[tokio::test]
async fn list_files_call_then_answer_completes_in_two_iterations() {
    let workspace = tempfile::TempDir::new().unwrap();
    std::fs::write(workspace.path().join("a.txt"), "a").unwrap();
    std::fs::write(workspace.path().join("b.txt"), "b").unwrap();

    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(ListFiles::new(workspace.path().to_path_buf())))
        .unwrap();

    let h = harness(
        vec![
            Script::Atomic(
                assistant_with_calls(vec![call("call_1", "list_files", "{}")]),
                None,
            ),
            Script::Atomic(Message::assistant("Two files: a.txt and b.txt."), None),
        ],
        registry,
        10,
    );

    let mut state = ConversationState::new();
    state.begin_turn("what files are here?");
    let outcome = h.engine.run_turn(&mut state).await;

    assert_eq!(outcome, Outcome::Done);
    assert_eq!(state.iterations, 2);
    assert_eq!(h.backend.request_count(), 2);

    // Log order: user, assistant(tool call), tool result, final assistant.
    let roles: Vec<Role> = state.log.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(state.log[2].tool_call_id.as_deref(), Some("call_1"));
    let listing: Value = serde_json::from_str(state.log[2].content.as_ref().unwrap()).unwrap();
    assert_eq!(listing["files"], json!(["a.txt", "b.txt"]));

    // The second request carried the tool result back to the model.
    let second = h.backend.request(1);
    assert_eq!(second[2], ("tool".to_string(), Some("call_1".to_string())));
    assert_eq!(
        state.final_assistant().unwrap().content.as_deref(),
        Some("Two files: a.txt and b.txt.")
    );
}

#[tokio::test]
async fn mixed_known_and_unknown_calls_resolve_in_request_order() {
    let h = harness(
        vec![
            Script::Atomic(
                assistant_with_calls(vec![
                    call("call_a", "imaginary_tool", "{}"),
                    call("call_b", "echo", r#"{"text": "hi"}"#),
                ]),
                None,
            ),
            Script::Atomic(Message::assistant("done"), None),
        ],
        echo_registry(),
        10,
    );

    let mut state = ConversationState::new();
    state.begin_turn("go");
    assert_eq!(h.engine.run_turn(&mut state).await, Outcome::Done);

    // Both calls produced exactly one result each, in request order.
    let tool_messages: Vec<&Message> =
        state.log.iter().filter(|m| m.role == Role::Tool).collect();
    assert_eq!(tool_messages.len(), 2);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_a"));
    assert_eq!(tool_messages[1].tool_call_id.as_deref(), Some("call_b"));

    let first: Value = serde_json::from_str(tool_messages[0].content.as_ref().unwrap()).unwrap();
    assert!(first["error"]
        .as_str()
        .unwrap()
        .contains("unknown tool: imaginary_tool"));
    let second: Value = serde_json::from_str(tool_messages[1].content.as_ref().unwrap()).unwrap();
    assert_eq!(second["echo"]["text"], json!("hi"));
}

#[tokio::test]
async fn iteration_bound_stops_a_looping_model() {
    let looping = || {
        Script::Atomic(
            assistant_with_calls(vec![call("call_n", "echo", r#"{"text": "again"}"#)]),
            None,
        )
    };
    let h = harness(vec![looping(), looping(), looping()], echo_registry(), 3);

    let mut state = ConversationState::new();
    state.begin_turn("loop forever");
    let outcome = h.engine.run_turn(&mut state).await;

    assert_eq!(outcome, Outcome::ToolLoopExceeded);
    assert_eq!(h.backend.request_count(), 3);
    // The partial log survives: three unanswered-then-resolved cycles.
    assert_eq!(
        state.log.iter().filter(|m| m.role == Role::Tool).count(),
        3
    );
    assert!(state.is_terminal());
}

#[tokio::test]
async fn streaming_delivery_assembles_content_and_usage() {
    let mut h = harness(
        vec![Script::Stream(vec![
            chunk(json!({"choices": [{"delta": {"content": "Hel"}}]})),
            chunk(json!({"choices": [{"delta": {"content": "lo."}}]})),
            chunk(json!({
                "choices": [{"delta": {}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3}
            })),
        ])],
        ToolRegistry::new(),
        10,
    );

    let mut state = ConversationState::new();
    state.begin_turn("hello?");
    assert_eq!(h.engine.run_turn(&mut state).await, Outcome::Done);
    assert_eq!(
        state.final_assistant().unwrap().content.as_deref(),
        Some("Hello.")
    );
    assert_eq!(state.usage.prompt_tokens, 12);
    assert_eq!(state.usage.completion_tokens, 3);

    let mut deltas = Vec::new();
    while let Ok(event) = h.events.try_recv() {
        if let EngineEvent::ContentDelta(delta) = event {
            deltas.push(delta);
        }
    }
    assert_eq!(deltas, vec!["Hel".to_string(), "lo.".to_string()]);
}

#[tokio::test]
async fn streamed_tool_call_fragments_drive_a_full_cycle() {
    let h = harness(
        vec![
            Script::Stream(vec![
                chunk(json!({"choices": [{"delta": {"tool_calls": [
                    {"index": 0, "id": "call_s", "type": "function",
                     "function": {"name": "echo", "arguments": ""}}
                ]}}]})),
                chunk(json!({"choices": [{"delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "{\"text\": "}}
                ]}}]})),
                chunk(json!({"choices": [{"delta": {"tool_calls": [
                    {"index": 0, "function": {"arguments": "\"split\"}"}}
                ]}}]})),
            ]),
            Script::Atomic(Message::assistant("echoed"), None),
        ],
        echo_registry(),
        10,
    );

    let mut state = ConversationState::new();
    state.begin_turn("stream a tool call");
    assert_eq!(h.engine.run_turn(&mut state).await, Outcome::Done);

    let tool_message = state.log.iter().find(|m| m.role == Role::Tool).unwrap();
    assert_eq!(tool_message.tool_call_id.as_deref(), Some("call_s"));
    let payload: Value = serde_json::from_str(tool_message.content.as_ref().unwrap()).unwrap();
    assert_eq!(payload["echo"]["text"], json!("split"));
}

#[tokio::test]
async fn cancellation_mid_stream_yields_cancelled_outcome() {
    let h = harness(
        vec![Script::StalledStream(vec![chunk(
            json!({"choices": [{"delta": {"content": "partial"}}]}),
        )])],
        ToolRegistry::new(),
        10,
    );

    let cancel = h.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let mut state = ConversationState::new();
    state.begin_turn("never finishes");
    let outcome = h.engine.run_turn(&mut state).await;

    assert_eq!(outcome, Outcome::Cancelled);
    assert_eq!(state.outcome, Some(Outcome::Cancelled));
    // The partial assistant message was abandoned, not logged.
    assert!(state.final_assistant().is_none());
}

#[tokio::test]
async fn cancellation_aborts_a_running_tool_dispatch() {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(HangingTool)).unwrap();
    let h = harness(
        vec![Script::Atomic(
            assistant_with_calls(vec![call("call_h", "hang", "{}")]),
            None,
        )],
        registry,
        10,
    );

    let cancel = h.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let mut state = ConversationState::new();
    state.begin_turn("run the slow tool");
    let outcome = h.engine.run_turn(&mut state).await;

    assert_eq!(outcome, Outcome::Cancelled);
    // The abandoned dispatch left no tool result in the log.
    assert!(state.log.iter().all(|m| m.role != Role::Tool));
}

#[tokio::test]
async fn all_failed_tool_calls_nudge_the_model_off_tools() {
    let h = harness(
        vec![
            Script::Atomic(
                assistant_with_calls(vec![call("call_x", "imaginary_tool", "{}")]),
                None,
            ),
            Script::Atomic(Message::assistant("sorry, no such tool"), None),
        ],
        echo_registry(),
        10,
    );

    let mut state = ConversationState::new();
    state.begin_turn("use a tool");
    assert_eq!(h.engine.run_turn(&mut state).await, Outcome::Done);

    // The second request carries an extra user message after the tool result.
    let second = h.backend.request(1);
    let roles: Vec<&str> = second.iter().map(|(role, _)| role.as_str()).collect();
    assert_eq!(roles, vec!["user", "assistant", "tool", "user"]);
}
