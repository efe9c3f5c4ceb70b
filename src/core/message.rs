use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::{ChatMessage, ChatToolCall, ChatToolCallFunction, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// One entry in the conversation log. Immutable once appended; the log is
/// append-only and its order is significant.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Back-reference to the tool call this message answers (role = Tool).
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn to_wire(&self) -> ChatMessage {
        ChatMessage {
            role: self.role.as_str().to_string(),
            content: self.content.clone(),
            tool_call_id: self.tool_call_id.clone(),
            tool_calls: if self.tool_calls.is_empty() {
                None
            } else {
                Some(self.tool_calls.iter().map(ToolCall::to_wire).collect())
            },
        }
    }
}

/// A request from the model to invoke a named local function.
///
/// `arguments` holds the raw accumulated text exactly as the provider sent
/// it; `parsed` is filled once the assembler (or a repair pass) has turned
/// it into a JSON object. A call counts as resolved only once a matching
/// [`ToolResult`] exists in the log.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub parsed: Option<Map<String, Value>>,
}

impl ToolCall {
    pub fn to_wire(&self) -> ChatToolCall {
        ChatToolCall {
            id: self.id.clone(),
            kind: "function".to_string(),
            function: ChatToolCallFunction {
                name: self.name.clone(),
                arguments: self.arguments.clone(),
            },
        }
    }
}

/// Outcome of exactly one tool call. The payload is arbitrary structured
/// content on success and an error description otherwise.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub ok: bool,
    pub payload: Value,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, payload: Value) -> Self {
        Self {
            call_id: call_id.into(),
            ok: true,
            payload,
        }
    }

    pub fn error(call_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            ok: false,
            payload: serde_json::json!({ "error": description.into() }),
        }
    }

    /// Renders the result as the tool-role log message that resolves its
    /// originating call.
    pub fn into_message(self) -> Message {
        Message {
            role: Role::Tool,
            content: Some(self.payload.to_string()),
            tool_calls: Vec::new(),
            tool_call_id: Some(self.call_id),
        }
    }
}

/// Why a conversation stopped advancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Final assistant message with no pending tool calls.
    Done,
    ToolLoopExceeded,
    Cancelled,
    /// Transport or rate-limit exhaustion; the description mirrors the
    /// error surfaced to the caller.
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl UsageTotals {
    pub fn absorb(&mut self, usage: &Usage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
    }
}

/// Ordered message log plus driver bookkeeping for one turn-sequence.
///
/// Created per user turn-sequence and discarded (or handed to a collaborator)
/// once terminal. The driver appends, never rewrites.
#[derive(Debug, Default)]
pub struct ConversationState {
    pub log: Vec<Message>,
    pub iterations: u32,
    pub outcome: Option<Outcome>,
    pub usage: UsageTotals,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut state = Self::default();
        state.log.push(Message::system(prompt));
        state
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// Starts a fresh turn-sequence on an existing log: the previous
    /// outcome and iteration count are cleared, the user message appended.
    pub fn begin_turn(&mut self, user_input: impl Into<String>) {
        self.outcome = None;
        self.iterations = 0;
        self.log.push(Message::user(user_input));
    }

    pub fn push(&mut self, message: Message) {
        debug_assert!(self.outcome.is_none(), "appending to a terminal state");
        self.log.push(message);
    }

    pub fn wire_messages(&self) -> Vec<ChatMessage> {
        self.log.iter().map(Message::to_wire).collect()
    }

    /// Last assistant message, if the log ends with one.
    pub fn final_assistant(&self) -> Option<&Message> {
        self.log
            .iter()
            .rev()
            .find(|message| message.role == Role::Assistant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_wire_strings() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(Role::try_from(role.as_str()).unwrap(), role);
        }
        assert!(Role::try_from("narrator").is_err());
    }

    #[test]
    fn tool_result_message_carries_call_back_reference() {
        let result = ToolResult::success("call-7", serde_json::json!({"files": ["a.txt"]}));
        let message = result.into_message();
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call-7"));
        assert_eq!(message.content.as_deref(), Some(r#"{"files":["a.txt"]}"#));
    }

    #[test]
    fn error_result_wraps_description_in_error_payload() {
        let result = ToolResult::error("call-1", "unknown tool: frobnicate");
        assert!(!result.ok);
        assert_eq!(
            result.payload,
            serde_json::json!({"error": "unknown tool: frobnicate"})
        );
    }

    #[test]
    fn wire_message_omits_empty_tool_calls() {
        let message = Message::user("hello");
        let wire = message.to_wire();
        assert!(wire.tool_calls.is_none());
        assert_eq!(wire.role, "user");
    }

    #[test]
    fn wire_tool_call_round_trips() {
        let call = ToolCall {
            id: "c1".into(),
            name: "read_file".into(),
            arguments: r#"{"filename": "a.txt"}"#.into(),
            parsed: None,
        };
        let wire = call.to_wire();
        assert_eq!(wire.kind, "function");
        assert_eq!(wire.function.name, "read_file");
        assert_eq!(wire.function.arguments, call.arguments);
    }
}
