//! Incremental response assembly.
//!
//! The transport's streaming path delivers SSE lines; this module turns them
//! into chunk events, forwards content deltas as they arrive, and buffers
//! indexed tool-call fragments until the provider signals completion. The
//! name of a call usually arrives in its first fragment; the argument text
//! arrives incrementally and may split at any byte boundary, so it is only
//! parsed once the stream finishes.

use serde_json::{Map, Value};
use tracing::debug;

use crate::api::{ChatStreamResponse, ChatToolCallDelta, Usage};
use crate::core::message::{Message, Role, ToolCall};

/// One unit of an incremental delivery, as produced by the transport reader
/// task and consumed by [`StreamAssembler`].
#[derive(Debug)]
pub enum ChunkEvent {
    /// A parsed provider chunk.
    Chunk(ChatStreamResponse),
    /// A provider-reported error payload; ends the stream.
    Error(String),
    /// Explicit finish signal (`[DONE]`) or connection end.
    End,
}

/// Outcome of classifying one SSE line.
pub enum SseLine {
    /// Not a data line, or an empty keep-alive; nothing to do.
    Ignored,
    Done,
    Chunk(ChatStreamResponse),
    /// A `data:` payload that did not parse as a chunk. The raw text is
    /// carried so the transport can tell provider error objects apart from
    /// line noise to skip.
    Unparsed(String),
}

pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
        return SseLine::Ignored;
    };
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    if payload.trim().is_empty() {
        return SseLine::Ignored;
    }
    match serde_json::from_str::<ChatStreamResponse>(payload) {
        Ok(chunk) => SseLine::Chunk(chunk),
        Err(_) => SseLine::Unparsed(payload.to_string()),
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Reconstructs a complete assistant message from chunk events.
///
/// `apply` returns any content delta for immediate display; the assembled
/// message is produced once by [`StreamAssembler::finish`]. The event
/// sequence is single-pass: chunks are folded in as they arrive and cannot
/// be replayed.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    content: String,
    calls: Vec<PartialToolCall>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one chunk into the accumulated state, returning the content
    /// delta (if any) for the display collaborator.
    pub fn apply(&mut self, chunk: ChatStreamResponse) -> Option<String> {
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let choice = chunk.choices.into_iter().next()?;
        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }

        if let Some(fragments) = choice.delta.tool_calls {
            for fragment in fragments {
                self.apply_fragment(fragment);
            }
        }

        match choice.delta.content {
            Some(delta) if !delta.is_empty() => {
                self.content.push_str(&delta);
                Some(delta)
            }
            _ => None,
        }
    }

    fn apply_fragment(&mut self, fragment: ChatToolCallDelta) {
        let Some(index) = fragment.index else {
            debug!("dropping tool-call fragment without an index");
            return;
        };
        let index = index as usize;
        while self.calls.len() <= index {
            self.calls.push(PartialToolCall::default());
        }
        let slot = &mut self.calls[index];
        if let Some(id) = fragment.id {
            slot.id = id;
        }
        if let Some(function) = fragment.function {
            if let Some(name) = function.name {
                slot.name = name;
            }
            if let Some(arguments) = function.arguments {
                slot.arguments.push_str(&arguments);
            }
        }
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Produces the assembled assistant message. Buffered argument text is
    /// parsed here, after the terminal chunk, never mid-stream.
    pub fn finish(self) -> (Message, Option<Usage>) {
        let tool_calls = self
            .calls
            .into_iter()
            .filter(|call| !(call.id.is_empty() && call.name.is_empty()))
            .map(|call| finish_tool_call(call.id, call.name, call.arguments))
            .collect();

        let message = Message {
            role: Role::Assistant,
            content: if self.content.is_empty() {
                None
            } else {
                Some(self.content)
            },
            tool_calls,
            tool_call_id: None,
        };
        (message, self.usage)
    }
}

/// Finalizes one tool call from its accumulated raw argument text.
///
/// `parsed` stays `None` when the text is irrecoverably malformed; the
/// executor then answers the call with an error result instead of the whole
/// turn failing.
pub fn finish_tool_call(id: String, name: String, arguments: String) -> ToolCall {
    let parsed = match parse_arguments(&arguments) {
        Ok(map) => Some(map),
        Err(reason) => {
            debug!(call_id = %id, tool = %name, %reason, "tool call arguments did not parse");
            None
        }
    };
    ToolCall {
        id,
        name,
        arguments,
        parsed,
    }
}

/// Parses tool-call argument text into a JSON object, tolerating the
/// malformed shapes providers actually emit.
///
/// Empty text means "no arguments". When a strict parse fails (trailing
/// garbage, two concatenated objects, noise before the payload), the first
/// balanced top-level object is extracted and parsed instead. Only then is
/// the text declared irrecoverable.
pub fn parse_arguments(raw: &str) -> Result<Map<String, Value>, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => return Ok(map),
        Ok(other) => {
            return Err(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))
        }
        Err(_) => {}
    }

    if let Some(candidate) = first_balanced_object(trimmed) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
            debug!(
                discarded = trimmed.len() - candidate.len(),
                "recovered tool arguments from malformed JSON"
            );
            return Ok(map);
        }
    }

    Err("arguments are not valid JSON".to_string())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Finds the first balanced `{...}` span, honoring string literals and
/// escape sequences so braces inside strings do not count.
fn first_balanced_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&byte| byte == b'{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChatResponseDelta, ChatStreamChoice, ChatToolCallFunctionDelta};

    fn content_chunk(text: &str) -> ChatStreamResponse {
        ChatStreamResponse {
            choices: vec![ChatStreamChoice {
                delta: ChatResponseDelta {
                    content: Some(text.to_string()),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    fn fragment_chunk(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> ChatStreamResponse {
        ChatStreamResponse {
            choices: vec![ChatStreamChoice {
                delta: ChatResponseDelta {
                    content: None,
                    tool_calls: Some(vec![ChatToolCallDelta {
                        index: Some(index),
                        id: id.map(str::to_string),
                        kind: Some("function".to_string()),
                        function: Some(ChatToolCallFunctionDelta {
                            name: name.map(str::to_string),
                            arguments: arguments.map(str::to_string),
                        }),
                    }]),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    #[test]
    fn parse_sse_line_handles_spacing_variants() {
        assert!(matches!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#),
            SseLine::Chunk(_)
        ));
        assert!(matches!(
            parse_sse_line(r#"data:{"choices":[{"delta":{"content":"World"}}]}"#),
            SseLine::Chunk(_)
        ));
        assert!(matches!(parse_sse_line("data: [DONE]"), SseLine::Done));
        assert!(matches!(parse_sse_line("data:[DONE]"), SseLine::Done));
        assert!(matches!(parse_sse_line(": keep-alive"), SseLine::Ignored));
        assert!(matches!(parse_sse_line(""), SseLine::Ignored));
        assert!(matches!(
            parse_sse_line(r#"data: {"error":{"message":"boom"}}"#),
            SseLine::Unparsed(_)
        ));
    }

    #[test]
    fn chunk_events_are_debug_renderable() {
        let event = ChunkEvent::Chunk(content_chunk("Hi"));
        assert!(format!("{event:?}").contains("Hi"));
    }

    #[test]
    fn content_deltas_are_forwarded_and_accumulated() {
        let mut assembler = StreamAssembler::new();
        assert_eq!(assembler.apply(content_chunk("Hel")), Some("Hel".to_string()));
        assert_eq!(assembler.apply(content_chunk("lo")), Some("lo".to_string()));

        let (message, _) = assembler.finish();
        assert_eq!(message.content.as_deref(), Some("Hello"));
        assert!(message.tool_calls.is_empty());
    }

    #[test]
    fn arguments_split_at_arbitrary_byte_boundaries_reassemble() {
        let full = r#"{"path": "a.txt"}"#;
        let direct = parse_arguments(full).unwrap();

        // Every split point of the argument string must reconstruct the
        // same mapping as parsing the unsplit string.
        for split in 1..full.len() {
            let mut assembler = StreamAssembler::new();
            let _ = assembler.apply(fragment_chunk(0, Some("call-1"), Some("read_file"), None));
            let _ = assembler.apply(fragment_chunk(0, None, None, Some(&full[..split])));
            let _ = assembler.apply(fragment_chunk(0, None, None, Some(&full[split..])));

            let (message, _) = assembler.finish();
            let call = &message.tool_calls[0];
            assert_eq!(call.name, "read_file");
            assert_eq!(call.arguments, full);
            assert_eq!(call.parsed.as_ref(), Some(&direct), "split at {split}");
        }
    }

    #[test]
    fn interleaved_indexed_fragments_stay_separate() {
        let mut assembler = StreamAssembler::new();
        let _ = assembler.apply(fragment_chunk(0, Some("a"), Some("read_file"), Some("{\"filename\":")));
        let _ = assembler.apply(fragment_chunk(1, Some("b"), Some("list_files"), Some("{}")));
        let _ = assembler.apply(fragment_chunk(0, None, None, Some("\"x.txt\"}")));

        let (message, _) = assembler.finish();
        assert_eq!(message.tool_calls.len(), 2);
        assert_eq!(message.tool_calls[0].id, "a");
        assert_eq!(
            message.tool_calls[0].parsed.as_ref().unwrap()["filename"],
            Value::String("x.txt".to_string())
        );
        assert_eq!(message.tool_calls[1].id, "b");
        assert!(message.tool_calls[1].parsed.as_ref().unwrap().is_empty());
    }

    #[test]
    fn concatenated_objects_recover_first() {
        let parsed = parse_arguments(r#"{"path": "a.txt"}{"path": "b.txt"}"#).unwrap();
        assert_eq!(parsed["path"], Value::String("a.txt".to_string()));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_recovery() {
        let parsed = parse_arguments(r#"{"content": "fn main() {}"} trailing"#).unwrap();
        assert_eq!(parsed["content"], Value::String("fn main() {}".to_string()));

        let parsed = parse_arguments(r#"{"content": "escaped \" {"} x"#).unwrap();
        assert_eq!(parsed["content"], Value::String("escaped \" {".to_string()));
    }

    #[test]
    fn truncated_arguments_are_irrecoverable_not_fatal() {
        let call = finish_tool_call(
            "call-1".to_string(),
            "read_file".to_string(),
            r#"{"filename": "a."#.to_string(),
        );
        assert!(call.parsed.is_none());
        assert_eq!(call.arguments, r#"{"filename": "a."#);
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        assert!(parse_arguments("[1, 2, 3]").is_err());
        assert!(parse_arguments("\"just a string\"").is_err());
    }

    #[test]
    fn empty_arguments_mean_no_arguments() {
        assert!(parse_arguments("").unwrap().is_empty());
        assert!(parse_arguments("   ").unwrap().is_empty());
    }

    #[test]
    fn finish_reason_and_usage_are_captured() {
        let mut assembler = StreamAssembler::new();
        let chunk = ChatStreamResponse {
            choices: vec![ChatStreamChoice {
                delta: ChatResponseDelta {
                    content: None,
                    tool_calls: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 34,
            }),
        };
        let _ = assembler.apply(chunk);
        assert_eq!(assembler.finish_reason(), Some("stop"));
        let (_, usage) = assembler.finish();
        assert_eq!(usage.unwrap().completion_tokens, 34);
    }
}
