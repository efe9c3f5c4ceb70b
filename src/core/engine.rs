//! The conversation driver.
//!
//! One user turn may take several round trips against the model: the
//! assistant answers, or requests tool calls, whose results are appended
//! and sent back. The loop is bounded by `max_iterations` so a model that
//! keeps requesting tools cannot spin forever. Everything user-visible is
//! reported through [`EngineEvent`]s; the engine itself never prints.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::ChatRequest;
use crate::core::error::EngineError;
use crate::core::message::{ConversationState, Message, Outcome};
use crate::core::stream::{ChunkEvent, StreamAssembler};
use crate::core::transport::{ChatBackend, Delivery, StreamHandle};
use crate::tools::ToolExecutor;

/// Progress notifications emitted while a turn runs. Consumers render
/// these; the engine stays silent on stdout.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Incremental assistant text from a streaming delivery.
    ContentDelta(String),
    /// The transport is sleeping before (re)issuing a request.
    RateLimitWait {
        delay: Duration,
        consecutive_failures: u32,
    },
    ToolCallStarted {
        id: String,
        name: String,
    },
    ToolCallCompleted {
        id: String,
        name: String,
        ok: bool,
    },
    /// One request cycle finished; more may follow within the same turn.
    TurnCompleted {
        iteration: u32,
    },
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub model: String,
    pub streaming: bool,
    pub max_iterations: u32,
}

pub struct ConversationEngine {
    backend: Arc<dyn ChatBackend>,
    executor: ToolExecutor,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
    settings: EngineSettings,
}

impl ConversationEngine {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        executor: ToolExecutor,
        events: mpsc::UnboundedSender<EngineEvent>,
        cancel: CancellationToken,
        settings: EngineSettings,
    ) -> Self {
        Self {
            backend,
            executor,
            events,
            cancel,
            settings,
        }
    }

    fn build_request(&self, state: &ConversationState) -> ChatRequest {
        let registry = self.executor.registry();
        let (tools, tool_choice) = if registry.is_empty() {
            (None, None)
        } else {
            (Some(registry.definitions()), Some("auto".to_string()))
        };
        ChatRequest {
            model: self.settings.model.clone(),
            messages: state.wire_messages(),
            stream: self.settings.streaming,
            tools,
            tool_choice,
        }
    }

    /// Drives one user turn to completion. The caller has already pushed
    /// the user message onto `state`; on return `state.outcome` is set and
    /// the assistant's reply (if any) is the last assistant message in the
    /// log.
    pub async fn run_turn(&self, state: &mut ConversationState) -> Outcome {
        let outcome = self.drive(state).await;
        state.outcome = Some(outcome.clone());
        outcome
    }

    async fn drive(&self, state: &mut ConversationState) -> Outcome {
        loop {
            state.iterations += 1;
            if state.iterations > self.settings.max_iterations {
                info!(
                    max_iterations = self.settings.max_iterations,
                    "tool loop bound reached"
                );
                return Outcome::ToolLoopExceeded;
            }
            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            let delivery = match self.backend.request(self.build_request(state)).await {
                Ok(delivery) => delivery,
                Err(EngineError::Cancelled) => return Outcome::Cancelled,
                Err(error) => return Outcome::Failed(error.to_string()),
            };

            let message = match delivery {
                Delivery::Atomic { message, usage } => {
                    if let Some(usage) = usage {
                        state.usage.absorb(&usage);
                    }
                    message
                }
                Delivery::Stream(handle) => match self.consume_stream(handle).await {
                    Ok((message, usage)) => {
                        if let Some(usage) = usage {
                            state.usage.absorb(&usage);
                        }
                        message
                    }
                    Err(outcome) => return outcome,
                },
            };

            let calls = message.tool_calls.clone();
            state.push(message);
            let _ = self.events.send(EngineEvent::TurnCompleted {
                iteration: state.iterations,
            });

            if calls.is_empty() {
                return Outcome::Done;
            }

            for call in &calls {
                let _ = self.events.send(EngineEvent::ToolCallStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
            }

            // An interrupt must reach still-running dispatches too; results
            // of an abandoned batch never enter the log.
            let results = tokio::select! {
                results = self.executor.execute_turn(&calls) => results,
                () = self.cancel.cancelled() => return Outcome::Cancelled,
            };
            let all_failed = results.iter().all(|result| !result.ok);
            for (call, result) in calls.iter().zip(&results) {
                let _ = self.events.send(EngineEvent::ToolCallCompleted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    ok: result.ok,
                });
            }
            for result in results {
                state.push(result.into_message());
            }

            if all_failed {
                debug!("every tool call in the turn failed; nudging the model");
                state.push(Message::user(
                    "All requested tool calls failed. Report what went wrong \
                     and answer without further tool use.",
                ));
            }

            if self.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
        }
    }

    /// Consumes a streaming delivery into one assistant message, forwarding
    /// content deltas as they arrive. Cancellation mid-stream abandons the
    /// partial message.
    async fn consume_stream(
        &self,
        mut handle: StreamHandle,
    ) -> Result<(Message, Option<crate::api::Usage>), Outcome> {
        let mut assembler = StreamAssembler::new();
        loop {
            let event = tokio::select! {
                event = handle.next_event() => event,
                () = self.cancel.cancelled() => return Err(Outcome::Cancelled),
            };
            match event {
                Some(ChunkEvent::Chunk(chunk)) => {
                    if let Some(delta) = assembler.apply(chunk) {
                        let _ = self.events.send(EngineEvent::ContentDelta(delta));
                    }
                }
                Some(ChunkEvent::Error(description)) => {
                    return Err(Outcome::Failed(description));
                }
                Some(ChunkEvent::End) | None => break,
            }
        }
        Ok(assembler.finish())
    }
}
