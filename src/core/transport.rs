//! Requests against the remote chat-completion service.
//!
//! One logical request takes one of two delivery paths. Non-streaming
//! requests use the buffered JSON path: the whole body is read and parsed
//! at once, which is the more reliable mechanism and the preferred one
//! whenever partial output is not needed. Streaming requests must use the
//! raw SSE path, because only that path exposes partial chunks. The split
//! is a design constraint, not an optimization.
//!
//! Every call is gated by the shared [`RateLimiter`]; 429 and 5xx responses
//! feed failures back into it and retry up to a ceiling.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ChatCompletion, ChatRequest, Usage};
use crate::core::engine::EngineEvent;
use crate::core::error::EngineError;
use crate::core::message::{Message, Role};
use crate::core::rate_limit::RateLimiter;
use crate::core::stream::{finish_tool_call, parse_sse_line, ChunkEvent, SseLine};
use crate::utils::url::construct_api_url;

/// What a single logical request produced.
pub enum Delivery {
    /// Complete message from the buffered path.
    Atomic {
        message: Message,
        usage: Option<Usage>,
    },
    /// Handle onto an incremental delivery; consume with an assembler.
    Stream(StreamHandle),
}

/// Receiving end of one incremental delivery. Single-pass and finite: once
/// the channel yields [`ChunkEvent::End`] (or closes) the stream is over.
pub struct StreamHandle {
    rx: mpsc::UnboundedReceiver<ChunkEvent>,
}

impl StreamHandle {
    pub fn new(rx: mpsc::UnboundedReceiver<ChunkEvent>) -> Self {
        Self { rx }
    }

    pub async fn next_event(&mut self) -> Option<ChunkEvent> {
        self.rx.recv().await
    }
}

/// The seam between the conversation driver and the wire. The HTTP
/// transport implements it for production; tests script it with synthetic
/// deliveries.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn request(&self, request: ChatRequest) -> Result<Delivery, EngineError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    limiter: Arc<Mutex<RateLimiter>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    cancel: CancellationToken,
    /// Per-call timeout, independent of any rate-limit wait.
    request_timeout: Duration,
    /// Ceiling on consecutive 429/5xx responses.
    rate_limit_attempts: u32,
    /// Ceiling on network-level failures (connect errors, timeouts).
    transport_attempts: u32,
}

impl HttpTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: String,
        limiter: Arc<Mutex<RateLimiter>>,
        events: mpsc::UnboundedSender<EngineEvent>,
        cancel: CancellationToken,
        request_timeout: Duration,
        rate_limit_attempts: u32,
        transport_attempts: u32,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            limiter,
            events,
            cancel,
            request_timeout,
            rate_limit_attempts,
            transport_attempts,
        }
    }

    async fn wait_for_limiter(&self) -> Result<(), EngineError> {
        let (wait, failures) = {
            let limiter = self.limiter.lock().expect("rate limiter mutex poisoned");
            (
                limiter.required_wait(Instant::now()),
                limiter.consecutive_failures(),
            )
        };
        if wait.is_zero() {
            return Ok(());
        }
        let _ = self.events.send(EngineEvent::RateLimitWait {
            delay: wait,
            consecutive_failures: failures,
        });
        tokio::select! {
            () = tokio::time::sleep(wait) => Ok(()),
            () = self.cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    fn spawn_stream_reader(&self, response: reqwest::Response) -> StreamHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = read_sse_stream(response, &tx) => {}
                () = cancel.cancelled() => {}
            }
        });
        StreamHandle::new(rx)
    }

    async fn parse_atomic(&self, response: reqwest::Response) -> Result<Delivery, String> {
        let completion = response
            .json::<ChatCompletion>()
            .await
            .map_err(|error| format!("response body did not parse: {error}"))?;

        let usage = completion.usage.clone();
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| "completion carried no choices".to_string())?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .iter()
            .map(|call| {
                finish_tool_call(
                    call.id.clone(),
                    call.function.name.clone(),
                    call.function.arguments.clone(),
                )
            })
            .collect();

        let message = Message {
            role: Role::Assistant,
            content: choice.message.content,
            tool_calls,
            tool_call_id: None,
        };
        Ok(Delivery::Atomic { message, usage })
    }
}

#[async_trait]
impl ChatBackend for HttpTransport {
    async fn request(&self, request: ChatRequest) -> Result<Delivery, EngineError> {
        let url = construct_api_url(&self.base_url, "chat/completions");
        let mut rate_failures = 0u32;
        let mut network_failures = 0u32;

        loop {
            self.wait_for_limiter().await?;
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let outcome = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .timeout(self.request_timeout)
                .json(&request)
                .send()
                .await;

            let response = match outcome {
                Ok(response) => response,
                Err(error) => {
                    network_failures += 1;
                    warn!(%error, attempt = network_failures, "request failed at network level");
                    if network_failures >= self.transport_attempts {
                        return Err(EngineError::Transport {
                            attempts: network_failures,
                            message: error.to_string(),
                        });
                    }
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 || status.is_server_error() {
                let hint = parse_retry_after(response.headers());
                rate_failures += 1;
                let last_wait = {
                    let mut limiter = self.limiter.lock().expect("rate limiter mutex poisoned");
                    limiter.record_failure(Instant::now(), hint);
                    limiter.current_delay()
                };
                debug!(
                    status = status.as_u16(),
                    attempt = rate_failures,
                    ?hint,
                    "rate limited or server error; backing off"
                );
                if rate_failures >= self.rate_limit_attempts {
                    return Err(EngineError::RateLimitExceeded {
                        attempts: rate_failures,
                        last_wait,
                    });
                }
                continue;
            }

            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<no body>".to_string());
                return Err(EngineError::Transport {
                    attempts: 1,
                    message: format_api_error(&body),
                });
            }

            self.limiter
                .lock()
                .expect("rate limiter mutex poisoned")
                .record_success(Instant::now());

            if request.stream {
                return Ok(Delivery::Stream(self.spawn_stream_reader(response)));
            }

            match self.parse_atomic(response).await {
                Ok(delivery) => return Ok(delivery),
                Err(reason) => {
                    // A 200 with an unusable body is retried like a network
                    // failure; exhaustion surfaces the parse failure.
                    network_failures += 1;
                    warn!(%reason, attempt = network_failures, "atomic response was unusable");
                    if network_failures >= self.transport_attempts {
                        return Err(EngineError::MalformedResponse(reason));
                    }
                }
            }
        }
    }
}

/// Reads the SSE body line by line, forwarding parsed chunk events. Lines
/// are split on newlines out of a growing byte buffer because chunk
/// boundaries do not align with line boundaries.
async fn read_sse_stream(response: reqwest::Response, tx: &mpsc::UnboundedSender<ChunkEvent>) {
    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(error) => {
                let _ = tx.send(ChunkEvent::Error(format!("stream read failed: {error}")));
                let _ = tx.send(ChunkEvent::End);
                return;
            }
        };
        buffer.extend_from_slice(&bytes);

        while let Some(newline) = memchr(b'\n', &buffer) {
            let line = match std::str::from_utf8(&buffer[..newline]) {
                Ok(line) => line.trim().to_string(),
                Err(error) => {
                    debug!(%error, "skipping non-UTF-8 stream line");
                    buffer.drain(..=newline);
                    continue;
                }
            };
            buffer.drain(..=newline);

            match parse_sse_line(&line) {
                SseLine::Ignored => {}
                SseLine::Chunk(chunk) => {
                    let _ = tx.send(ChunkEvent::Chunk(chunk));
                }
                SseLine::Unparsed(payload) => {
                    // Some providers interleave error objects with chunks;
                    // those end the delivery. Anything else malformed is
                    // dropped so one bad line cannot discard the content
                    // assembled so far.
                    if payload_carries_error(&payload) {
                        let _ = tx.send(ChunkEvent::Error(format_api_error(&payload)));
                        let _ = tx.send(ChunkEvent::End);
                        return;
                    }
                    debug!(%payload, "skipping unparseable stream line");
                }
                SseLine::Done => {
                    let _ = tx.send(ChunkEvent::End);
                    return;
                }
            }
        }
    }

    // Connection ended without an explicit [DONE]; the delivery is still
    // finite and complete as far as the assembler is concerned.
    let _ = tx.send(ChunkEvent::End);
}

/// True when a `data:` payload that failed to parse as a chunk is actually
/// an error object from the provider.
fn payload_carries_error(payload: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(payload)
        .map(|value| value.get("error").is_some())
        .unwrap_or(false)
}

/// Parses a `Retry-After` header, which may be an integer number of seconds
/// or an HTTP date.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (date.with_timezone(&chrono::Utc) - chrono::Utc::now())
        .to_std()
        .ok()
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    value
        .pointer("/error/message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned)
        })
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Renders an error body from the service into a readable description,
/// pulling out the provider's message field when one exists.
pub fn format_api_error(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "API error: <empty body>".to_string();
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&value) {
            if !summary.is_empty() {
                return format!("API error: {summary}");
            }
        }
    }
    let mut flat = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() > 400 {
        flat.truncate(400);
        flat.push_str("...");
    }
    format!("API error: {flat}")
}
