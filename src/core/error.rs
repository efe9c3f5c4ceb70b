//! Engine error taxonomy.
//!
//! Only these variants abort a conversation. Everything recoverable
//! (malformed chunks, invalid tool arguments, handler failures) is folded
//! into the message log as error-bearing tool results so the model can see
//! and react to it on the next turn.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Network or HTTP failure that survived every retry.
    #[error("transport failed after {attempts} attempt(s): {message}")]
    Transport { attempts: u32, message: String },

    /// Retry ceiling exhausted while the server kept returning 429/5xx.
    /// Carries the last computed wait for diagnostics.
    #[error(
        "rate limit retries exhausted after {attempts} attempt(s); last wait was {last_wait:?}"
    )]
    RateLimitExceeded { attempts: u32, last_wait: Duration },

    /// The user interrupted an in-flight turn.
    #[error("conversation cancelled")]
    Cancelled,

    /// A response body with no usable content at all, e.g. an atomic
    /// completion carrying zero choices. Per-chunk parse failures never
    /// raise this; they degrade locally inside the assembler.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}
