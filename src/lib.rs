//! Parley is a command-line chat client for OpenAI-compatible AI APIs with
//! local tool execution: the model can read and write workspace files, list
//! directories, run an allowlisted shell command, and search the web, all
//! within a bounded tool-call loop.
//!
//! The crate is organized around a conversation engine (`core::engine`)
//! that drives requests through a transport seam (`core::transport`),
//! assembles streamed responses (`core::stream`), and dispatches tool calls
//! through a registry (`tools`) with caching and rate-limit backoff.

pub mod api;
pub mod cli;
pub mod core;
pub mod tools;
pub mod utils;
