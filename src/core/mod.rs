pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod rate_limit;
pub mod stream;
pub mod transport;
