//! Bridge Relayer - Library interface
//!
//! Re-exports internal modules for use in integration tests and the binary.

pub mod api;
pub mod auth;
pub mod bounded_cache;
pub mod chain;
pub mod codec;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod store;
pub mod submitter;
pub mod types;
pub mod watcher;
