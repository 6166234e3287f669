//! Remedy daemon library - exposes modules for testing.

pub mod backoff;
pub mod catalog;
pub mod config_watch;
pub mod executor;
pub mod history;
pub mod intake;
pub mod notifier;
pub mod orchestrator;
pub mod routes;
pub mod server;
pub mod verifier;
