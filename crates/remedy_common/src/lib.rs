//! Shared types for the Remedy self-healing engine.
//!
//! Used by both the daemon (`remedyd`) and the CLI client (`remedyctl`):
//! the fault/attempt data model, the action catalog entry type, the daemon
//! configuration, and the HTTP API request/response shapes.

pub mod api;
pub mod config;
pub mod types;

pub use api::{
    FaultDetail, HealingStats, HealthResponse, ManualHealResponse, ReportRequest, ReportResponse,
    ResolveRequest,
};
pub use config::{Config, VerifyPlan};
pub use types::{
    ActionDefinition, AttemptOutcome, Capability, Fault, FaultCategory, FaultKey, FaultStatus,
    HealingAttempt, NotifyEvent, Severity, VerifyStatus,
};

/// Crate version, shared by both binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
