//! Request/response shapes for the daemon's HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Fault, FaultCategory, HealingAttempt, Severity};

/// Inbound fault report from a detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRequest {
    pub category: FaultCategory,
    pub resource: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub evidence: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    /// Stable identity: "category/resource"
    pub fault_id: String,
}

/// A collaborator observed the condition cleared on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub category: FaultCategory,
    pub resource: String,
}

/// Fault plus its attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultDetail {
    pub fault: Fault,
    pub attempts: Vec<HealingAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualHealResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Windowed healing statistics derived from the attempt history store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealingStats {
    pub window_secs: u64,
    pub total_attempts: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub escalated_count: u64,
    pub success_rate_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub version: String,
    pub uptime_seconds: u64,
    pub enabled: bool,
    pub auto_execute: bool,
    pub open_faults: usize,
    pub timestamp: DateTime<Utc>,
}
