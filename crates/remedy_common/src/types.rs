//! Core data model: faults, healing attempts, and remediation actions.
//!
//! A fault is identified by its (category, resource) key. Two reports with
//! the same key refer to the same fault; the daemon never holds more than
//! one record per key.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum stored length for evidence and attempt diagnostics.
pub const MAX_DIAGNOSTIC_LEN: usize = 4096;

/// Fault category reported by a detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultCategory {
    /// A supervised service is not running
    ServiceDown,
    /// A container/workload unit has crashed or stopped
    ContainerCrash,
    /// CPU, memory, or disk exhaustion
    ResourceExhaustion,
    /// A network path (gateway, peer) is unreachable
    NetworkBroken,
    /// Detector-defined category with no built-in verification
    Custom,
}

impl FaultCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceDown => "service-down",
            Self::ContainerCrash => "container-crash",
            Self::ResourceExhaustion => "resource-exhaustion",
            Self::NetworkBroken => "network-broken",
            Self::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "service-down" => Some(Self::ServiceDown),
            "container-crash" => Some(Self::ContainerCrash),
            "resource-exhaustion" => Some(Self::ResourceExhaustion),
            "network-broken" => Some(Self::NetworkBroken),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a reported fault.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Lifecycle status of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultStatus {
    /// Detected, waiting for an attempt (or for manual action in
    /// report-only mode)
    Open,
    /// A healing attempt is in flight
    Healing,
    /// Verified resolved; terminal for this occurrence
    Healed,
    /// Retry budget exhausted; needs an operator
    Escalated,
    /// Excluded from automation by an operator
    Suppressed,
}

impl FaultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Healing => "HEALING",
            Self::Healed => "HEALED",
            Self::Escalated => "ESCALATED",
            Self::Suppressed => "SUPPRESSED",
        }
    }

    /// Terminal for the current fault occurrence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Healed | Self::Escalated)
    }
}

/// Fault identity: (category, resource).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaultKey {
    pub category: FaultCategory,
    pub resource: String,
}

impl FaultKey {
    pub fn new(category: FaultCategory, resource: impl Into<String>) -> Self {
        Self {
            category,
            resource: resource.into(),
        }
    }
}

impl fmt::Display for FaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.resource)
    }
}

/// A detected fault and its current state-machine position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fault {
    pub key: FaultKey,
    pub severity: Severity,
    /// Bounded detector-supplied context (log excerpt, threshold reading)
    pub evidence: String,
    pub first_detected: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: FaultStatus,
    /// Attempts consumed in the current escalation cycle
    pub attempts: u32,
    /// Start of the current escalation cycle (attempt-window accounting)
    pub cycle_started: DateTime<Utc>,
    /// Earliest time the next attempt may start; None means immediately
    pub next_retry: Option<DateTime<Utc>>,
    pub last_outcome: Option<AttemptOutcome>,
    /// Whether the one-shot report-only notification went out already
    #[serde(default)]
    pub report_only_notified: bool,
}

impl Fault {
    pub fn new(key: FaultKey, severity: Severity, evidence: String) -> Self {
        let now = Utc::now();
        Self {
            key,
            severity,
            evidence: truncate(evidence),
            first_detected: now,
            last_seen: now,
            status: FaultStatus::Open,
            attempts: 0,
            cycle_started: now,
            next_retry: None,
            last_outcome: None,
            report_only_notified: false,
        }
    }

    /// Refresh from a repeated report. Never touches the attempt counter.
    pub fn refresh(&mut self, severity: Severity, evidence: String) {
        self.last_seen = Utc::now();
        self.severity = self.severity.max(severity);
        if !evidence.is_empty() {
            self.evidence = truncate(evidence);
        }
    }

    /// Begin a fresh escalation cycle (after a Healed fault reopens or an
    /// operator resets an Escalated one).
    pub fn reopen(&mut self, severity: Severity, evidence: String) {
        let now = Utc::now();
        self.severity = severity;
        if !evidence.is_empty() {
            self.evidence = truncate(evidence);
        }
        self.last_seen = now;
        self.status = FaultStatus::Open;
        self.attempts = 0;
        self.cycle_started = now;
        self.next_retry = None;
        self.last_outcome = None;
        self.report_only_notified = false;
    }
}

/// Outcome of one healing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    /// Verifier confirmed the fault resolved
    Success,
    /// Remediation command failed (or could not be invoked)
    Failed,
    /// Remediation command hit its declared timeout
    TimedOut,
    /// Command completed but verification did not confirm resolution
    VerificationFailed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
            Self::VerificationFailed => "verification-failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "timed-out" => Some(Self::TimedOut),
            "verification-failed" => Some(Self::VerificationFailed),
            _ => None,
        }
    }
}

/// One bounded try at resolving a fault. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingAttempt {
    pub id: Uuid,
    pub key: FaultKey,
    pub action: String,
    /// 1-based, monotonic per fault cycle
    pub sequence: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub diagnostic: String,
}

impl HealingAttempt {
    pub fn new(
        key: FaultKey,
        action: impl Into<String>,
        sequence: u32,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        diagnostic: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            action: action.into(),
            sequence,
            started_at,
            ended_at: Utc::now(),
            outcome,
            diagnostic: truncate(diagnostic),
        }
    }
}

/// Capability class of a remediation action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Service,
    Container,
    Resource,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Container => "container",
            Self::Resource => "resource",
        }
    }
}

/// A named, parameterized remediation action. Immutable after catalog load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    pub capability: Capability,
    /// Shell command template; `{resource}` and `{param}` placeholders are
    /// substituted before execution
    pub command: String,
    /// Default parameter values, overridable per invocation
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Hard execution timeout
    pub timeout_secs: u64,
    /// Safe to repeat if the previous run's effect is unknown
    pub idempotent: bool,
    /// Lower runs first within a category
    pub priority: u8,
}

impl ActionDefinition {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Result of re-checking a fault condition after remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyStatus {
    Resolved,
    StillFaulty,
    /// The check itself errored; retried like StillFaulty but recorded
    /// distinctly
    Indeterminate,
}

/// Human-facing events emitted by the orchestrator. Delivery is
/// best-effort and never blocks healing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum NotifyEvent {
    AttemptStarted {
        key: FaultKey,
        action: String,
        sequence: u32,
        timestamp: DateTime<Utc>,
    },
    Healed {
        key: FaultKey,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    Escalated {
        key: FaultKey,
        attempts: u32,
        last_diagnostic: String,
        timestamp: DateTime<Utc>,
    },
    AutoExecuteDisabled {
        key: FaultKey,
        timestamp: DateTime<Utc>,
    },
}

impl NotifyEvent {
    pub fn key(&self) -> &FaultKey {
        match self {
            Self::AttemptStarted { key, .. }
            | Self::Healed { key, .. }
            | Self::Escalated { key, .. }
            | Self::AutoExecuteDisabled { key, .. } => key,
        }
    }

    /// One-line human rendering for logs and webhook fallback text.
    pub fn summary(&self) -> String {
        match self {
            Self::AttemptStarted {
                key,
                action,
                sequence,
                ..
            } => format!("healing attempt {} started for {} using {}", sequence, key, action),
            Self::Healed { key, attempts, .. } => {
                format!("{} healed after {} attempt(s)", key, attempts)
            }
            Self::Escalated { key, attempts, .. } => format!(
                "{} ESCALATED after {} failed attempt(s); manual intervention required",
                key, attempts
            ),
            Self::AutoExecuteDisabled { key, .. } => format!(
                "{} detected but auto-execute is disabled; reporting only",
                key
            ),
        }
    }

    /// Escalations warrant louder delivery than routine progress.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::Escalated { .. })
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_DIAGNOSTIC_LEN {
        let mut cut = MAX_DIAGNOSTIC_LEN;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}
