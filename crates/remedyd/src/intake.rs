//! Fault Intake - the inbox through which collaborators report faults.
//!
//! Reporting only enqueues a state-machine event; remediation never happens
//! here. The same (category, resource) reported while a fault is already
//! Open or Healing refreshes it without restarting the retry counter -- the
//! orchestrator applies that rule when it drains the queue.

use remedy_common::{FaultCategory, FaultKey, Severity};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events drained by the orchestrator scan loop.
#[derive(Debug, Clone)]
pub enum IntakeEvent {
    Report {
        key: FaultKey,
        severity: Severity,
        evidence: String,
    },
    /// A collaborator independently confirmed the condition cleared
    Resolved { key: FaultKey },
}

/// Inbound handle given to detectors and the HTTP layer.
#[derive(Clone)]
pub struct FaultIntake {
    tx: mpsc::UnboundedSender<IntakeEvent>,
}

impl FaultIntake {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<IntakeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report a fault condition. Returns the stable fault identity.
    pub fn report(
        &self,
        category: FaultCategory,
        resource: impl Into<String>,
        severity: Severity,
        evidence: impl Into<String>,
    ) -> FaultKey {
        let key = FaultKey::new(category, resource);
        debug!("Intake: report {} (severity {})", key, severity.as_str());
        if self
            .tx
            .send(IntakeEvent::Report {
                key: key.clone(),
                severity,
                evidence: evidence.into(),
            })
            .is_err()
        {
            warn!("Intake channel closed, report for {} dropped", key);
        }
        key
    }

    /// Short-circuit a fault to Healed without an orchestrated attempt.
    pub fn report_resolved(&self, category: FaultCategory, resource: impl Into<String>) -> FaultKey {
        let key = FaultKey::new(category, resource);
        debug!("Intake: resolved {}", key);
        if self
            .tx
            .send(IntakeEvent::Resolved { key: key.clone() })
            .is_err()
        {
            warn!("Intake channel closed, resolution for {} dropped", key);
        }
        key
    }
}
