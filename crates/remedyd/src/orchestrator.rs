//! Orchestrator - the per-fault healing state machine.
//!
//! Owns the fault map and drives each fault through
//! Open -> Diagnosing -> Executing -> Verifying -> {Healed | Open(retry) |
//! Escalated}. Exactly one state-machine run is active per fault identity;
//! a worker semaphore bounds parallel remediation across faults; per-fault
//! attempts are strictly sequential while different faults proceed
//! independently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use remedy_common::{
    AttemptOutcome, Fault, FaultKey, FaultStatus, HealingAttempt, NotifyEvent, Severity,
    VerifyStatus,
};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::catalog::ActionCatalog;
use crate::config_watch::{snapshot, SharedConfig};
use crate::executor::ActionRunner;
use crate::history::AttemptHistory;
use crate::intake::IntakeEvent;
use crate::notifier::Notifier;
use crate::verifier::FaultVerifier;

/// Pseudo-action name recorded when the orchestrator itself fails.
const INTERNAL_ACTION: &str = "orchestrator-internal";

/// Interval between retention pruning passes.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// The healing engine. Shared via `Arc`.
pub struct Engine {
    config: SharedConfig,
    catalog: Arc<ActionCatalog>,
    runner: Arc<dyn ActionRunner>,
    verifier: Arc<dyn FaultVerifier>,
    history: Arc<AttemptHistory>,
    notifier: Notifier,
    faults: RwLock<HashMap<FaultKey, Fault>>,
    /// Identity keys with a state-machine run currently active
    in_flight: StdMutex<HashSet<FaultKey>>,
    workers: Arc<Semaphore>,
}

impl Engine {
    pub fn new(
        config: SharedConfig,
        catalog: Arc<ActionCatalog>,
        runner: Arc<dyn ActionRunner>,
        verifier: Arc<dyn FaultVerifier>,
        history: Arc<AttemptHistory>,
        notifier: Notifier,
        worker_limit: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            catalog,
            runner,
            verifier,
            history,
            notifier,
            faults: RwLock::new(HashMap::new()),
            in_flight: StdMutex::new(HashSet::new()),
            workers: Arc::new(Semaphore::new(worker_limit.max(1))),
        })
    }

    pub fn history(&self) -> &AttemptHistory {
        &self.history
    }

    // ------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------

    /// Apply one intake event to the fault map. Never starts remediation
    /// directly; the scan loop picks up due faults afterwards.
    pub async fn handle_event(&self, event: IntakeEvent) {
        match event {
            IntakeEvent::Report {
                key,
                severity,
                evidence,
            } => self.apply_report(key, severity, evidence).await,
            IntakeEvent::Resolved { key } => self.apply_resolved(key).await,
        }
    }

    async fn apply_report(&self, key: FaultKey, severity: Severity, evidence: String) {
        let mut faults = self.faults.write().await;
        match faults.get_mut(&key) {
            Some(fault) => match fault.status {
                // Same identity while active: refresh only, never a second
                // record or a reset retry counter
                FaultStatus::Open | FaultStatus::Healing | FaultStatus::Suppressed => {
                    debug!("Fault {} re-reported, refreshing", key);
                    fault.refresh(severity, evidence);
                }
                // A healed fault that recurs starts a fresh cycle
                FaultStatus::Healed => {
                    info!("Fault {} recurred after heal, starting new cycle", key);
                    fault.reopen(severity, evidence);
                }
                // Escalated stays escalated until an operator resets it
                FaultStatus::Escalated => {
                    debug!("Fault {} re-reported while escalated", key);
                    fault.last_seen = Utc::now();
                }
            },
            None => {
                info!("New fault: {} (severity {})", key, severity.as_str());
                faults.insert(key.clone(), Fault::new(key, severity, evidence));
            }
        }
    }

    async fn apply_resolved(&self, key: FaultKey) {
        let mut faults = self.faults.write().await;
        let Some(fault) = faults.get_mut(&key) else {
            debug!("Resolution for unknown fault {}, ignored", key);
            return;
        };
        if fault.status == FaultStatus::Healed {
            return;
        }
        info!("Fault {} resolved externally", key);
        fault.status = FaultStatus::Healed;
        fault.next_retry = None;
        fault.last_seen = Utc::now();
        let attempts = fault.attempts;
        drop(faults);

        self.notifier.send(NotifyEvent::Healed {
            key,
            attempts,
            timestamp: Utc::now(),
        });
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Start a heal cycle for every fault whose backoff timer has expired.
    /// Returns the spawned tasks; the scan loop detaches them, tests await
    /// them for determinism.
    pub async fn advance_due(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let cfg = snapshot(&self.config).await;
        let now = Utc::now();

        let due: Vec<FaultKey> = {
            let faults = self.faults.read().await;
            faults
                .values()
                .filter(|f| {
                    f.status == FaultStatus::Open
                        && f.next_retry.map_or(true, |t| t <= now)
                })
                .map(|f| f.key.clone())
                .collect()
        };

        let mut handles = Vec::new();
        for key in due {
            if self.is_in_flight(&key) {
                continue;
            }

            // Kill switch: nothing runs, nothing is announced
            if !cfg.healing.enabled {
                continue;
            }

            // Report-only mode: surface the fault once, run nothing
            if !cfg.healing.auto_execute {
                let mut faults = self.faults.write().await;
                if let Some(fault) = faults.get_mut(&key) {
                    if !fault.report_only_notified {
                        fault.report_only_notified = true;
                        drop(faults);
                        self.notifier.send(NotifyEvent::AutoExecuteDisabled {
                            key,
                            timestamp: Utc::now(),
                        });
                    }
                }
                continue;
            }

            let engine = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                engine.heal_cycle(key, false).await;
            }));
        }
        handles
    }

    /// Force an immediate Diagnosing transition, bypassing the backoff
    /// timer but not the attempt budget. Rejections are synchronous with a
    /// reason (policy violations never change state).
    pub async fn trigger_manual_heal(
        self: &Arc<Self>,
        key: &FaultKey,
    ) -> Result<JoinHandle<()>, String> {
        let cfg = snapshot(&self.config).await;
        if !cfg.healing.enabled {
            return Err("healing is disabled (healing.enabled = false)".to_string());
        }

        {
            let mut faults = self.faults.write().await;
            let fault = faults
                .get_mut(key)
                .ok_or_else(|| format!("unknown fault {}", key))?;
            match fault.status {
                FaultStatus::Healed => return Err("fault is already healed".to_string()),
                FaultStatus::Escalated => {
                    return Err("attempt budget exhausted; reset the fault first".to_string())
                }
                FaultStatus::Suppressed => return Err("fault is suppressed".to_string()),
                FaultStatus::Healing => {
                    return Err("a healing attempt is already in flight".to_string())
                }
                FaultStatus::Open => {
                    if fault.attempts >= cfg.healing.max_attempts_per_fault {
                        return Err("attempt budget exhausted; reset the fault first".to_string());
                    }
                    fault.next_retry = None;
                }
            }
        }

        if self.is_in_flight(key) {
            return Err("a healing attempt is already in flight".to_string());
        }

        info!("Manual heal triggered for {}", key);
        let engine = Arc::clone(self);
        let key = key.clone();
        Ok(tokio::spawn(async move {
            engine.heal_cycle(key, true).await;
        }))
    }

    /// Grant an Escalated fault a fresh attempt budget.
    pub async fn reset_fault(&self, key: &FaultKey) -> Result<(), String> {
        let mut faults = self.faults.write().await;
        let fault = faults
            .get_mut(key)
            .ok_or_else(|| format!("unknown fault {}", key))?;
        if fault.status != FaultStatus::Escalated {
            return Err(format!(
                "fault is {}, only escalated faults can be reset",
                fault.status.as_str()
            ));
        }
        info!("Fault {} reset by operator, new attempt budget", key);
        let severity = fault.severity;
        fault.reopen(severity, String::new());
        Ok(())
    }

    /// Exclude a fault from automation, or bring it back.
    pub async fn set_suppressed(&self, key: &FaultKey, suppressed: bool) -> Result<(), String> {
        let mut faults = self.faults.write().await;
        let fault = faults
            .get_mut(key)
            .ok_or_else(|| format!("unknown fault {}", key))?;
        match (suppressed, fault.status) {
            (true, FaultStatus::Open) => {
                info!("Fault {} suppressed", key);
                fault.status = FaultStatus::Suppressed;
                fault.next_retry = None;
                Ok(())
            }
            (true, other) => Err(format!("cannot suppress a {} fault", other.as_str())),
            (false, FaultStatus::Suppressed) => {
                info!("Fault {} unsuppressed", key);
                fault.status = FaultStatus::Open;
                Ok(())
            }
            (false, other) => Err(format!("fault is {}, not suppressed", other.as_str())),
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    async fn heal_cycle(&self, key: FaultKey, manual: bool) {
        // Concurrency rule: one active run per identity
        {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !in_flight.insert(key.clone()) {
                debug!("Heal cycle for {} already active, skipping", key);
                return;
            }
        }
        let _guard = InFlightGuard {
            engine: self,
            key: key.clone(),
        };

        let Ok(permit) = self.workers.clone().acquire_owned().await else {
            return;
        };

        if let Err(e) = self.run_attempt(&key, manual).await {
            // Internal orchestrator error: recorded as a failed attempt and
            // counted against the budget so a broken cycle cannot spin
            error!("Internal error healing {}: {:#}", key, e);
            self.record_internal_failure(&key, &e).await;
        }
        drop(permit);
    }

    async fn run_attempt(&self, key: &FaultKey, manual: bool) -> Result<()> {
        let cfg = snapshot(&self.config).await;

        // Cancellation rule: a config change observed here stops the
        // Diagnosing -> Executing transition; in-flight commands elsewhere
        // finish under their own timeout
        if !cfg.healing.enabled || (!cfg.healing.auto_execute && !manual) {
            debug!("Skipping {}: healing disabled by configuration", key);
            return Ok(());
        }

        // --- Diagnosing: claim the fault and pick the next candidate ---
        let (sequence, prior_attempts) = {
            let mut faults = self.faults.write().await;
            let Some(fault) = faults.get_mut(key) else {
                return Ok(());
            };
            if fault.status != FaultStatus::Open {
                debug!("Fault {} is {}, not healing", key, fault.status.as_str());
                return Ok(());
            }
            // A stale spawn must not jump the backoff timer
            if !manual && fault.next_retry.is_some_and(|t| t > Utc::now()) {
                return Ok(());
            }

            // Attempt-window accounting: a stale cycle restarts its counter
            // instead of escalating on ancient history
            if fault.attempts > 0 && Utc::now() - fault.cycle_started > cfg.attempt_window() {
                info!(
                    "Fault {}: attempt window expired, restarting cycle accounting",
                    key
                );
                fault.attempts = 0;
                fault.cycle_started = Utc::now();
            }

            if fault.attempts >= cfg.healing.max_attempts_per_fault {
                return Ok(());
            }

            fault.status = FaultStatus::Healing;
            (fault.attempts + 1, fault.attempts)
        };

        let overrides = cfg
            .actions
            .priority
            .get(key.category.as_str())
            .map(|v| v.as_slice());
        let candidates = self.catalog.candidates_for(key.category, overrides);

        let started_at = Utc::now();
        if candidates.is_empty() {
            warn!("No remediation action registered for {}", key.category);
            let attempt = HealingAttempt::new(
                key.clone(),
                INTERNAL_ACTION,
                sequence,
                started_at,
                AttemptOutcome::Failed,
                format!("no remediation action registered for {}", key.category),
            );
            self.finalize_attempt(key, attempt, &cfg).await;
            return Ok(());
        }

        // Next candidate not yet attempted this cycle; wraps around when the
        // budget outlasts the catalog. A single candidate skips diagnosis.
        let action = candidates[prior_attempts as usize % candidates.len()].clone();
        if candidates.len() == 1 {
            debug!("Single remediation for {}, diagnosis skipped", key.category);
        }

        info!(
            "Healing {} attempt {}/{} using '{}'",
            key, sequence, cfg.healing.max_attempts_per_fault, action.name
        );
        self.notifier.send(NotifyEvent::AttemptStarted {
            key: key.clone(),
            action: action.name.clone(),
            sequence,
            timestamp: started_at,
        });

        // --- Executing ---
        let no_params = HashMap::new();
        let exec = self.runner.run(&action, &key.resource, &no_params).await;

        // --- Verifying: always, regardless of raw executor success, because
        // a command can report failure yet still have fixed the condition ---
        let plan = cfg.verify.plan_for(key.category.as_str());
        let verdict = self
            .verifier
            .verify(key.category, &key.resource, plan)
            .await;

        let (outcome, diagnostic) = match (&exec, verdict) {
            (_, VerifyStatus::Resolved) => {
                let note = match &exec {
                    Ok(r) if r.succeeded() => "verified resolved".to_string(),
                    Ok(r) => format!(
                        "command exited {:?} but condition verified resolved",
                        r.exit_code
                    ),
                    Err(e) => format!("executor fault ({}) but condition verified resolved", e),
                };
                (AttemptOutcome::Success, note)
            }
            (Err(e), v) => (
                AttemptOutcome::Failed,
                format!("executor fault: {} (verify: {:?})", e, v),
            ),
            (Ok(r), v) if r.timed_out => (
                AttemptOutcome::TimedOut,
                format!("{} (verify: {:?})", r.output, v),
            ),
            (Ok(r), v) if !r.succeeded() => (
                AttemptOutcome::Failed,
                format!("exit {:?}: {} (verify: {:?})", r.exit_code, r.output, v),
            ),
            (Ok(r), v) => (
                AttemptOutcome::VerificationFailed,
                format!("command succeeded, verify: {:?}; {}", v, r.output),
            ),
        };

        let attempt = HealingAttempt::new(
            key.clone(),
            action.name,
            sequence,
            started_at,
            outcome,
            diagnostic,
        );
        self.finalize_attempt(key, attempt, &cfg).await;
        Ok(())
    }

    /// Record the attempt and advance the state machine to Healed,
    /// Open(retry), or Escalated.
    async fn finalize_attempt(
        &self,
        key: &FaultKey,
        attempt: HealingAttempt,
        cfg: &remedy_common::Config,
    ) {
        // The transition below must run even when the store is broken,
        // otherwise the fault wedges in Healing and nothing ever picks it
        // up again
        if let Err(e) = self.history.append(&attempt).await {
            error!("Failed to record healing attempt for {}: {:#}", key, e);
        }

        let backoff = BackoffPolicy::from_config(&cfg.healing);
        let mut escalated = false;
        let mut healed = false;

        {
            let mut faults = self.faults.write().await;
            let Some(fault) = faults.get_mut(key) else {
                return;
            };
            // Externally resolved while we were executing: keep Healed
            if fault.status == FaultStatus::Healed {
                return;
            }

            fault.attempts = attempt.sequence;
            fault.last_outcome = Some(attempt.outcome);

            if attempt.outcome == AttemptOutcome::Success {
                fault.status = FaultStatus::Healed;
                fault.next_retry = None;
                healed = true;
            } else if attempt.sequence >= cfg.healing.max_attempts_per_fault {
                fault.status = FaultStatus::Escalated;
                fault.next_retry = None;
                escalated = true;
            } else {
                let delay = backoff.delay_for(attempt.sequence);
                fault.status = FaultStatus::Open;
                fault.next_retry = Some(
                    Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                );
                debug!(
                    "Fault {} retry {} scheduled in {}s",
                    key,
                    attempt.sequence + 1,
                    delay.as_secs()
                );
            }
        }

        if healed {
            info!("Fault {} healed on attempt {}", key, attempt.sequence);
            self.notifier.send(NotifyEvent::Healed {
                key: key.clone(),
                attempts: attempt.sequence,
                timestamp: Utc::now(),
            });
        } else if escalated {
            warn!(
                "Fault {} escalated after {} attempts, operator required",
                key, attempt.sequence
            );
            if let Err(e) = self.history.record_escalation(key, attempt.sequence).await {
                warn!("Failed to record escalation for {}: {}", key, e);
            }
            self.notifier.send(NotifyEvent::Escalated {
                key: key.clone(),
                attempts: attempt.sequence,
                last_diagnostic: attempt.diagnostic.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    async fn record_internal_failure(&self, key: &FaultKey, err: &anyhow::Error) {
        let cfg = snapshot(&self.config).await;
        let sequence = {
            let faults = self.faults.read().await;
            match faults.get(key) {
                Some(f) => f.attempts + 1,
                None => return,
            }
        };
        let attempt = HealingAttempt::new(
            key.clone(),
            INTERNAL_ACTION,
            sequence,
            Utc::now(),
            AttemptOutcome::Failed,
            format!("internal orchestrator error: {:#}", err),
        );
        self.finalize_attempt(key, attempt, &cfg).await;
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Faults visible to operators: everything not yet healed.
    pub async fn list_active(&self) -> Vec<Fault> {
        let faults = self.faults.read().await;
        let mut list: Vec<Fault> = faults
            .values()
            .filter(|f| f.status != FaultStatus::Healed)
            .cloned()
            .collect();
        list.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.key.to_string().cmp(&b.key.to_string()))
        });
        list
    }

    pub async fn get_fault(&self, key: &FaultKey) -> Option<Fault> {
        self.faults.read().await.get(key).cloned()
    }

    pub async fn open_fault_count(&self) -> usize {
        let faults = self.faults.read().await;
        faults
            .values()
            .filter(|f| !f.status.is_terminal())
            .count()
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Prune attempt rows for healed faults past the retention age and drop
    /// those faults from the map. Escalated faults are never pruned; they
    /// must stay visible until an operator acts.
    pub async fn prune_retention(&self) {
        let cfg = snapshot(&self.config).await;
        let max_age = chrono::Duration::days(cfg.retention.attempt_max_age_days as i64);
        let cutoff = Utc::now() - max_age;

        let healed: Vec<FaultKey> = {
            let faults = self.faults.read().await;
            faults
                .values()
                .filter(|f| f.status == FaultStatus::Healed)
                .map(|f| f.key.clone())
                .collect()
        };
        if healed.is_empty() {
            return;
        }

        if let Err(e) = self.history.prune(max_age, &healed).await {
            warn!("Retention pruning failed: {}", e);
        }

        let mut faults = self.faults.write().await;
        faults.retain(|_, f| !(f.status == FaultStatus::Healed && f.last_seen < cutoff));
    }

    fn is_in_flight(&self, key: &FaultKey) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }
}

/// Removes the identity from the in-flight set when the cycle ends, even on
/// an early return.
struct InFlightGuard<'a> {
    engine: &'a Engine,
    key: FaultKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.engine
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

/// Background scanning loop: drains the intake queue, advances due faults,
/// and runs retention pruning. Never blocks on a single fault; heal cycles
/// are detached tasks bounded by the worker pool.
pub async fn run_scan_loop(engine: Arc<Engine>, mut intake_rx: mpsc::UnboundedReceiver<IntakeEvent>) {
    info!("Scan loop started");
    let mut last_prune = Instant::now();

    loop {
        while let Ok(event) = intake_rx.try_recv() {
            engine.handle_event(event).await;
        }

        let handles = engine.advance_due().await;
        drop(handles);

        if last_prune.elapsed() >= PRUNE_INTERVAL {
            engine.prune_retention().await;
            last_prune = Instant::now();
        }

        let poll = snapshot_poll(&engine).await;
        tokio::select! {
            event = intake_rx.recv() => {
                match event {
                    Some(event) => engine.handle_event(event).await,
                    None => {
                        info!("Intake channel closed, scan loop exiting");
                        return;
                    }
                }
            }
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

async fn snapshot_poll(engine: &Arc<Engine>) -> Duration {
    snapshot(&engine.config).await.poll_interval()
}
