//! End-to-end orchestrator scenarios with scripted executor and verifier.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use remedy_common::{
    ActionDefinition, AttemptOutcome, Config, FaultCategory, FaultKey, FaultStatus, NotifyEvent,
    Severity, VerifyPlan, VerifyStatus,
};
use remedyd::catalog::ActionCatalog;
use remedyd::config_watch::{self, SharedConfig};
use remedyd::executor::{ActionRunner, ExecError, ExecutionResult};
use remedyd::history::AttemptHistory;
use remedyd::intake::IntakeEvent;
use remedyd::notifier::Notifier;
use remedyd::orchestrator::Engine;
use remedyd::verifier::FaultVerifier;
use tokio::sync::mpsc::UnboundedReceiver;

/// One scripted execution step.
#[derive(Debug, Clone, Copy)]
enum Step {
    Exit(i32),
    TimedOut,
    SpawnFail,
}

/// Runner that replays a script; repeats the last step when exhausted.
struct ScriptedRunner {
    steps: Mutex<VecDeque<Step>>,
    last: Step,
    delay: Duration,
    executions: AtomicU32,
}

impl ScriptedRunner {
    fn new(steps: Vec<Step>, last: Step) -> Arc<Self> {
        Self::with_delay(steps, last, Duration::ZERO)
    }

    /// Runner that holds each execution open for `delay`, so overlapping
    /// cycles can be provoked.
    fn with_delay(steps: Vec<Step>, last: Step, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            last,
            delay,
            executions: AtomicU32::new(0),
        })
    }

    fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionRunner for ScriptedRunner {
    async fn run(
        &self,
        action: &ActionDefinition,
        _resource: &str,
        _params: &HashMap<String, String>,
    ) -> Result<ExecutionResult, ExecError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(self.last);
        match step {
            Step::Exit(code) => Ok(ExecutionResult {
                exit_code: Some(code),
                output: format!("scripted exit {}", code),
                duration: Duration::from_millis(5),
                timed_out: false,
            }),
            Step::TimedOut => Ok(ExecutionResult {
                exit_code: None,
                output: "scripted timeout".to_string(),
                duration: action.timeout(),
                timed_out: true,
            }),
            Step::SpawnFail => Err(ExecError::Spawn {
                action: action.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "binary missing"),
            }),
        }
    }
}

/// Verifier that replays a script; repeats the last verdict when exhausted.
struct ScriptedVerifier {
    verdicts: Mutex<VecDeque<VerifyStatus>>,
    last: VerifyStatus,
}

impl ScriptedVerifier {
    fn new(verdicts: Vec<VerifyStatus>, last: VerifyStatus) -> Arc<Self> {
        Arc::new(Self {
            verdicts: Mutex::new(verdicts.into()),
            last,
        })
    }
}

#[async_trait]
impl FaultVerifier for ScriptedVerifier {
    async fn verify(
        &self,
        _category: FaultCategory,
        _resource: &str,
        _plan: VerifyPlan,
    ) -> VerifyStatus {
        self.verdicts.lock().unwrap().pop_front().unwrap_or(self.last)
    }
}

fn test_config(max_attempts: u32, auto_execute: bool) -> Config {
    let mut config = Config::default();
    config.healing.max_attempts_per_fault = max_attempts;
    config.healing.auto_execute = auto_execute;
    // Immediate retries keep the scenarios deterministic and fast
    config.healing.backoff_base_secs = 0;
    config.verify.default.delay_secs = 0;
    config
}

struct Harness {
    engine: Arc<Engine>,
    config: SharedConfig,
    notifications: UnboundedReceiver<NotifyEvent>,
}

fn harness(
    config: Config,
    runner: Arc<ScriptedRunner>,
    verifier: Arc<ScriptedVerifier>,
) -> Harness {
    harness_with(
        config,
        runner,
        verifier,
        AttemptHistory::open_in_memory().unwrap(),
    )
}

fn harness_with(
    config: Config,
    runner: Arc<ScriptedRunner>,
    verifier: Arc<ScriptedVerifier>,
    history: AttemptHistory,
) -> Harness {
    let shared = config_watch::shared(config);
    let (notifier, notifications) = Notifier::channel();
    let engine = Engine::new(
        shared.clone(),
        Arc::new(ActionCatalog::with_builtins()),
        runner,
        verifier,
        Arc::new(history),
        notifier,
        4,
    );
    Harness {
        engine,
        config: shared,
        notifications,
    }
}

fn nginx_key() -> FaultKey {
    FaultKey::new(FaultCategory::ServiceDown, "nginx")
}

fn report(key: &FaultKey) -> IntakeEvent {
    IntakeEvent::Report {
        key: key.clone(),
        severity: Severity::High,
        evidence: "probe failed".to_string(),
    }
}

async fn advance_and_wait(engine: &Arc<Engine>) {
    for handle in engine.advance_due().await {
        handle.await.unwrap();
    }
}

fn drain(rx: &mut UnboundedReceiver<NotifyEvent>) -> Vec<NotifyEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn simple_recovery_heals_on_first_attempt() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(0));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::Resolved);
    let mut h = harness(test_config(3, true), runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;

    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Healed);
    assert_eq!(fault.attempts, 1);

    let attempts = h.engine.history().list_by_fault(&key).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Success);
    assert_eq!(attempts[0].sequence, 1);
    assert_eq!(runner.executions(), 1);

    let events = drain(&mut h.notifications);
    assert!(matches!(events[0], NotifyEvent::AttemptStarted { .. }));
    assert!(matches!(events[1], NotifyEvent::Healed { attempts: 1, .. }));
}

#[tokio::test]
async fn exhaustion_escalates_after_budget() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(1));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::StillFaulty);
    let mut h = harness(test_config(3, true), runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    // Extra passes beyond the budget must not run extra attempts
    for _ in 0..5 {
        advance_and_wait(&h.engine).await;
    }

    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Escalated);
    assert_eq!(fault.attempts, 3);
    assert_eq!(runner.executions(), 3, "Executing transitions exceeded budget");

    let attempts = h.engine.history().list_by_fault(&key).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::Failed));
    assert_eq!(attempts.iter().map(|a| a.sequence).collect::<Vec<_>>(), vec![1, 2, 3]);

    let events = drain(&mut h.notifications);
    let escalations = events
        .iter()
        .filter(|e| matches!(e, NotifyEvent::Escalated { .. }))
        .count();
    assert_eq!(escalations, 1, "Escalated must be notified exactly once");

    let recent = h.engine.history().recently_escalated(5).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].0, key);
}

#[tokio::test]
async fn report_only_mode_runs_nothing() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(0));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::Resolved);
    let mut h = harness(test_config(3, false), runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;
    advance_and_wait(&h.engine).await;

    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Open);
    assert_eq!(runner.executions(), 0);
    assert!(h.engine.history().list_by_fault(&key).await.unwrap().is_empty());

    let events = drain(&mut h.notifications);
    assert_eq!(events.len(), 1, "report-only notification must fire once");
    assert!(matches!(events[0], NotifyEvent::AutoExecuteDisabled { .. }));
}

#[tokio::test]
async fn external_resolution_short_circuits() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(0));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::Resolved);
    let mut h = harness(test_config(3, true), runner.clone(), verifier);
    let key = FaultKey::new(FaultCategory::ContainerCrash, "cache-node-3");

    h.engine.handle_event(report(&key)).await;
    h.engine
        .handle_event(IntakeEvent::Resolved { key: key.clone() })
        .await;
    advance_and_wait(&h.engine).await;

    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Healed);
    assert_eq!(runner.executions(), 0);
    assert!(h.engine.history().list_by_fault(&key).await.unwrap().is_empty());

    let events = drain(&mut h.notifications);
    assert!(events
        .iter()
        .any(|e| matches!(e, NotifyEvent::Healed { attempts: 0, .. })));
}

#[tokio::test]
async fn live_disable_stops_next_attempt() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(1));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::StillFaulty);
    let mut h = harness(test_config(3, true), runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;
    assert_eq!(runner.executions(), 1);

    // Disable between attempt 1 and attempt 2's scheduled retry
    let mut disabled = test_config(3, true);
    disabled.healing.enabled = false;
    config_watch::replace(&h.config, disabled).await;

    advance_and_wait(&h.engine).await;
    advance_and_wait(&h.engine).await;
    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Open);
    assert_eq!(fault.attempts, 1);
    assert_eq!(runner.executions(), 1, "no attempt may start while disabled");

    // Re-enable: healing resumes where it left off
    config_watch::replace(&h.config, test_config(3, true)).await;
    advance_and_wait(&h.engine).await;
    assert_eq!(runner.executions(), 2);
    drain(&mut h.notifications);
}

#[tokio::test]
async fn repeat_report_does_not_duplicate_or_reset() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(1));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::StillFaulty);
    let h = harness(test_config(5, true), runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;
    let after_first = h.engine.get_fault(&key).await.unwrap().attempts;
    assert_eq!(after_first, 1);

    // Idempotent re-report while Open
    h.engine.handle_event(report(&key)).await;
    h.engine.handle_event(report(&key)).await;

    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.attempts, 1, "re-report must not reset the counter");
    assert_eq!(h.engine.list_active().await.len(), 1);
}

#[tokio::test]
async fn healed_fault_reopens_with_fresh_cycle() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(0));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::Resolved);
    let h = harness(test_config(3, true), runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;
    assert_eq!(h.engine.get_fault(&key).await.unwrap().status, FaultStatus::Healed);

    // Recurrence: fresh attempt cycle starting at 1
    h.engine.handle_event(report(&key)).await;
    let reopened = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(reopened.status, FaultStatus::Open);
    assert_eq!(reopened.attempts, 0);

    advance_and_wait(&h.engine).await;
    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Healed);
    assert_eq!(fault.attempts, 1);

    let attempts = h.engine.history().list_by_fault(&key).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts.last().unwrap().sequence, 1);
}

#[tokio::test]
async fn manual_heal_bypasses_backoff_but_not_budget() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(1));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::StillFaulty);
    let mut config = test_config(2, true);
    // Long backoff so the scheduled retry is far in the future
    config.healing.backoff_base_secs = 600;
    let h = harness(config, runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;
    assert_eq!(runner.executions(), 1);

    // Backoff timer holds the fault; the scan loop does nothing
    advance_and_wait(&h.engine).await;
    assert_eq!(runner.executions(), 1);

    // Manual trigger jumps the timer, still counts against the budget
    let handle = h.engine.trigger_manual_heal(&key).await.unwrap();
    handle.await.unwrap();
    assert_eq!(runner.executions(), 2);

    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Escalated);

    // Budget exhausted: further manual triggers are rejected with a reason
    let rejection = h.engine.trigger_manual_heal(&key).await.unwrap_err();
    assert!(rejection.contains("reset"));
}

#[tokio::test]
async fn manual_heal_rejected_when_disabled() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(0));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::Resolved);
    let mut config = test_config(3, true);
    config.healing.enabled = false;
    let h = harness(config, runner, verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    let rejection = h.engine.trigger_manual_heal(&key).await.unwrap_err();
    assert!(rejection.contains("disabled"));
    // Policy violation: no state change
    assert_eq!(h.engine.get_fault(&key).await.unwrap().status, FaultStatus::Open);
}

#[tokio::test]
async fn reset_grants_new_budget_after_escalation() {
    let runner = ScriptedRunner::new(vec![Step::Exit(1)], Step::Exit(0));
    let verifier = ScriptedVerifier::new(
        vec![VerifyStatus::StillFaulty],
        VerifyStatus::Resolved,
    );
    let h = harness(test_config(1, true), runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;
    assert_eq!(h.engine.get_fault(&key).await.unwrap().status, FaultStatus::Escalated);

    // No automated attempts occur while escalated
    advance_and_wait(&h.engine).await;
    assert_eq!(runner.executions(), 1);

    h.engine.reset_fault(&key).await.unwrap();
    advance_and_wait(&h.engine).await;

    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Healed);
    assert_eq!(fault.attempts, 1);
}

#[tokio::test]
async fn executor_timeout_and_spawn_failure_are_recorded() {
    let runner = ScriptedRunner::new(vec![Step::TimedOut, Step::SpawnFail], Step::Exit(1));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::StillFaulty);
    let h = harness(test_config(3, true), runner, verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;
    advance_and_wait(&h.engine).await;

    let attempts = h.engine.history().list_by_fault(&key).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].outcome, AttemptOutcome::TimedOut);
    assert_eq!(attempts[1].outcome, AttemptOutcome::Failed);
    assert!(attempts[1].diagnostic.contains("executor fault"));
}

#[tokio::test]
async fn indeterminate_verification_counts_toward_budget() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(0));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::Indeterminate);
    let h = harness(test_config(2, true), runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;
    advance_and_wait(&h.engine).await;

    // A broken check must not loop forever: budget applies as usual
    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Escalated);
    assert_eq!(runner.executions(), 2);

    let attempts = h.engine.history().list_by_fault(&key).await.unwrap();
    assert!(attempts
        .iter()
        .all(|a| a.outcome == AttemptOutcome::VerificationFailed));
    assert!(attempts[0].diagnostic.contains("Indeterminate"));
}

#[tokio::test]
async fn command_failure_with_resolved_verification_heals() {
    // A command can report failure yet still have fixed the condition
    let runner = ScriptedRunner::new(vec![], Step::Exit(1));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::Resolved);
    let h = harness(test_config(3, true), runner, verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;

    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Healed);
    let attempts = h.engine.history().list_by_fault(&key).await.unwrap();
    assert_eq!(attempts[0].outcome, AttemptOutcome::Success);
}

#[tokio::test]
async fn suppressed_fault_is_skipped() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(0));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::Resolved);
    let h = harness(test_config(3, true), runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;
    h.engine.set_suppressed(&key, true).await.unwrap();
    advance_and_wait(&h.engine).await;
    assert_eq!(runner.executions(), 0);

    h.engine.set_suppressed(&key, false).await.unwrap();
    advance_and_wait(&h.engine).await;
    assert_eq!(runner.executions(), 1);
    assert_eq!(h.engine.get_fault(&key).await.unwrap().status, FaultStatus::Healed);
}

#[tokio::test]
async fn concurrent_triggers_run_one_cycle_per_key() {
    // Hold each execution open so scheduling passes and a manual trigger
    // genuinely overlap the active run
    let runner = ScriptedRunner::with_delay(vec![], Step::Exit(0), Duration::from_millis(200));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::Resolved);
    let h = harness(test_config(3, true), runner.clone(), verifier);
    let key = nginx_key();

    h.engine.handle_event(report(&key)).await;

    let first = h.engine.advance_due().await;
    let second = h.engine.advance_due().await;
    let manual = h.engine.trigger_manual_heal(&key).await;

    for handle in first.into_iter().chain(second) {
        handle.await.unwrap();
    }
    // The manual trigger is either rejected while the run is active or its
    // task loses the claim; it never executes a second command
    if let Ok(handle) = manual {
        handle.await.unwrap();
    }

    assert_eq!(runner.executions(), 1, "duplicate run for one fault key");
    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Healed);
    assert_eq!(fault.attempts, 1);
    assert_eq!(h.engine.history().list_by_fault(&key).await.unwrap().len(), 1);
}

#[tokio::test]
async fn broken_history_store_does_not_wedge_healing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");
    let history = AttemptHistory::open(&path).unwrap();

    let runner = ScriptedRunner::new(vec![], Step::Exit(1));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::StillFaulty);
    let h = harness_with(test_config(3, true), runner.clone(), verifier, history);
    let key = nginx_key();

    // Break the store out from under the engine
    rusqlite::Connection::open(&path)
        .unwrap()
        .execute_batch("DROP TABLE attempts")
        .unwrap();

    h.engine.handle_event(report(&key)).await;
    advance_and_wait(&h.engine).await;

    // The append failed, but the fault must not stay stuck in Healing
    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Open);
    assert_eq!(fault.attempts, 1);

    // Retries continue and the budget still escalates as usual
    for _ in 0..4 {
        advance_and_wait(&h.engine).await;
    }
    let fault = h.engine.get_fault(&key).await.unwrap();
    assert_eq!(fault.status, FaultStatus::Escalated);
    assert_eq!(runner.executions(), 3);
}

#[tokio::test]
async fn independent_faults_heal_independently() {
    let runner = ScriptedRunner::new(vec![], Step::Exit(0));
    let verifier = ScriptedVerifier::new(vec![], VerifyStatus::Resolved);
    let h = harness(test_config(3, true), runner.clone(), verifier);

    let a = FaultKey::new(FaultCategory::ServiceDown, "nginx");
    let b = FaultKey::new(FaultCategory::ServiceDown, "postgres");
    let c = FaultKey::new(FaultCategory::NetworkBroken, "gateway");

    for key in [&a, &b, &c] {
        h.engine.handle_event(report(key)).await;
    }
    advance_and_wait(&h.engine).await;

    for key in [&a, &b, &c] {
        assert_eq!(h.engine.get_fault(key).await.unwrap().status, FaultStatus::Healed);
        assert_eq!(h.engine.history().list_by_fault(key).await.unwrap().len(), 1);
    }
    assert_eq!(runner.executions(), 3);
}
