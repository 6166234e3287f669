//! Remedy Daemon - autonomous self-healing orchestration engine.
//!
//! Turns detected operational faults into bounded, verified remediation
//! attempts with backoff, escalation, and a durable audit trail.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use remedy_common::{Config, VERSION};
use remedyd::catalog::ActionCatalog;
use remedyd::config_watch::{self, ConfigWatcher};
use remedyd::executor::CommandExecutor;
use remedyd::history::{AttemptHistory, HISTORY_DB_PATH};
use remedyd::intake::FaultIntake;
use remedyd::notifier::{self, Notifier};
use remedyd::orchestrator::{run_scan_loop, Engine};
use remedyd::server::{self, AppState};
use remedyd::verifier::HealthVerifier;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Remedy daemon v{} starting", VERSION);

    let config = Config::load();
    let listen = config.server.listen.clone();
    let worker_limit = config.monitor.worker_limit;
    let shared_config = config_watch::shared(config);

    let history = Arc::new(AttemptHistory::open(HISTORY_DB_PATH)?);
    let catalog = Arc::new(ActionCatalog::with_builtins());

    let (notifier, notify_rx) = Notifier::channel();
    tokio::spawn(notifier::deliver_loop(notify_rx, shared_config.clone()));

    let engine = Engine::new(
        shared_config.clone(),
        catalog,
        Arc::new(CommandExecutor),
        Arc::new(HealthVerifier),
        history,
        notifier,
        worker_limit,
    );

    let (intake, intake_rx) = FaultIntake::channel();
    tokio::spawn(run_scan_loop(engine.clone(), intake_rx));

    // Keep the previous snapshot if the file disappears or fails to parse
    let _config_watcher =
        match ConfigWatcher::spawn(remedy_common::config::CONFIG_PATH, shared_config.clone()) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                info!("Config hot reload unavailable: {}", e);
                None
            }
        };

    let state = Arc::new(AppState {
        engine,
        config: shared_config,
        intake,
        started_at: Instant::now(),
    });

    tokio::select! {
        result = server::serve(state, &listen) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down gracefully");
        }
    }

    Ok(())
}
