//! Verifier - re-checks the original fault condition after remediation.
//!
//! Polls the same signal source that reported the fault (service up-check,
//! container running-check, resource thresholds, network reachability) for a
//! small bounded number of sub-attempts, because remediation effects such as
//! a service binding its port are not always instantaneous.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use remedy_common::{FaultCategory, VerifyPlan, VerifyStatus};
use sysinfo::{Disks, System};
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Per-check command bound; checks are cheap and must never hang the cycle.
const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Memory/CPU thresholds above which a resource fault is still considered
/// present, and the minimum free-disk fraction below which it is.
const MEM_FAULT_PERCENT: f64 = 90.0;
const CPU_FAULT_PERCENT: f64 = 95.0;
const DISK_MIN_FREE_FRACTION: f64 = 0.05;

/// Seam for the orchestrator; scenario tests script the statuses.
#[async_trait]
pub trait FaultVerifier: Send + Sync {
    async fn verify(
        &self,
        category: FaultCategory,
        resource: &str,
        plan: VerifyPlan,
    ) -> VerifyStatus;
}

/// Verifies against the live system.
pub struct HealthVerifier;

#[async_trait]
impl FaultVerifier for HealthVerifier {
    async fn verify(
        &self,
        category: FaultCategory,
        resource: &str,
        plan: VerifyPlan,
    ) -> VerifyStatus {
        let attempts = plan.attempts.max(1);
        let mut saw_check_error = false;

        for attempt in 1..=attempts {
            let status = check_once(category, resource).await;
            debug!(
                "Verify {}/{} sub-attempt {}/{}: {:?}",
                category, resource, attempt, attempts, status
            );
            match status {
                VerifyStatus::Resolved => return VerifyStatus::Resolved,
                VerifyStatus::StillFaulty => {}
                VerifyStatus::Indeterminate => saw_check_error = true,
            }
            if attempt < attempts {
                sleep(plan.delay()).await;
            }
        }

        if saw_check_error {
            VerifyStatus::Indeterminate
        } else {
            VerifyStatus::StillFaulty
        }
    }
}

async fn check_once(category: FaultCategory, resource: &str) -> VerifyStatus {
    match category {
        FaultCategory::ServiceDown => {
            check_command("systemctl", &["is-active", "--quiet", resource]).await
        }
        FaultCategory::ContainerCrash => {
            match command_stdout("docker", &["inspect", "-f", "{{.State.Running}}", resource])
                .await
            {
                Some(out) => {
                    if out.trim() == "true" {
                        VerifyStatus::Resolved
                    } else {
                        VerifyStatus::StillFaulty
                    }
                }
                None => VerifyStatus::Indeterminate,
            }
        }
        FaultCategory::ResourceExhaustion => check_resource(resource).await,
        FaultCategory::NetworkBroken => {
            check_command("ping", &["-c", "1", "-W", "2", resource]).await
        }
        // No built-in signal source; the detector must re-report or resolve
        FaultCategory::Custom => VerifyStatus::Indeterminate,
    }
}

/// Resource identifiers: "disk:<mount>", "memory", "cpu". Anything else is
/// checked as overall memory pressure.
async fn check_resource(resource: &str) -> VerifyStatus {
    if let Some(mount) = resource.strip_prefix("disk:") {
        let disks = Disks::new_with_refreshed_list();
        for disk in disks.list() {
            if disk.mount_point().to_string_lossy() == mount {
                let total = disk.total_space() as f64;
                if total <= 0.0 {
                    return VerifyStatus::Indeterminate;
                }
                let free_fraction = disk.available_space() as f64 / total;
                return if free_fraction >= DISK_MIN_FREE_FRACTION {
                    VerifyStatus::Resolved
                } else {
                    VerifyStatus::StillFaulty
                };
            }
        }
        warn!("Verify: mount point '{}' not found", mount);
        return VerifyStatus::Indeterminate;
    }

    if resource == "cpu" {
        // CPU usage is a delta between two samples; a single refresh on a
        // fresh System always reads 0.0
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        sys.refresh_cpu_usage();
        let usage = sys.global_cpu_info().cpu_usage() as f64;
        return if usage < CPU_FAULT_PERCENT {
            VerifyStatus::Resolved
        } else {
            VerifyStatus::StillFaulty
        };
    }

    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory() as f64;
    if total <= 0.0 {
        return VerifyStatus::Indeterminate;
    }
    let used_percent = sys.used_memory() as f64 / total * 100.0;
    if used_percent < MEM_FAULT_PERCENT {
        VerifyStatus::Resolved
    } else {
        VerifyStatus::StillFaulty
    }
}

/// Exit 0 means resolved, non-zero still faulty, spawn failure or hang is a
/// check error.
async fn check_command(program: &str, args: &[&str]) -> VerifyStatus {
    let result = timeout(
        CHECK_TIMEOUT,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status(),
    )
    .await;

    match result {
        Ok(Ok(status)) if status.success() => VerifyStatus::Resolved,
        Ok(Ok(_)) => VerifyStatus::StillFaulty,
        Ok(Err(e)) => {
            warn!("Verify check '{}' could not run: {}", program, e);
            VerifyStatus::Indeterminate
        }
        Err(_) => {
            warn!("Verify check '{}' timed out", program);
            VerifyStatus::Indeterminate
        }
    }
}

async fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    let result = timeout(
        CHECK_TIMEOUT,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).to_string())
        }
        Ok(Ok(_)) => Some(String::new()),
        Ok(Err(e)) => {
            warn!("Verify check '{}' could not run: {}", program, e);
            None
        }
        Err(_) => {
            warn!("Verify check '{}' timed out", program);
            None
        }
    }
}
