//! Remedy Control - CLI client for the self-healing daemon.

mod client;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use remedy_common::{FaultCategory, FaultStatus, Severity, VERSION};

use client::DaemonClient;

const DEFAULT_API: &str = "http://127.0.0.1:7044";

#[derive(Parser)]
#[command(name = "remedyctl")]
#[command(about = "Remedy - autonomous self-healing engine", long_about = None)]
#[command(version = VERSION)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = DEFAULT_API)]
    api: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon health and healing mode
    Status,

    /// List active faults (open, healing, escalated)
    Faults,

    /// Show one fault and its attempt history
    Detail {
        /// Fault category (e.g. service-down)
        category: String,
        /// Resource identifier (e.g. nginx)
        resource: String,
    },

    /// Trigger an immediate healing attempt, bypassing the backoff timer
    Heal {
        category: String,
        resource: String,
    },

    /// Grant an escalated fault a fresh attempt budget
    Reset {
        category: String,
        resource: String,
    },

    /// Healing statistics over a time window
    Stats {
        /// Window in seconds
        #[arg(long, default_value_t = 86_400)]
        window: u64,
    },

    /// Report a fault (for detectors and testing)
    Report {
        category: String,
        resource: String,
        #[arg(long, default_value = "medium")]
        severity: String,
        #[arg(long, default_value = "")]
        evidence: String,
    },

    /// Report a fault condition as independently resolved
    Resolve {
        category: String,
        resource: String,
    },
}

fn parse_category(s: &str) -> Result<FaultCategory> {
    FaultCategory::parse(s).ok_or_else(|| {
        anyhow!(
            "unknown category '{}' (expected service-down, container-crash, \
             resource-exhaustion, network-broken, or custom)",
            s
        )
    })
}

fn parse_severity(s: &str) -> Result<Severity> {
    match s {
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        _ => Err(anyhow!("unknown severity '{}'", s)),
    }
}

fn status_colored(status: FaultStatus) -> String {
    match status {
        FaultStatus::Open => status.as_str().yellow().to_string(),
        FaultStatus::Healing => status.as_str().cyan().to_string(),
        FaultStatus::Healed => status.as_str().green().to_string(),
        FaultStatus::Escalated => status.as_str().red().bold().to_string(),
        FaultStatus::Suppressed => status.as_str().dimmed().to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = DaemonClient::new(cli.api.clone());

    match cli.command {
        Commands::Status => {
            let health = client.health().await?;
            println!("{}", "Remedy daemon".bold());
            println!("  version      {}", health.version);
            println!("  uptime       {}s", health.uptime_seconds);
            println!(
                "  healing      {}",
                if health.enabled {
                    "enabled".green().to_string()
                } else {
                    "disabled".red().to_string()
                }
            );
            println!(
                "  auto-execute {}",
                if health.auto_execute {
                    "on".green().to_string()
                } else {
                    "off (report-only)".yellow().to_string()
                }
            );
            println!("  open faults  {}", health.open_faults);
        }

        Commands::Faults => {
            let faults = client.list_faults().await?;
            if faults.is_empty() {
                println!("{}", "No active faults.".green());
                return Ok(());
            }
            for fault in faults {
                println!(
                    "{:<12} {:<40} sev={:<8} attempts={} last-seen={}",
                    status_colored(fault.status),
                    fault.key.to_string().bold(),
                    fault.severity.as_str(),
                    fault.attempts,
                    fault.last_seen.format("%Y-%m-%d %H:%M:%S"),
                );
            }
        }

        Commands::Detail { category, resource } => {
            let detail = client.fault_detail(&category, &resource).await?;
            let fault = &detail.fault;
            println!("{}", fault.key.to_string().bold());
            println!("  status       {}", status_colored(fault.status));
            println!("  severity     {}", fault.severity.as_str());
            println!("  first seen   {}", fault.first_detected);
            println!("  last seen    {}", fault.last_seen);
            println!("  attempts     {}", fault.attempts);
            if let Some(next) = fault.next_retry {
                println!("  next retry   {}", next);
            }
            if !fault.evidence.is_empty() {
                println!("  evidence     {}", fault.evidence);
            }
            if detail.attempts.is_empty() {
                println!("\n  No healing attempts recorded.");
            } else {
                println!("\n  {} attempt(s):", detail.attempts.len());
                for attempt in &detail.attempts {
                    println!(
                        "  #{} {:<22} {:<20} {}",
                        attempt.sequence,
                        attempt.action,
                        format!("{:?}", attempt.outcome),
                        attempt.started_at.format("%Y-%m-%d %H:%M:%S"),
                    );
                    if !attempt.diagnostic.is_empty() {
                        println!("     {}", attempt.diagnostic.dimmed());
                    }
                }
            }
        }

        Commands::Heal { category, resource } => {
            let response = client.heal(&category, &resource).await?;
            if response.accepted {
                println!("{} healing attempt started", "accepted:".green().bold());
            } else {
                println!(
                    "{} {}",
                    "rejected:".red().bold(),
                    response.reason.unwrap_or_else(|| "unknown reason".into())
                );
            }
        }

        Commands::Reset { category, resource } => {
            client.reset(&category, &resource).await?;
            println!(
                "{} {}/{} granted a fresh attempt budget",
                "reset:".green().bold(),
                category,
                resource
            );
        }

        Commands::Stats { window } => {
            let stats = client.stats(window).await?;
            println!("{} (last {}s)", "Healing statistics".bold(), stats.window_secs);
            println!("  attempts    {}", stats.total_attempts);
            println!("  succeeded   {}", stats.success_count.green());
            println!("  failed      {}", stats.failure_count.red());
            println!("  escalated   {}", stats.escalated_count);
            println!("  success     {:.1}%", stats.success_rate_percent);
        }

        Commands::Report {
            category,
            resource,
            severity,
            evidence,
        } => {
            let category = parse_category(&category)?;
            let severity = parse_severity(&severity)?;
            let response = client
                .report(category, &resource, severity, &evidence)
                .await?;
            println!("reported fault {}", response.fault_id.bold());
        }

        Commands::Resolve { category, resource } => {
            let category = parse_category(&category)?;
            let response = client.resolve(category, &resource).await?;
            println!("marked {} resolved", response.fault_id.bold());
        }
    }

    Ok(())
}
