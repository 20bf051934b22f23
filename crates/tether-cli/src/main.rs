//! `tether` – robot connection supervisor CLI
//!
//! 1. Loads `~/.tether/config.toml`, writing the defaults on first run.
//! 2. Picks the transport: the rosbridge WebSocket, or `--sim` for the
//!    in-process simulated robot.
//! 3. Runs one of:
//!    - `diagnose` – pre-flight report; the exit code is the issue count.
//!    - `monitor`  – supervise the capabilities and print transitions.
//!    - `run`      – full system with the head-touch and person-detection
//!      handlers and an operator console.
//! 4. Intercepts **Ctrl-C** and shuts down gracefully.

mod config;
mod console;
mod handlers;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tether_kernel::{ConnectionSupervisor, DiagnosticReport, Diagnostics, build_resilient_system};
use tether_middleware::sim::SIM_ENDPOINT;
use tether_middleware::{PresenceBus, ProxyFactory, RosbridgeProxyFactory, SimRobot};
use tether_types::{CapabilityName, PresenceEvent, TetherError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::handlers::{HeadTapped, PersonDetector};

#[derive(Parser)]
#[command(name = "tether", version, about = "Keeps a robot's remote services usable")]
struct Cli {
    /// Use the in-process simulated robot instead of the network.
    #[arg(long, global = true)]
    sim: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check connectivity, services, the event system and module lifecycle.
    Diagnose {
        /// After the report, supervise the capabilities for this many seconds.
        #[arg(long, value_name = "SECS")]
        monitor: Option<u64>,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Supervise the configured capabilities and report transitions.
    Monitor {
        #[arg(long, value_name = "SECS", default_value_t = 30)]
        duration: u64,
    },
    /// Start the handlers and the operator console.
    Run,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Installed before the runtime exists; held until exit so pending spans
    // are flushed.
    let _tracing = telemetry::init_tracing("tether");

    print_banner();

    let cfg = load_config();
    let (supervisor_config, factory) = transport(&cfg, cli.sim);

    let shutdown = CancellationToken::new();
    let shutdown_ctrlc = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_ctrlc.cancel();
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let code = runtime.block_on(async move {
        match cli.command {
            Command::Diagnose { monitor, json } => {
                let report = Diagnostics::new(Arc::clone(&factory))
                    .with_probes(cfg.probe_registry())
                    .with_call_timeout(cfg.call_timeout())
                    .with_event_capability(cfg.event_capability.as_str())
                    .run()
                    .await;
                if json {
                    match serde_json::to_string_pretty(&report) {
                        Ok(text) => println!("{text}"),
                        Err(e) => eprintln!("{}: {}", "Could not encode report".red(), e),
                    }
                } else {
                    print_report(&report);
                }
                if let Some(secs) = monitor {
                    let supervisor = Arc::new(ConnectionSupervisor::new(supervisor_config, factory));
                    monitor_for(&supervisor, Duration::from_secs(secs), &shutdown).await;
                }
                ExitCode::from(u8::try_from(report.issue_count()).unwrap_or(u8::MAX))
            }
            Command::Monitor { duration } => {
                let supervisor = Arc::new(ConnectionSupervisor::new(supervisor_config, factory));
                monitor_for(&supervisor, Duration::from_secs(duration), &shutdown).await;
                ExitCode::SUCCESS
            }
            Command::Run => match run(supervisor_config, factory, &cfg, &shutdown).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    ExitCode::FAILURE
                }
            },
        }
    });

    // The console's stdin reader sits on a blocking thread that cannot be
    // interrupted; do not wait on it.
    runtime.shutdown_timeout(Duration::from_millis(200));
    code
}

fn load_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

fn transport(
    cfg: &config::Config,
    sim: bool,
) -> (tether_kernel::SupervisorConfig, Arc<dyn ProxyFactory>) {
    let mut supervisor_config = cfg.supervisor_config();
    if sim {
        println!("  Transport: {}", "simulated robot".yellow());
        supervisor_config.endpoint = SIM_ENDPOINT.to_string();
        (supervisor_config, Arc::new(SimRobot::new()))
    } else {
        let factory = RosbridgeProxyFactory::new(cfg.endpoint());
        println!("  Transport: {}", factory.url().dimmed());
        (supervisor_config, Arc::new(factory))
    }
}

/// Print every disconnect and every edge back to Connected of `capability`.
fn watch_transitions(
    supervisor: &ConnectionSupervisor,
    capability: &CapabilityName,
) -> Result<(), TetherError> {
    supervisor.add_disconnect_callback(capability, |name: CapabilityName| async move {
        println!("  {} {}", "✗ disconnected:".red(), name);
        Ok::<(), TetherError>(())
    })?;
    supervisor.add_reconnect_callback(capability, |name: CapabilityName| async move {
        println!("  {} {}", "✓ connected:".green(), name);
        Ok::<(), TetherError>(())
    })
}

/// Supervise until `duration` elapses or `shutdown` fires, printing every
/// transition, then print the final table.
async fn monitor_for(
    supervisor: &Arc<ConnectionSupervisor>,
    duration: Duration,
    shutdown: &CancellationToken,
) {
    for capability in supervisor.capabilities().to_vec() {
        if let Err(e) = watch_transitions(supervisor, &capability) {
            warn!(capability = %capability, error = %e, "could not watch capability");
        }
    }

    println!(
        "\n  Monitoring {} capabilities at {} for {}s …\n",
        supervisor.capabilities().len(),
        supervisor.endpoint().bold(),
        duration.as_secs()
    );
    supervisor.start_monitoring();
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.cancelled() => {}
    }
    supervisor.stop_monitoring().await;

    println!("\n{}", "Final status".bold().underline());
    console::print_status(&supervisor.status());
}

async fn run(
    supervisor_config: tether_kernel::SupervisorConfig,
    factory: Arc<dyn ProxyFactory>,
    cfg: &config::Config,
    shutdown: &CancellationToken,
) -> Result<(), TetherError> {
    let system = build_resilient_system(supervisor_config, factory, cfg.event_capability.as_str())?;
    let presence = PresenceBus::new();

    let head = HeadTapped::new(system.consumer("HeadTapped"), presence.clone());
    let detector = PersonDetector::new(system.consumer("PersonDetector"));
    head.start().await;
    detector.start().await;

    let mut changes = presence.subscribe();
    let presence_log = tokio::spawn(async move {
        while let Some(event) = changes.changed().await {
            match event {
                PresenceEvent::Arrived => info!("person engaged"),
                PresenceEvent::Left => info!("person disengaged"),
            }
        }
    });

    println!(
        "\n  Type {} for a list of commands.\n",
        "help".bold().cyan()
    );
    console::Session {
        supervisor: system.supervisor(),
        head: &head,
        detector: &detector,
        presence: &presence,
    }
    .run(shutdown)
    .await;

    let report = system
        .shutdown(&[head.handler_id().clone(), detector.handler_id().clone()])
        .await;
    presence_log.abort();

    if report.is_clean() {
        println!("  {} Unsubscribed {} event(s).", "✓".green(), report.removed);
    } else {
        for failure in &report.failures {
            println!(
                "  {} {} ({}): {}",
                "✗".red(),
                failure.event,
                failure.handler,
                failure.reason
            );
        }
    }
    Ok(())
}

fn print_report(report: &DiagnosticReport) {
    println!();
    println!("{}", "Diagnostic Report".bold().underline());
    println!("  Endpoint     : {}", report.endpoint.bold());
    println!("  Started      : {}", report.started_at.to_rfc3339());
    println!("  Duration     : {} ms", report.elapsed_ms);
    println!("  Connectivity : {}", ok_label(report.connectivity));

    println!("\n  Services:");
    for check in &report.services {
        let tag = if check.critical { "critical" } else { "optional" };
        let line = format!("    {} ({})", check.capability, tag.dimmed());
        match &check.error {
            None if check.available => println!("{line}: {}", "available".green()),
            Some(err) => println!("{line}: {} {}", "unavailable".red(), err.dimmed()),
            None => println!("{line}: {}", "unavailable".red()),
        }
    }
    println!("\n  Event system     : {}", ok_label(report.event_system));
    println!("  Module lifecycle : {}", ok_label(report.module_lifecycle));

    if report.is_healthy() {
        println!("\n  {}", "✓ No issues found.".green().bold());
        return;
    }

    println!("\n  {} ({}):", "Issues".bold(), report.issue_count());
    for issue in &report.issues {
        println!("    • {issue}");
    }
    println!("\n  {}:", "Recommendations".bold());
    for rec in &report.recommendations {
        println!("    → {rec}");
    }
}

fn ok_label(ok: bool) -> colored::ColoredString {
    if ok { "OK".green() } else { "FAILED".red() }
}

fn print_banner() {
    println!();
    println!("{}", r#"  ______     __  __             "#.bold().cyan());
    println!("{}", r#" /_  __/__  / /_/ /  ___  ____ "#.bold().cyan());
    println!("{}", r#"  / / / -_)/ __/ _ \/ -_)/ __/ "#.bold().cyan());
    println!("{}", r#" /_/  \__/ \__/_//_/\__//_/    "#.bold().cyan());
    println!();
    println!("  {} v{}", "Tether".bold(), env!("CARGO_PKG_VERSION"));
    println!();
}
