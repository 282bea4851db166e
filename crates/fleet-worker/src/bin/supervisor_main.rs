//! Detect Fleet Supervisor - Main Entry Point
//!
//! Runs N detection workers in parallel, one accelerator partition each,
//! restarts crashed workers and prints a periodic fleet dashboard.
//!
//! # Usage
//!
//! ```bash
//! # Four simulated workers on partitions 1-4
//! fleet-supervisor -n 4
//!
//! # Real pipelines, one camera per worker; the wrapper prints one
//! # {"detections": N} line per frame
//! fleet-supervisor -n 2 --mode command \
//!     --program ./hailo-detect-wrapper \
//!     --source /dev/video0,/dev/video2 \
//!     --model yolov11l.hef \
//!     --restart-policy on-failure:5
//!
//! # From a configuration file
//! fleet-supervisor --config-file fleet.yaml
//! ```
//!
//! Ctrl-C stops the fleet gracefully; a second Ctrl-C kills what is left.

use std::fs::OpenOptions;
use std::process;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use fleet_worker::supervisor::{
    run_fleet, DashboardSink, DashboardSinkKind, FleetExit, JsonLinesSink, PipelineMode,
    SupervisorConfig, TextSink, TuiSink,
};
use fleet_worker::worker::{CommandFactory, PipelineFactory, SyntheticFactory};

#[tokio::main]
async fn main() -> Result<()> {
    let config = SupervisorConfig::load().context("Failed to load configuration")?;

    init_logging(&config)?;

    // Before anything that can block, so an early Ctrl-C still stops the fleet
    let interrupts = listen_for_interrupts()?;

    let log_target = config
        .log_file()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "stderr".to_string());

    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              Detect Fleet Supervisor v0.1.0                ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Workers:     {:<44} ║", config.fleet.num_workers);
    println!("║  Partitions:  {:<44} ║", config.fleet.partitions.to_string());
    println!("║  Mode:        {:<44} ║", format!("{:?}", config.pipeline.mode));
    println!("║  Model:       {:<44} ║", truncate_str(&config.pipeline.models.join(","), 44));
    println!("║  Logs:        {:<44} ║", truncate_str(&log_target, 44));
    println!("╚════════════════════════════════════════════════════════════╝");
    config.print_summary();

    let factory: Arc<dyn PipelineFactory> = match config.pipeline.mode {
        PipelineMode::Synthetic => Arc::new(SyntheticFactory::new(config.synthetic_config())),
        PipelineMode::Command => Arc::new(CommandFactory::new(config.command_config()?)),
    };
    let sink = make_sink(config.dashboard.sink)?;

    let report = run_fleet(&config, factory, sink, interrupts).await;

    match &report.exit {
        FleetExit::Clean => {
            println!("[Supervisor] Shutdown complete.");
            Ok(())
        }
        FleetExit::LaunchFailed(reason) => {
            eprintln!("[Supervisor] Failed to start workers: {}", reason);
            process::exit(report.exit.code());
        }
        FleetExit::BudgetExhausted(slots) => {
            eprintln!("[Supervisor] Workers {:?} exhausted their restart budget", slots);
            process::exit(report.exit.code());
        }
    }
}

fn make_sink(kind: DashboardSinkKind) -> Result<Box<dyn DashboardSink>> {
    Ok(match kind {
        DashboardSinkKind::Text => Box::new(TextSink::stdout()),
        DashboardSinkKind::Json => Box::new(JsonLinesSink::stdout()),
        DashboardSinkKind::Tui => {
            Box::new(TuiSink::stdout().context("Failed to initialize terminal")?)
        }
    })
}

/// Count Ctrl-C presses for the fleet run.
fn listen_for_interrupts() -> Result<watch::Receiver<u32>> {
    let (tx, rx) = watch::channel(0u32);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        // Registered here rather than on first poll
        let mut sigint =
            signal(SignalKind::interrupt()).context("Unable to listen for shutdown signal")?;
        tokio::spawn(async move {
            while sigint.recv().await.is_some() {
                info!("Received Ctrl+C signal");
                tx.send_modify(|seen| *seen += 1);
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C signal");
                tx.send_modify(|seen| *seen += 1);
            }
        });
    }

    Ok(rx)
}

/// Initialize logging; `RUST_LOG` overrides the configured level.
///
/// Logs go to stderr, or to the log file when one is configured (always
/// for the tui dashboard, which owns the terminal).
fn init_logging(config: &SupervisorConfig) -> Result<()> {
    let logging_config = &config.logging;
    let level = match logging_config.log_level.as_str() {
        level @ ("trace" | "debug" | "info" | "warn" | "error") => level,
        other => {
            eprintln!("Invalid log level: {}, using 'info'", other);
            "info"
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, ansi) = match config.log_file() {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match logging_config.log_format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

/// Truncate string to max length with ellipsis
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
