//! Fleet Run
//!
//! One complete supervisor run: launch, monitor, shut down, report.
//!
//! Interrupts arrive as a counter in a `watch` channel (the binary bumps it
//! on every Ctrl-C). The first interrupt stops the fleet, also in the middle
//! of a staggered launch; the next one forces termination. Shutdown runs
//! exactly once on every path, so no worker outlives the run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::config::SupervisorConfig;
use super::dashboard::{DashboardReporter, DashboardSink};
use super::supervisor::{LaunchReport, ShutdownReport, Supervisor, SupervisorOutcome};
use crate::telemetry::{telemetry_channel, TelemetryAggregator, TelemetrySnapshot};
use crate::worker::PipelineFactory;

/// Time the telemetry ingest gets to drain once the workers are gone.
const INGEST_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How a fleet run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetExit {
    /// Workers finished, or the operator stopped the fleet
    Clean,
    /// Too few workers could be started
    LaunchFailed(String),
    /// These slots used up their restart budget
    BudgetExhausted(Vec<usize>),
}

impl FleetExit {
    /// Process exit code.
    pub fn code(&self) -> i32 {
        match self {
            FleetExit::Clean => 0,
            FleetExit::LaunchFailed(_) | FleetExit::BudgetExhausted(_) => 1,
        }
    }
}

/// Summary of one fleet run.
#[derive(Debug)]
pub struct FleetReport {
    pub exit: FleetExit,
    /// `None` when the launch failed or was interrupted
    pub launch: Option<LaunchReport>,
    /// `None` when monitoring never started
    pub outcome: Option<SupervisorOutcome>,
    pub shutdown: ShutdownReport,
    /// Telemetry after the ingest drained
    pub snapshot: TelemetrySnapshot,
    /// Interrupts seen during the run
    pub interrupts: u32,
}

/// Resolves once `count` interrupts have been seen. Never resolves if the
/// sender goes away first.
pub async fn interrupted(mut interrupts: watch::Receiver<u32>, count: u32) {
    let reached = interrupts.wait_for(|seen| *seen >= count).await.map(|_| ());
    if reached.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run the configured fleet to completion.
pub async fn run_fleet(
    config: &SupervisorConfig,
    factory: Arc<dyn PipelineFactory>,
    sink: Box<dyn DashboardSink>,
    interrupts: watch::Receiver<u32>,
) -> FleetReport {
    let n = config.fleet.num_workers;

    // Telemetry: workers -> bounded channel -> aggregator
    let aggregator = Arc::new(TelemetryAggregator::new(config.supervision.rate_window));
    let (bus, ingest) = telemetry_channel(
        Arc::clone(&aggregator),
        config.supervision.channel_capacity,
    );
    let ingest_task = tokio::spawn(ingest.run());

    let mut supervisor = Supervisor::new(config.to_settings(), factory, bus);
    let plan = config.fleet_plan();

    info!("Launching {} workers...", n);
    let launched = tokio::select! {
        biased;
        _ = interrupted(interrupts.clone(), 1) => {
            warn!("Interrupted during launch");
            None
        }
        result = supervisor.launch(n, config.fleet.partitions, &plan) => Some(result),
    };

    let mut exit = FleetExit::Clean;
    let mut launch = None;
    let mut outcome = None;
    let mut dashboard = None;

    match launched {
        Some(Ok(report)) => {
            for (index, reason) in &report.failed {
                warn!("Worker {} did not start: {}", index, reason);
            }
            info!("✓ {}/{} workers started", report.started.len(), n);

            let reporter = DashboardReporter::new(
                Arc::clone(&aggregator),
                config.to_dashboard_settings(),
                n,
                supervisor.partition_map(),
                sink,
            );
            let (stop_dashboard, dashboard_stop_rx) = watch::channel(false);
            dashboard = Some((stop_dashboard, tokio::spawn(reporter.run(dashboard_stop_rx))));
            launch = Some(report);

            let result = supervisor.run(interrupted(interrupts.clone(), 1)).await;
            match result {
                SupervisorOutcome::Interrupted => {
                    info!("Stopping workers (Ctrl-C again to force)...")
                }
                SupervisorOutcome::AllStopped => info!("All workers have stopped"),
            }
            outcome = Some(result);
        }
        Some(Err(e)) => {
            error!("✗ Failed to start workers: {}", e);
            exit = FleetExit::LaunchFailed(e.to_string());
            drop(sink);
        }
        None => drop(sink),
    }

    // Any interrupt from here on forces termination
    let seen = *interrupts.borrow();
    let shutdown = supervisor
        .shutdown(interrupted(interrupts.clone(), seen + 1))
        .await;
    info!(
        "Shutdown complete in {:?}: {} stopped, {} killed",
        shutdown.elapsed,
        shutdown.stopped.len(),
        shutdown.killed.len()
    );
    if !shutdown.force_released.is_empty() {
        warn!("Force-released partitions: {:?}", shutdown.force_released);
    }

    if let Some((stop_dashboard, dashboard_task)) = dashboard {
        let _ = stop_dashboard.send(true);
        match dashboard_task.await {
            Ok(Ok(reports)) => info!("Dashboard rendered {} reports", reports),
            Ok(Err(e)) => warn!("Dashboard failed: {}", e),
            Err(e) => warn!("Dashboard task failed: {}", e),
        }
    }

    let exhausted = supervisor.exhausted_slots();
    if exit == FleetExit::Clean && !exhausted.is_empty() {
        error!("✗ Workers {:?} exhausted their restart budget", exhausted);
        exit = FleetExit::BudgetExhausted(exhausted);
    }

    drop(supervisor);
    match tokio::time::timeout(INGEST_DRAIN_TIMEOUT, ingest_task).await {
        Ok(Ok(ingested)) => info!("Ingested {} telemetry samples", ingested),
        Ok(Err(e)) => warn!("Telemetry ingest task failed: {}", e),
        Err(_) => warn!("Telemetry ingest did not drain in time"),
    }

    let interrupts = *interrupts.borrow();
    FleetReport {
        exit,
        launch,
        outcome,
        shutdown,
        snapshot: aggregator.snapshot(),
        interrupts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::config::RestartPolicy;
    use crate::supervisor::dashboard::TextSink;
    use crate::worker::{SyntheticConfig, SyntheticFactory};
    use tokio::time::Instant;

    fn config(num_workers: usize) -> SupervisorConfig {
        let mut config = SupervisorConfig::default();
        config.fleet.num_workers = num_workers;
        config.supervision.stagger_ms = 0;
        config.supervision.health_interval_ms = 50;
        config.supervision.grace_period_ms = 500;
        config.supervision.kill_timeout_ms = 300;
        config.dashboard.warmup_secs = 0;
        config
    }

    fn sink() -> Box<dyn DashboardSink> {
        Box::new(TextSink::new(Vec::new()))
    }

    /// Bump the interrupt counter after each delay.
    async fn interrupt_after(tx: &watch::Sender<u32>, delays: &[u64]) {
        for delay in delays {
            tokio::time::sleep(Duration::from_millis(*delay)).await;
            tx.send_modify(|seen| *seen += 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interrupt_stops_fleet_cleanly() {
        let factory = SyntheticFactory::new(SyntheticConfig::default().with_fps(100.0));
        let config = config(2);
        let (tx, rx) = watch::channel(0u32);

        let (report, ()) = tokio::join!(
            run_fleet(&config, Arc::new(factory), sink(), rx),
            interrupt_after(&tx, &[300]),
        );

        assert_eq!(report.exit, FleetExit::Clean);
        assert_eq!(report.exit.code(), 0);
        assert_eq!(report.outcome, Some(SupervisorOutcome::Interrupted));
        assert_eq!(report.launch.unwrap().started, vec![0, 1]);
        assert_eq!(report.shutdown.stopped, vec![0, 1]);
        assert!(report.shutdown.killed.is_empty());
        assert!(report.shutdown.force_released.is_empty());
        assert_eq!(report.interrupts, 1);
        for index in 0..2 {
            assert!(report.snapshot.get(index).unwrap().total_frames > 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interrupt_during_staggered_launch() {
        let factory = SyntheticFactory::new(SyntheticConfig::default().with_fps(100.0));
        let mut config = config(3);
        config.supervision.stagger_ms = 400;
        let (tx, rx) = watch::channel(0u32);

        let start = Instant::now();
        let (report, ()) = tokio::join!(
            run_fleet(&config, Arc::new(factory), sink(), rx),
            interrupt_after(&tx, &[100]),
        );

        assert!(start.elapsed() < Duration::from_millis(700), "took {:?}", start.elapsed());
        assert_eq!(report.exit.code(), 0);
        assert!(report.launch.is_none());
        assert!(report.outcome.is_none());
        // Only the first worker was started, and it was stopped
        assert_eq!(report.shutdown.stopped, vec![0]);
        assert!(report.shutdown.force_released.is_empty());
        assert!(report.snapshot.get(1).is_none());
        assert!(report.snapshot.get(2).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_second_interrupt_forces_termination() {
        let factory = SyntheticFactory::new(
            SyntheticConfig::default().with_fps(50.0).with_hang(true),
        );
        let mut config = config(1);
        config.supervision.grace_period_ms = 30_000;
        let (tx, rx) = watch::channel(0u32);

        let start = Instant::now();
        let (report, ()) = tokio::join!(
            run_fleet(&config, Arc::new(factory), sink(), rx),
            interrupt_after(&tx, &[200, 200]),
        );

        assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
        assert_eq!(report.shutdown.killed, vec![0]);
        assert_eq!(report.interrupts, 2);
        assert_eq!(report.exit, FleetExit::Clean);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_launch_failure_exits_nonzero() {
        let factory = SyntheticFactory::new(SyntheticConfig::default().with_fps(100.0))
            .with_launch_failure(1);
        let config = config(2);
        let (_tx, rx) = watch::channel(0u32);

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            run_fleet(&config, Arc::new(factory), sink(), rx),
        )
        .await
        .unwrap();

        assert!(matches!(report.exit, FleetExit::LaunchFailed(_)));
        assert_eq!(report.exit.code(), 1);
        assert!(report.outcome.is_none());
        // The worker that did start is not left behind
        assert_eq!(report.shutdown.stopped, vec![0]);
        assert!(report.shutdown.force_released.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exhausted_budget_exits_nonzero() {
        let factory = SyntheticFactory::new(
            SyntheticConfig::default()
                .with_fps(100.0)
                .with_fail_after(Duration::from_millis(100)),
        );
        let mut config = config(2);
        config.supervision.restart_policy = RestartPolicy::Never;
        let (_tx, rx) = watch::channel(0u32);

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            run_fleet(&config, Arc::new(factory), sink(), rx),
        )
        .await
        .unwrap();

        assert_eq!(report.outcome, Some(SupervisorOutcome::AllStopped));
        assert_eq!(report.exit, FleetExit::BudgetExhausted(vec![0, 1]));
        assert_eq!(report.exit.code(), 1);
    }
}
