//! Worker Supervisor
//!
//! Owns the worker pool: partition assignment, staggered launch, health
//! checks with restart-on-crash, and bounded shutdown.
//!
//! Per-slot state machine:
//!
//! ```text
//! Unassigned ──► Starting ──► Running ──► Stopping ──► Terminated
//!                   ▲  │         │
//!                   │  └─────────┴──► Crashed ──► (budget left?) ──► Starting
//!                   │                                   │ no
//!                   └── restart ◄───────────────────────┘──► Failed
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{unix_now, Liveness, PartitionId, WorkerSpec};
use futures::future::join_all;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::config::{PartitionRange, SupervisorSettings};
use super::plan::{plan_workers, FleetPlan};
use crate::base::error::{Error, Result};
use crate::telemetry::{TelemetryAggregator, TelemetryBus};
use crate::worker::{build_launch_description, PartitionTable, PipelineFactory, Worker, WorkerHandle};

/// Supervisor-side state of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unassigned,
    Starting,
    Running,
    Crashed,
    Stopping,
    Terminated,
    Failed,
}

impl SlotState {
    /// Whether the slot may still process frames now or after a restart.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SlotState::Starting | SlotState::Running | SlotState::Crashed | SlotState::Stopping
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            SlotState::Unassigned => "Unassigned",
            SlotState::Starting => "Starting",
            SlotState::Running => "Running",
            SlotState::Crashed => "Crashed",
            SlotState::Stopping => "Stopping",
            SlotState::Terminated => "Terminated",
            SlotState::Failed => "Failed",
        }
    }
}

/// Read-only view of a slot.
#[derive(Debug, Clone)]
pub struct SlotStatus {
    pub index: usize,
    pub partition: PartitionId,
    pub display: bool,
    pub state: SlotState,
    pub liveness: Option<Liveness>,
    pub restart_count: u32,
    pub generation: u32,
    pub last_error: Option<String>,
}

struct WorkerSlot {
    spec: Arc<WorkerSpec>,
    launch: String,
    state: SlotState,
    restart_count: u32,
    generation: u32,
    handle: Option<WorkerHandle>,
    /// Wall-clock start of the current instance
    started_wall: f64,
    last_error: Option<String>,
    budget_exhausted: bool,
}

/// Result of `launch()`.
#[derive(Debug, Clone, Default)]
pub struct LaunchReport {
    pub started: Vec<usize>,
    pub failed: Vec<(usize, String)>,
}

/// Result of one health check.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub running: usize,
    pub starting: usize,
    /// Slots restarted during this check
    pub restarted: Vec<usize>,
    /// Slots that became permanently failed during this check
    pub failed: Vec<usize>,
    /// Slots that reached end of stream during this check
    pub exited: Vec<usize>,
    /// Slots that can still run
    pub active: usize,
}

/// Why `run()` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The shutdown signal fired
    Interrupted,
    /// No slot can run anymore
    AllStopped,
}

/// Result of `shutdown()`.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Workers that reached a terminal state within the grace period
    pub stopped: Vec<usize>,
    /// Workers that had to be killed
    pub killed: Vec<usize>,
    /// Partitions still held after all workers were gone
    pub force_released: Vec<PartitionId>,
    pub elapsed: Duration,
}

/// Worker pool supervisor
pub struct Supervisor {
    settings: SupervisorSettings,
    factory: Arc<dyn PipelineFactory>,
    partitions: Arc<PartitionTable>,
    aggregator: Arc<TelemetryAggregator>,
    bus: TelemetryBus,
    slots: Vec<WorkerSlot>,
    last_health: Option<(usize, usize)>,
    shut_down: bool,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        factory: Arc<dyn PipelineFactory>,
        bus: TelemetryBus,
    ) -> Self {
        let partitions = Arc::new(PartitionTable::new(settings.max_partitions));
        let aggregator = Arc::clone(bus.aggregator());
        Self {
            settings,
            factory,
            partitions,
            aggregator,
            bus,
            slots: Vec::new(),
            last_health: None,
            shut_down: false,
        }
    }

    pub fn aggregator(&self) -> &Arc<TelemetryAggregator> {
        &self.aggregator
    }

    pub fn partitions(&self) -> &Arc<PartitionTable> {
        &self.partitions
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    // ------------------------------------------------------------------------
    // Launch
    // ------------------------------------------------------------------------

    /// Launch `n` workers on `range`, worker `i` on partition `range.first + i`.
    ///
    /// Workers are started one after another with the configured stagger. A
    /// worker that cannot be started fails its slot and is not retried. When
    /// fewer than `min_workers` started, returns `LaunchFailure`; workers
    /// that did start keep running until `shutdown()`.
    pub async fn launch(
        &mut self,
        n: usize,
        range: PartitionRange,
        plan: &FleetPlan,
    ) -> Result<LaunchReport> {
        if !self.slots.is_empty() {
            return Err(Error::InvalidArgument("workers already launched".to_string()));
        }
        let capacity = self.settings.max_partitions;
        if range.first == 0 || range.last > capacity {
            return Err(Error::InvalidArgument(format!(
                "partition range {} is outside 1-{}",
                range, capacity
            )));
        }

        let specs = plan_workers(n, range, plan)?;
        info!("Launching {} workers on partitions {}", n, range);

        self.slots = specs
            .into_iter()
            .map(|spec| WorkerSlot {
                launch: build_launch_description(&spec, &self.settings.video_format),
                spec: Arc::new(spec),
                state: SlotState::Unassigned,
                restart_count: 0,
                generation: 0,
                handle: None,
                started_wall: 0.0,
                last_error: None,
                budget_exhausted: false,
            })
            .collect();

        let mut report = LaunchReport::default();
        for index in 0..n {
            if index > 0 && !self.settings.stagger.is_zero() {
                tokio::time::sleep(self.settings.stagger).await;
            }
            match self.start_slot(index) {
                Ok(()) => report.started.push(index),
                Err(e) => {
                    error!("worker-{} failed to start: {}", index, e);
                    report.failed.push((index, e.to_string()));
                }
            }
        }

        let min_workers = self.settings.min_workers.unwrap_or(n).min(n);
        info!("{}/{} workers started", report.started.len(), n);
        if report.started.len() < min_workers {
            let worker = report.failed.first().map(|(i, _)| *i).unwrap_or(0);
            return Err(Error::LaunchFailure {
                worker,
                reason: format!(
                    "only {} of {} workers started (minimum {})",
                    report.started.len(),
                    n,
                    min_workers
                ),
            });
        }
        Ok(report)
    }

    /// Start a new instance for slot `index`. Marks the slot failed on error.
    fn start_slot(&mut self, index: usize) -> Result<()> {
        let slot = &mut self.slots[index];
        self.aggregator.begin_instance(index, slot.generation);

        let started = Worker::start(
            Arc::clone(&slot.spec),
            slot.generation,
            &slot.launch,
            self.factory.as_ref(),
            &self.partitions,
            &self.bus,
        );

        match started {
            Ok(handle) => {
                slot.handle = Some(handle);
                slot.state = SlotState::Starting;
                slot.started_wall = unix_now();
                Ok(())
            }
            Err(e) => {
                slot.handle = None;
                slot.state = SlotState::Failed;
                slot.last_error = Some(e.to_string());
                self.aggregator
                    .mark_liveness(index, Liveness::Crashed(e.to_string()));
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------------

    /// One health-loop tick.
    ///
    /// Promotes instances that produced a frame, kills instances that never
    /// start or go silent, restarts crashed instances within the budget and
    /// retires slots that reached end of stream.
    pub fn check_workers(&mut self) -> HealthReport {
        let mut report = HealthReport::default();
        let now = Instant::now();
        let wall = unix_now();

        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if !matches!(slot.state, SlotState::Starting | SlotState::Running) {
                continue;
            }
            let Some(handle) = slot.handle.as_ref() else {
                continue;
            };

            let crash_reason = match handle.liveness() {
                Liveness::Starting => {
                    let waited = now.duration_since(handle.started_at());
                    if waited > self.settings.startup_timeout {
                        handle.kill();
                        Some(format!("no frame within {:?}", self.settings.startup_timeout))
                    } else {
                        None
                    }
                }
                Liveness::Running => {
                    if slot.state == SlotState::Starting {
                        slot.state = SlotState::Running;
                        self.aggregator.mark_liveness(index, Liveness::Running);
                        info!("worker-{} running on partition {}", index, slot.spec.partition);
                    }
                    let last = self
                        .aggregator
                        .last_sample_at(index)
                        .map_or(slot.started_wall, |t| t.max(slot.started_wall));
                    let silent = wall - last;
                    if silent > self.settings.stall_timeout.as_secs_f64() {
                        handle.kill();
                        Some(format!("stalled: no frame for {:.1}s", silent))
                    } else {
                        None
                    }
                }
                Liveness::Stopping => None,
                Liveness::Exited(code) => {
                    info!("worker-{} finished (exit code {})", index, code);
                    self.aggregator.mark_liveness(index, Liveness::Exited(code));
                    slot.state = SlotState::Terminated;
                    slot.handle = None;
                    report.exited.push(index);
                    None
                }
                Liveness::Crashed(reason) => Some(reason),
            };

            if let Some(reason) = crash_reason {
                if self.handle_crash(index, Error::PipelineCrash(reason)) {
                    report.restarted.push(index);
                } else {
                    report.failed.push(index);
                }
            }
        }

        for slot in &self.slots {
            match slot.state {
                SlotState::Running => report.running += 1,
                SlotState::Starting => report.starting += 1,
                _ => {}
            }
            if slot.state.is_active() {
                report.active += 1;
            }
        }

        let total = self.slots.len();
        if self.last_health != Some((report.running, report.starting)) {
            if report.running < total && report.starting == 0 {
                warn!("Only {}/{} workers running", report.running, total);
            } else {
                debug!(
                    "{} running, {} starting of {}",
                    report.running, report.starting, total
                );
            }
            self.last_health = Some((report.running, report.starting));
        }

        report
    }

    /// Record a failure of slot `index` and restart it if the error is
    /// retryable and the budget allows. Returns whether a new instance was
    /// started.
    fn handle_crash(&mut self, index: usize, error: Error) -> bool {
        let budget = self.settings.restart_policy.budget();
        let slot = &mut self.slots[index];
        warn!("worker-{}: {}", index, error);

        let reason = match &error {
            Error::PipelineCrash(reason) => reason.clone(),
            other => other.to_string(),
        };
        slot.state = SlotState::Crashed;
        slot.handle = None;
        slot.last_error = Some(reason.clone());
        self.aggregator.mark_liveness(index, Liveness::Crashed(reason));

        if !error.is_retryable() {
            slot.state = SlotState::Failed;
            error!("worker-{} failed permanently, not restarting", index);
            return false;
        }
        if slot.restart_count >= budget {
            slot.state = SlotState::Failed;
            slot.budget_exhausted = true;
            warn!(
                "worker-{} exhausted its restart budget ({}), giving up",
                index, budget
            );
            return false;
        }

        slot.restart_count += 1;
        slot.generation += 1;
        info!(
            "Restarting worker-{} on partition {} (attempt {}/{})",
            index, slot.spec.partition, slot.restart_count, budget
        );

        match self.start_slot(index) {
            Ok(()) => true,
            Err(e) => {
                error!("worker-{} could not be restarted: {}", index, e);
                false
            }
        }
    }

    /// Health loop: checks workers every `health_interval` until `shutdown`
    /// resolves or no slot can run anymore.
    pub async fn run<F>(&mut self, shutdown: F) -> SupervisorOutcome
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.settings.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("Monitoring workers (every {:?})", self.settings.health_interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    return SupervisorOutcome::Interrupted;
                }
                _ = ticker.tick() => {
                    let report = self.check_workers();
                    if report.active == 0 {
                        info!("No worker can run anymore");
                        return SupervisorOutcome::AllStopped;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Stop every worker, kill stragglers, release every partition.
    ///
    /// Returns within `grace_period + kill_timeout`. If `expedite` resolves
    /// during the grace period, stragglers are killed right away. Runs once;
    /// later calls return an empty report.
    pub async fn shutdown<F>(&mut self, expedite: F) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();
        let mut report = ShutdownReport::default();
        if self.shut_down {
            return report;
        }
        self.shut_down = true;

        let grace = self.settings.grace_period;
        let kill_timeout = self.settings.kill_timeout;
        info!("Shutting down all workers (grace {:?})", grace);

        // Stop everything at once
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(handle) = slot.handle.as_ref() {
                if !handle.liveness().is_terminal() {
                    handle.stop();
                    slot.state = SlotState::Stopping;
                    self.aggregator.mark_liveness(index, Liveness::Stopping);
                }
            }
        }

        {
            let waits = join_all(
                self.slots
                    .iter()
                    .filter_map(|slot| slot.handle.as_ref())
                    .map(|handle| handle.terminated()),
            );
            tokio::pin!(expedite);
            tokio::select! {
                _ = waits => {}
                _ = tokio::time::sleep(grace) => {}
                _ = &mut expedite => {
                    warn!("Second interrupt, forcing termination");
                }
            }
        }

        for (index, slot) in self.slots.iter().enumerate() {
            let Some(handle) = slot.handle.as_ref() else {
                continue;
            };
            if handle.liveness().is_terminal() {
                report.stopped.push(index);
            } else {
                warn!(
                    "{}",
                    Error::ShutdownTimeout {
                        worker: index,
                        timeout: grace
                    }
                );
                handle.kill();
                report.killed.push(index);
            }
        }

        // Killed tasks unwind at their next await point
        let finished = join_all(
            self.slots
                .iter_mut()
                .filter_map(|slot| slot.handle.as_mut())
                .map(|handle| handle.finished()),
        );
        if tokio::time::timeout(kill_timeout, finished).await.is_err() {
            warn!("Some worker tasks did not finish within {:?}", kill_timeout);
        }

        for id in self.partitions.held() {
            if self.partitions.force_release(id).is_some() {
                report.force_released.push(id);
            }
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if let Some(handle) = slot.handle.take() {
                self.aggregator.mark_liveness(index, handle.liveness());
            }
            if slot.state != SlotState::Failed {
                slot.state = SlotState::Terminated;
            }
        }

        report.elapsed = started.elapsed();
        info!(
            "All workers stopped in {:?} ({} graceful, {} killed)",
            report.elapsed,
            report.stopped.len(),
            report.killed.len()
        );
        report
    }

    // ------------------------------------------------------------------------
    // Operator actions & queries
    // ------------------------------------------------------------------------

    /// Forcibly kill one worker. The next health check treats it as a crash.
    pub fn kill_worker(&mut self, index: usize) -> Result<()> {
        let handle = self
            .slots
            .get(index)
            .and_then(|slot| slot.handle.as_ref())
            .ok_or_else(|| Error::InvalidArgument(format!("worker-{} is not running", index)))?;
        warn!("Operator kill of worker-{}", index);
        handle.kill();
        Ok(())
    }

    /// Partitions bound to launched slots, in worker order.
    pub fn assigned_partitions(&self) -> Vec<PartitionId> {
        self.slots.iter().map(|slot| slot.spec.partition).collect()
    }

    /// `(worker index, partition)` of every slot.
    pub fn partition_map(&self) -> Vec<(usize, PartitionId)> {
        self.slots
            .iter()
            .map(|slot| (slot.spec.index, slot.spec.partition))
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Running)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(|slot| slot.state)
    }

    pub fn spec(&self, index: usize) -> Option<&WorkerSpec> {
        self.slots.get(index).map(|slot| slot.spec.as_ref())
    }

    pub fn status(&self) -> Vec<SlotStatus> {
        self.slots
            .iter()
            .map(|slot| SlotStatus {
                index: slot.spec.index,
                partition: slot.spec.partition,
                display: slot.spec.display,
                state: slot.state,
                liveness: slot.handle.as_ref().map(|h| h.liveness()),
                restart_count: slot.restart_count,
                generation: slot.generation,
                last_error: slot.last_error.clone(),
            })
            .collect()
    }

    /// Slots that crashed more often than the restart budget allows.
    pub fn exhausted_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|slot| slot.budget_exhausted)
            .map(|slot| slot.spec.index)
            .collect()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Best effort cleanup
        for slot in &self.slots {
            if let Some(handle) = slot.handle.as_ref() {
                handle.kill();
            }
        }
    }
}
