//! Supervisor Module
//!
//! Launches the worker pool on disjoint partitions, restarts crashed
//! workers within the restart budget, reports fleet telemetry and shuts
//! everything down within a bounded time.
//!
//! ```text
//! SupervisorConfig ──► plan_workers ──► Supervisor::launch
//!                                            │
//!                          run(): check_workers every health_interval
//!                                            │
//!                          shutdown(): stop ─► grace ─► kill ─► release
//!
//! run_fleet(): launch ─► run ─► shutdown, driven by an interrupt counter
//!
//! TelemetryAggregator ──► DashboardReporter ──► Text | JsonLines | Tui
//! ```

pub mod config;
pub mod dashboard;
pub mod fleet;
pub mod plan;
#[allow(clippy::module_inception)]
pub mod supervisor;
pub mod tui;

pub use config::{
    DashboardSettings, DashboardSinkKind, PartitionRange, PipelineMode, RestartPolicy,
    SupervisorConfig, SupervisorSettings,
};
pub use dashboard::{
    summarize, DashboardReport, DashboardReporter, DashboardSink, Indicator, JsonLinesSink,
    TextSink, WorkerSummary,
};
pub use fleet::{interrupted, run_fleet, FleetExit, FleetReport};
pub use plan::{plan_workers, FleetPlan};
pub use supervisor::{
    HealthReport, LaunchReport, ShutdownReport, SlotState, SlotStatus, Supervisor,
    SupervisorOutcome,
};
pub use tui::TuiSink;
