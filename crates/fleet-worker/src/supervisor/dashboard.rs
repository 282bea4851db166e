//! Dashboard Reporter
//!
//! Periodically snapshots the aggregator and renders a fleet summary
//! through a `DashboardSink`. The summary itself is a pure function of the
//! snapshot, so it is equally happy with an empty or partial one.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{Liveness, PartitionId};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::config::DashboardSettings;
use crate::base::error::Result;
use crate::telemetry::{TelemetryAggregator, TelemetrySnapshot};

/// Per-worker performance relative to the frame rate ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Indicator {
    /// Above 2/3 of the ceiling
    Good,
    /// Above 1/3 of the ceiling
    Degraded,
    Poor,
}

impl Indicator {
    pub fn classify(rate: f64, ceiling: f64) -> Self {
        if rate > ceiling * 2.0 / 3.0 {
            Indicator::Good
        } else if rate > ceiling / 3.0 {
            Indicator::Degraded
        } else {
            Indicator::Poor
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Indicator::Good => "[ OK ]",
            Indicator::Degraded => "[SLOW]",
            Indicator::Poor => "[POOR]",
        }
    }
}

/// One dashboard row.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub index: usize,
    pub partition: Option<PartitionId>,
    pub liveness: Liveness,
    pub total_frames: u64,
    pub total_detections: u64,
    pub last_detections: u32,
    /// Sliding-window rate (fps)
    pub current_rate: f64,
    /// Lifetime frames / lifetime seconds (fps)
    pub average_rate: f64,
    pub uptime_secs: f64,
    pub restarts: u32,
    pub indicator: Indicator,
}

/// Fleet summary derived from one snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardReport {
    pub taken_at: f64,
    pub workers: Vec<WorkerSummary>,
    /// Workers the fleet was launched with
    pub configured: usize,
    pub running: usize,
    /// Sum of per-worker average rates
    pub combined_rate: f64,
    /// Sum of per-worker current rates
    pub combined_current_rate: f64,
    pub total_frames: u64,
    pub total_detections: u64,
    /// Combined rate against `reporting workers * fps_ceiling`, in percent
    pub efficiency_pct: f64,
    pub fps_ceiling: f64,
    pub dropped_samples: u64,
    /// Last report before shutdown
    pub is_final: bool,
}

impl DashboardReport {
    /// Fewer workers running than configured.
    pub fn is_degraded(&self) -> bool {
        self.running < self.configured
    }
}

/// Build the dashboard report of `snapshot`.
pub fn summarize(
    snapshot: &TelemetrySnapshot,
    fps_ceiling: f64,
    configured: usize,
    partitions: &[(usize, PartitionId)],
) -> DashboardReport {
    let now = snapshot.taken_at;

    let workers: Vec<WorkerSummary> = snapshot
        .workers
        .iter()
        .map(|stats| {
            let average_rate = stats.average_rate(now);
            WorkerSummary {
                index: stats.index,
                partition: partitions
                    .iter()
                    .find(|(index, _)| *index == stats.index)
                    .map(|(_, p)| *p),
                liveness: stats.liveness.clone(),
                total_frames: stats.total_frames,
                total_detections: stats.total_detections,
                last_detections: stats.last_detections,
                current_rate: stats.current_rate,
                average_rate,
                uptime_secs: stats.lifetime_secs(now),
                restarts: stats.restarts,
                indicator: Indicator::classify(average_rate, fps_ceiling),
            }
        })
        .collect();

    let combined_rate: f64 = workers.iter().map(|w| w.average_rate).sum();
    let efficiency_pct = if workers.is_empty() || fps_ceiling <= 0.0 {
        0.0
    } else {
        combined_rate / (workers.len() as f64 * fps_ceiling) * 100.0
    };

    DashboardReport {
        taken_at: now,
        configured,
        running: workers.iter().filter(|w| w.liveness.is_running()).count(),
        combined_current_rate: workers.iter().map(|w| w.current_rate).sum(),
        total_frames: workers.iter().map(|w| w.total_frames).sum(),
        total_detections: workers.iter().map(|w| w.total_detections).sum(),
        combined_rate,
        efficiency_pct,
        fps_ceiling,
        dropped_samples: snapshot.dropped_samples,
        is_final: false,
        workers,
    }
}

/// Format duration as human-readable string
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let mins = secs / 60;
    let hours = mins / 60;
    let days = hours / 24;

    if days > 0 {
        format!("{}d {:02}h", days, hours % 24)
    } else if hours > 0 {
        format!("{}h {:02}m", hours, mins % 60)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs % 60)
    } else {
        format!("{}s", secs)
    }
}

/// `1234567` -> `1,234,567`
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

// ----------------------------------------------------------------------------
// Sinks
// ----------------------------------------------------------------------------

/// Output of the dashboard reporter.
pub trait DashboardSink: Send {
    fn render(&mut self, report: &DashboardReport) -> Result<()>;

    /// Render the last report before shutdown.
    fn finish(&mut self, report: &DashboardReport) -> Result<()> {
        self.render(report)
    }
}

/// Plain-text dashboard.
pub struct TextSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl TextSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> DashboardSink for TextSink<W> {
    fn render(&mut self, report: &DashboardReport) -> Result<()> {
        let out = &mut self.out;
        let heavy = "=".repeat(80);
        let light = "-".repeat(80);

        writeln!(out)?;
        writeln!(out, "{}", heavy)?;
        if report.is_final {
            writeln!(out, "DETECT FLEET DASHBOARD (final)")?;
        } else {
            writeln!(out, "DETECT FLEET DASHBOARD")?;
        }
        writeln!(out, "{}", heavy)?;

        if report.workers.is_empty() {
            writeln!(out, "No telemetry yet")?;
        }
        for w in &report.workers {
            let partition = w
                .partition
                .map(|p| format!("p{}", p))
                .unwrap_or_else(|| "p?".to_string());
            writeln!(
                out,
                "{} worker-{} {:<3} {:<10} | Frames: {:>9} | Current FPS: {:6.1} | Average FPS: {:6.1} | Detections: {:>9} | Up: {} | Restarts: {}",
                w.indicator.tag(),
                w.index,
                partition,
                w.liveness.label(),
                group_thousands(w.total_frames),
                w.current_rate,
                w.average_rate,
                group_thousands(w.total_detections),
                format_duration(Duration::from_secs_f64(w.uptime_secs)),
                w.restarts,
            )?;
        }

        writeln!(out, "{}", light)?;
        writeln!(
            out,
            "SUMMARY: {} workers ({} running) | Combined FPS: {:.1} | Total Frames: {} | Total Detections: {}",
            report.workers.len(),
            report.running,
            report.combined_rate,
            group_thousands(report.total_frames),
            group_thousands(report.total_detections),
        )?;
        writeln!(
            out,
            "Efficiency: {:.1}% of theoretical max ({} FPS per worker)",
            report.efficiency_pct, report.fps_ceiling
        )?;
        if report.is_degraded() {
            writeln!(
                out,
                "Warning: Only {}/{} workers running",
                report.running, report.configured
            )?;
        }
        if report.dropped_samples > 0 {
            writeln!(
                out,
                "Dropped samples: {}",
                group_thousands(report.dropped_samples)
            )?;
        }
        writeln!(out, "{}", heavy)?;
        out.flush()?;
        Ok(())
    }
}

/// One JSON object per report, newline-delimited.
pub struct JsonLinesSink<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl JsonLinesSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> DashboardSink for JsonLinesSink<W> {
    fn render(&mut self, report: &DashboardReport) -> Result<()> {
        serde_json::to_writer(&mut self.out, report).map_err(io::Error::from)?;
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Reporter
// ----------------------------------------------------------------------------

/// Periodic, read-only consumer of the aggregator.
pub struct DashboardReporter {
    aggregator: Arc<TelemetryAggregator>,
    settings: DashboardSettings,
    configured: usize,
    partitions: Vec<(usize, PartitionId)>,
    sink: Box<dyn DashboardSink>,
}

impl DashboardReporter {
    pub fn new(
        aggregator: Arc<TelemetryAggregator>,
        settings: DashboardSettings,
        configured: usize,
        partitions: Vec<(usize, PartitionId)>,
        sink: Box<dyn DashboardSink>,
    ) -> Self {
        Self {
            aggregator,
            settings,
            configured,
            partitions,
            sink,
        }
    }

    fn build(&self, is_final: bool) -> DashboardReport {
        let snapshot = self.aggregator.snapshot();
        let mut report = summarize(
            &snapshot,
            self.settings.fps_ceiling,
            self.configured,
            &self.partitions,
        );
        report.is_final = is_final;
        report
    }

    /// Snapshot and render once.
    pub fn report(&mut self) -> Result<DashboardReport> {
        let report = self.build(false);
        self.sink.render(&report)?;
        Ok(report)
    }

    /// Report every interval after the warm-up until `stop` turns true (or
    /// its sender is dropped), then render a final report.
    ///
    /// Returns the number of reports rendered, the final one included.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<usize> {
        let mut rendered = 0usize;

        let stopped_early = tokio::select! {
            _ = stop.wait_for(|stop| *stop) => true,
            _ = tokio::time::sleep(self.settings.warmup) => false,
        };

        if !stopped_early {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop.wait_for(|stop| *stop) => break,
                    _ = ticker.tick() => {
                        match self.report() {
                            Ok(_) => rendered += 1,
                            Err(e) => warn!("Dashboard render failed: {}", e),
                        }
                    }
                }
            }
        }

        let report = self.build(true);
        self.sink.finish(&report)?;
        debug!("Dashboard reporter stopped after {} reports", rendered + 1);
        Ok(rendered + 1)
    }
}
