//! Supervisor Configuration
//!
//! Command-line arguments and configuration file support.
//!
//! ```text
//! SupervisorConfig
//!   ├─ FleetConfig        worker count, partitions, display worker
//!   ├─ PipelineConfig     sources, models, thresholds, pipeline mode
//!   ├─ SupervisionConfig  restart policy, timeouts, stagger
//!   ├─ DashboardConfig    sink, interval, fps ceiling
//!   └─ LoggingConfig      level, format, log file
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fleet_protocol::{DetectionThresholds, PartitionId};
use serde::{Deserialize, Serialize};

use super::plan::FleetPlan;
use crate::telemetry::{DEFAULT_CHANNEL_CAPACITY, DEFAULT_RATE_WINDOW};
use crate::worker::{CommandConfig, SyntheticConfig, VideoFormat};

/// Supervisor main configuration
///
/// Loaded from command-line arguments, or from a YAML/JSON file given by
/// `--config-file`.
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(name = "fleet-supervisor")]
#[command(author = "Detect Fleet Team")]
#[command(version = "0.1.0")]
#[command(about = "Detect Fleet Supervisor - run parallel detection workers on accelerator partitions")]
#[serde(default)]
pub struct SupervisorConfig {
    #[command(flatten)]
    pub fleet: FleetConfig,

    #[command(flatten)]
    pub pipeline: PipelineConfig,

    #[command(flatten)]
    pub supervision: SupervisionConfig,

    #[command(flatten)]
    pub dashboard: DashboardConfig,

    #[command(flatten)]
    pub logging: LoggingConfig,

    /// Load configuration from a file (.yaml, .yml or .json)
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

/// Worker pool shape
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
pub struct FleetConfig {
    /// Number of parallel workers
    #[arg(long, short = 'n', default_value_t = 4)]
    pub num_workers: usize,

    /// Accelerator capacity (partitions 1..=max)
    #[arg(long, default_value_t = 4)]
    pub max_partitions: u32,

    /// Partitions to hand out, e.g. "1-4" or "2"
    #[arg(long, default_value = "1-4")]
    pub partitions: PartitionRange,

    /// Index of the worker that renders to a display
    #[arg(long, default_value_t = 0)]
    pub display_worker: usize,
}

/// Pipeline construction
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pipeline implementation. `command` runs --program once per worker;
    /// the program must print one `{"detections": N}` line per frame
    #[arg(long, value_enum, default_value_t = PipelineMode::Synthetic)]
    pub mode: PipelineMode,

    /// Video source(s): one for all workers, or one per worker (comma-separated)
    #[arg(long = "source", value_delimiter = ',', default_value = "/dev/video0")]
    pub sources: Vec<String>,

    /// Model file(s): one for all workers, or one per worker (comma-separated)
    #[arg(long = "model", value_delimiter = ',', default_value = "yolov11l.hef")]
    pub models: Vec<String>,

    /// Detection score threshold (0.0 - 1.0)
    #[arg(long, default_value_t = 0.3)]
    pub score_threshold: f32,

    /// NMS IoU threshold (0.0 - 1.0)
    #[arg(long, default_value_t = 0.45)]
    pub iou_threshold: f32,

    /// Video width after scaling
    #[arg(long, default_value_t = 640)]
    pub video_width: u32,

    /// Video height after scaling
    #[arg(long, default_value_t = 640)]
    pub video_height: u32,

    /// Source frame rate
    #[arg(long, default_value_t = 30)]
    pub frame_rate: u32,

    /// Sink element of the display worker
    #[arg(long, default_value = "autovideosink")]
    pub video_sink: String,

    /// Inference batch size
    #[arg(long, default_value_t = 1)]
    pub batch_size: u32,

    /// Wrapper program running the launch description and printing one
    /// `{"detections": N}` JSON line per frame (required in command mode)
    #[arg(long, value_name = "PROGRAM")]
    pub program: Option<String>,

    /// Program arguments (command mode, repeatable); placeholders:
    /// {launch} {partition} {index} {source} {model}
    #[arg(long = "program-arg", allow_hyphen_values = true)]
    pub program_args: Vec<String>,

    /// Skip the model file existence check (command mode)
    #[arg(long, default_value_t = false)]
    pub skip_model_check: bool,

    /// Simulated frame rate (synthetic mode)
    #[arg(long, default_value_t = 30.0)]
    pub synthetic_fps: f64,

    /// Maximum detections per simulated frame (synthetic mode)
    #[arg(long, default_value_t = 8)]
    pub max_detections: u32,

    /// Fail every simulated worker after N seconds (synthetic mode)
    #[arg(long)]
    pub fail_after_secs: Option<f64>,

    /// Startup crash probability 0.0-1.0 (synthetic mode)
    #[arg(long)]
    pub crash_chance: Option<f32>,

    /// Random seed (synthetic mode)
    #[arg(long)]
    pub seed: Option<u64>,
}

/// Restart and shutdown behavior
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
pub struct SupervisionConfig {
    /// Restart policy: never, on-failure[:N]
    #[arg(long, default_value = "on-failure:3")]
    pub restart_policy: RestartPolicy,

    /// Health check interval (milliseconds)
    #[arg(long, default_value_t = 1000)]
    pub health_interval_ms: u64,

    /// Time a worker may stay Starting (milliseconds)
    #[arg(long, default_value_t = 15000)]
    pub startup_timeout_ms: u64,

    /// Time a running worker may go without a sample (milliseconds)
    #[arg(long, default_value_t = 5000)]
    pub stall_timeout_ms: u64,

    /// Delay between worker starts (milliseconds)
    #[arg(long, default_value_t = 500)]
    pub stagger_ms: u64,

    /// Graceful stop period on shutdown (milliseconds)
    #[arg(long, default_value_t = 5000)]
    pub grace_period_ms: u64,

    /// Wait after killing stragglers (milliseconds)
    #[arg(long, default_value_t = 2000)]
    pub kill_timeout_ms: u64,

    /// Workers that must start for the launch to succeed (default: all)
    #[arg(long)]
    pub min_workers: Option<usize>,

    /// Telemetry channel capacity (samples)
    #[arg(long, default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub channel_capacity: usize,

    /// Samples kept per worker for rate estimation
    #[arg(long, default_value_t = DEFAULT_RATE_WINDOW)]
    pub rate_window: usize,
}

/// Dashboard reporting
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
pub struct DashboardConfig {
    /// Dashboard output: text, json, tui
    #[arg(long = "dashboard", value_enum, default_value_t = DashboardSinkKind::Text)]
    pub sink: DashboardSinkKind,

    /// Report interval (seconds)
    #[arg(long, default_value_t = 15)]
    pub report_interval_secs: u64,

    /// Delay before the first report (seconds)
    #[arg(long, default_value_t = 5)]
    pub warmup_secs: u64,

    /// Per-worker frame rate ceiling for efficiency (fps)
    #[arg(long, default_value_t = 30.0)]
    pub fps_ceiling: f64,
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, default_value = "text")]
    pub log_format: String,

    /// Write logs to this file instead of stderr (the tui dashboard
    /// defaults to fleet-supervisor.log)
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

/// Log file used by the tui dashboard when none is configured.
pub const DEFAULT_TUI_LOG_FILE: &str = "fleet-supervisor.log";

// ----------------------------------------------------------------------------
// Value types
// ----------------------------------------------------------------------------

/// Restart policy for crashed workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RestartPolicy {
    /// Never restart; a crash fails the slot
    Never,
    /// Restart crashed workers up to `max_retries` times
    OnFailure { max_retries: u32 },
}

impl RestartPolicy {
    /// Restarts allowed per slot.
    pub fn budget(&self) -> u32 {
        match self {
            Self::Never => 0,
            Self::OnFailure { max_retries } => *max_retries,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::OnFailure { max_retries: 3 }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "never"),
            Self::OnFailure { max_retries } => write!(f, "on-failure:{}", max_retries),
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        match (parts[0], parts.len()) {
            ("never", 1) => Ok(Self::Never),
            ("on-failure", 1) => Ok(Self::default()),
            ("on-failure", 2) => {
                let max_retries = parts[1]
                    .parse()
                    .map_err(|_| format!("Invalid max_retries value: {}", parts[1]))?;
                Ok(Self::OnFailure { max_retries })
            }
            _ => Err(format!("Unknown restart policy: {}", s)),
        }
    }
}

impl TryFrom<String> for RestartPolicy {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RestartPolicy> for String {
    fn from(policy: RestartPolicy) -> Self {
        policy.to_string()
    }
}

/// Inclusive range of partition ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartitionRange {
    pub first: u32,
    pub last: u32,
}

impl PartitionRange {
    pub fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    /// Number of partitions in the range.
    pub fn len(&self) -> usize {
        if self.last < self.first {
            0
        } else {
            (self.last - self.first) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Partition of the `offset`-th worker, if inside the range.
    pub fn nth(&self, offset: usize) -> Option<PartitionId> {
        (offset < self.len()).then(|| PartitionId(self.first + offset as u32))
    }

    pub fn contains(&self, id: PartitionId) -> bool {
        (self.first..=self.last).contains(&id.get())
    }
}

impl Default for PartitionRange {
    fn default() -> Self {
        Self::new(1, 4)
    }
}

impl fmt::Display for PartitionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

impl FromStr for PartitionRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| format!("Invalid partition id: {}", v))
        };
        let range = match s.split_once('-') {
            Some((first, last)) => Self::new(parse(first)?, parse(last)?),
            None => {
                let id = parse(s)?;
                Self::new(id, id)
            }
        };
        if range.first == 0 {
            return Err("Partition ids start at 1".to_string());
        }
        if range.is_empty() {
            return Err(format!("Empty partition range: {}", s));
        }
        Ok(range)
    }
}

impl TryFrom<String> for PartitionRange {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PartitionRange> for String {
    fn from(range: PartitionRange) -> Self {
        range.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Simulated detector (no accelerator needed)
    Synthetic,
    /// External pipeline process reporting frames on stdout
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DashboardSinkKind {
    /// Plain text snapshot
    Text,
    /// One JSON object per report
    Json,
    /// Terminal view
    Tui,
}

// ----------------------------------------------------------------------------
// Runtime settings
// ----------------------------------------------------------------------------

/// Runtime settings of the supervisor, with durations resolved.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_partitions: u32,
    pub restart_policy: RestartPolicy,
    pub health_interval: Duration,
    pub startup_timeout: Duration,
    pub stall_timeout: Duration,
    pub stagger: Duration,
    pub grace_period: Duration,
    pub kill_timeout: Duration,
    /// Workers that must start for a launch to succeed (`None`: all)
    pub min_workers: Option<usize>,
    pub video_format: VideoFormat,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_partitions: 4,
            restart_policy: RestartPolicy::default(),
            health_interval: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(15),
            stall_timeout: Duration::from_secs(5),
            stagger: Duration::from_millis(500),
            grace_period: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(2),
            min_workers: None,
            video_format: VideoFormat::default(),
        }
    }
}

impl SupervisorSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_partitions(mut self, max_partitions: u32) -> Self {
        self.max_partitions = max_partitions;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn with_shutdown_timeouts(mut self, grace: Duration, kill: Duration) -> Self {
        self.grace_period = grace;
        self.kill_timeout = kill;
        self
    }

    pub fn with_min_workers(mut self, min_workers: usize) -> Self {
        self.min_workers = Some(min_workers);
        self
    }
}

/// Runtime settings of the dashboard reporter.
#[derive(Debug, Clone)]
pub struct DashboardSettings {
    pub interval: Duration,
    pub warmup: Duration,
    pub fps_ceiling: f64,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            warmup: Duration::from_secs(5),
            fps_ceiling: 30.0,
        }
    }
}

// ----------------------------------------------------------------------------
// Loading & validation
// ----------------------------------------------------------------------------

impl SupervisorConfig {
    /// Parse command-line arguments
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Load from a configuration file (YAML or JSON)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).context("Failed to parse YAML config")
            }
            Some("json") => serde_json::from_str(&content).context("Failed to parse JSON config"),
            _ => anyhow::bail!("Unsupported config file format (use .yaml, .yml, or .json)"),
        }
    }

    /// Load configuration: the file given by `--config-file` replaces the
    /// command-line values entirely.
    pub fn load() -> Result<Self> {
        let config = Self::from_args();
        let config = match config.config_file.clone() {
            Some(path) => {
                let mut file_config = Self::from_file(&path)?;
                file_config.config_file = Some(path);
                file_config
            }
            None => config,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let n = self.fleet.num_workers;
        if n == 0 {
            anyhow::bail!("num_workers must be greater than 0");
        }
        if self.fleet.max_partitions == 0 {
            anyhow::bail!("max_partitions must be greater than 0");
        }

        let range = self.fleet.partitions;
        if range.first == 0 || range.last > self.fleet.max_partitions || range.is_empty() {
            anyhow::bail!(
                "partition range {} must lie within 1-{}",
                range,
                self.fleet.max_partitions
            );
        }
        if n > range.len() {
            anyhow::bail!(
                "num_workers ({}) exceeds the {} partition(s) in range {}",
                n,
                range.len(),
                range
            );
        }
        if self.fleet.display_worker >= n {
            anyhow::bail!(
                "display_worker ({}) must be < num_workers ({})",
                self.fleet.display_worker,
                n
            );
        }

        for (name, list) in [("source", &self.pipeline.sources), ("model", &self.pipeline.models)] {
            if list.len() != 1 && list.len() != n {
                anyhow::bail!(
                    "expected 1 or {} {} descriptor(s), got {}",
                    n,
                    name,
                    list.len()
                );
            }
            if list.iter().any(|d| d.trim().is_empty()) {
                anyhow::bail!("{} descriptors must not be empty", name);
            }
        }

        self.thresholds()
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid detection thresholds: {}", e))?;

        if self.pipeline.video_width == 0 || self.pipeline.video_height == 0 {
            anyhow::bail!("video dimensions must be greater than 0");
        }
        if self.pipeline.frame_rate == 0 {
            anyhow::bail!("frame_rate must be greater than 0");
        }
        if !(self.pipeline.synthetic_fps.is_finite() && self.pipeline.synthetic_fps > 0.0) {
            anyhow::bail!("synthetic_fps must be greater than 0");
        }
        if let Some(chance) = self.pipeline.crash_chance {
            if !(0.0..=1.0).contains(&chance) {
                anyhow::bail!("crash_chance must be in range [0.0, 1.0]");
            }
        }
        if let Some(secs) = self.pipeline.fail_after_secs {
            if !(secs.is_finite() && secs >= 0.0) {
                anyhow::bail!("fail_after_secs must be a non-negative number");
            }
        }

        let s = &self.supervision;
        for (name, value) in [
            ("health_interval_ms", s.health_interval_ms),
            ("startup_timeout_ms", s.startup_timeout_ms),
            ("stall_timeout_ms", s.stall_timeout_ms),
            ("grace_period_ms", s.grace_period_ms),
            ("kill_timeout_ms", s.kill_timeout_ms),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }
        if let Some(min) = s.min_workers {
            if min == 0 || min > n {
                anyhow::bail!("min_workers must be in range 1..={}", n);
            }
        }
        if s.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be greater than 0");
        }
        if s.rate_window < 2 {
            anyhow::bail!("rate_window must be at least 2");
        }

        if self.dashboard.report_interval_secs == 0 {
            anyhow::bail!("report_interval_secs must be greater than 0");
        }
        if !(self.dashboard.fps_ceiling.is_finite() && self.dashboard.fps_ceiling > 0.0) {
            anyhow::bail!("fps_ceiling must be greater than 0");
        }

        match self.logging.log_level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log_level: {} (must be trace/debug/info/warn/error)",
                self.logging.log_level
            ),
        }
        match self.logging.log_format.as_str() {
            "text" | "json" => {}
            _ => anyhow::bail!(
                "Invalid log_format: {} (must be text/json)",
                self.logging.log_format
            ),
        }

        if self.pipeline.mode == PipelineMode::Command {
            let Some(program) = self.pipeline.program.as_deref() else {
                anyhow::bail!(
                    "command mode requires --program: a wrapper printing one \
                     {{\"detections\": N}} line per frame"
                );
            };
            let name = Path::new(program).file_name().and_then(|n| n.to_str());
            if name == Some("gst-launch-1.0") {
                anyhow::bail!(
                    "gst-launch-1.0 prints no frame reports; use a wrapper that runs \
                     the launch description and prints {{\"detections\": N}} per frame"
                );
            }
        }

        Ok(())
    }

    /// Where logs go: `None` is stderr.
    ///
    /// The tui dashboard owns the terminal, so it always logs to a file.
    pub fn log_file(&self) -> Option<PathBuf> {
        match (&self.logging.log_file, self.dashboard.sink) {
            (Some(path), _) => Some(path.clone()),
            (None, DashboardSinkKind::Tui) => Some(PathBuf::from(DEFAULT_TUI_LOG_FILE)),
            (None, _) => None,
        }
    }

    pub fn thresholds(&self) -> DetectionThresholds {
        DetectionThresholds::new(self.pipeline.score_threshold, self.pipeline.iou_threshold)
    }

    pub fn video_format(&self) -> VideoFormat {
        VideoFormat {
            width: self.pipeline.video_width,
            height: self.pipeline.video_height,
            fps: self.pipeline.frame_rate,
            video_sink: self.pipeline.video_sink.clone(),
            batch_size: self.pipeline.batch_size,
        }
    }

    /// Convert to SupervisorSettings
    pub fn to_settings(&self) -> SupervisorSettings {
        let s = &self.supervision;
        SupervisorSettings {
            max_partitions: self.fleet.max_partitions,
            restart_policy: s.restart_policy,
            health_interval: Duration::from_millis(s.health_interval_ms),
            startup_timeout: Duration::from_millis(s.startup_timeout_ms),
            stall_timeout: Duration::from_millis(s.stall_timeout_ms),
            stagger: Duration::from_millis(s.stagger_ms),
            grace_period: Duration::from_millis(s.grace_period_ms),
            kill_timeout: Duration::from_millis(s.kill_timeout_ms),
            min_workers: s.min_workers,
            video_format: self.video_format(),
        }
    }

    /// Convert to DashboardSettings
    pub fn to_dashboard_settings(&self) -> DashboardSettings {
        DashboardSettings {
            interval: Duration::from_secs(self.dashboard.report_interval_secs),
            warmup: Duration::from_secs(self.dashboard.warmup_secs),
            fps_ceiling: self.dashboard.fps_ceiling,
        }
    }

    pub fn synthetic_config(&self) -> SyntheticConfig {
        SyntheticConfig {
            fps: self.pipeline.synthetic_fps,
            max_detections: self.pipeline.max_detections,
            fail_after: self.pipeline.fail_after_secs.map(Duration::from_secs_f64),
            crash_chance: self.pipeline.crash_chance,
            seed: self.pipeline.seed,
            ..SyntheticConfig::default()
        }
    }

    pub fn command_config(&self) -> Result<CommandConfig> {
        let program = self
            .pipeline
            .program
            .clone()
            .context("command mode requires --program")?;
        let mut config = CommandConfig::new(program);
        if !self.pipeline.program_args.is_empty() {
            config.args = self.pipeline.program_args.clone();
        }
        config.check_model = !self.pipeline.skip_model_check;
        Ok(config)
    }

    /// Per-worker descriptors of the configured fleet.
    pub fn fleet_plan(&self) -> FleetPlan {
        FleetPlan {
            sources: self.pipeline.sources.clone(),
            models: self.pipeline.models.clone(),
            thresholds: self.thresholds(),
            display_worker: self.fleet.display_worker,
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("Supervisor Configuration:");
        println!("  Fleet:");
        println!("    Workers: {}", self.fleet.num_workers);
        println!(
            "    Partitions: {} (capacity {})",
            self.fleet.partitions, self.fleet.max_partitions
        );
        println!("    Display worker: {}", self.fleet.display_worker);
        println!("  Pipeline:");
        println!("    Mode: {:?}", self.pipeline.mode);
        if let Some(program) = &self.pipeline.program {
            println!("    Program: {}", program);
        }
        println!("    Sources: {}", self.pipeline.sources.join(", "));
        println!("    Models: {}", self.pipeline.models.join(", "));
        println!(
            "    Thresholds: score={} iou={}",
            self.pipeline.score_threshold, self.pipeline.iou_threshold
        );
        println!(
            "    Video: {}x{} @ {} fps",
            self.pipeline.video_width, self.pipeline.video_height, self.pipeline.frame_rate
        );
        println!("  Supervision:");
        println!("    Restart policy: {}", self.supervision.restart_policy);
        println!("    Health interval: {}ms", self.supervision.health_interval_ms);
        println!(
            "    Shutdown: grace {}ms, kill {}ms",
            self.supervision.grace_period_ms, self.supervision.kill_timeout_ms
        );
        println!("  Dashboard:");
        println!(
            "    Sink: {:?}, every {}s after {}s warm-up",
            self.dashboard.sink, self.dashboard.report_interval_secs, self.dashboard.warmup_secs
        );
        println!("  Logging:");
        println!("    Level: {}", self.logging.log_level);
    }
}

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            fleet: FleetConfig::default(),
            pipeline: PipelineConfig::default(),
            supervision: SupervisionConfig::default(),
            dashboard: DashboardConfig::default(),
            logging: LoggingConfig::default(),
            config_file: None,
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            max_partitions: 4,
            partitions: PartitionRange::default(),
            display_worker: 0,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let video = VideoFormat::default();
        Self {
            mode: PipelineMode::Synthetic,
            sources: vec!["/dev/video0".to_string()],
            models: vec!["yolov11l.hef".to_string()],
            score_threshold: 0.3,
            iou_threshold: 0.45,
            video_width: video.width,
            video_height: video.height,
            frame_rate: video.fps,
            video_sink: video.video_sink,
            batch_size: video.batch_size,
            program: None,
            program_args: Vec::new(),
            skip_model_check: false,
            synthetic_fps: 30.0,
            max_detections: 8,
            fail_after_secs: None,
            crash_chance: None,
            seed: None,
        }
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::default(),
            health_interval_ms: 1000,
            startup_timeout_ms: 15000,
            stall_timeout_ms: 5000,
            stagger_ms: 500,
            grace_period_ms: 5000,
            kill_timeout_ms: 2000,
            min_workers: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            rate_window: DEFAULT_RATE_WINDOW,
        }
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            sink: DashboardSinkKind::Text,
            report_interval_secs: 15,
            warmup_secs: 5,
            fps_ceiling: 30.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            log_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SupervisorConfig::default();
        assert_eq!(config.fleet.num_workers, 4);
        assert_eq!(config.fleet.partitions, PartitionRange::new(1, 4));
        assert_eq!(config.supervision.health_interval_ms, 1000);
        assert_eq!(config.dashboard.report_interval_secs, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_defaults_match() {
        let config = SupervisorConfig::parse_from(["fleet-supervisor"]);
        let defaults = SupervisorConfig::default();
        assert_eq!(config.fleet.num_workers, defaults.fleet.num_workers);
        assert_eq!(config.pipeline.sources, defaults.pipeline.sources);
        assert_eq!(config.supervision.restart_policy, defaults.supervision.restart_policy);
        assert_eq!(config.dashboard.sink, DashboardSinkKind::Text);
    }

    #[test]
    fn test_cli_parsing() {
        let config = SupervisorConfig::parse_from([
            "fleet-supervisor",
            "-n",
            "2",
            "--partitions",
            "3-4",
            "--source",
            "/dev/video0,/videos/a.mp4",
            "--restart-policy",
            "never",
            "--dashboard",
            "json",
            "--mode",
            "command",
            "--program",
            "./detect-wrapper.sh",
            "--program-arg",
            "-e",
            "--program-arg",
            "{launch}",
        ]);
        assert_eq!(config.fleet.num_workers, 2);
        assert_eq!(config.fleet.partitions, PartitionRange::new(3, 4));
        assert_eq!(config.pipeline.sources.len(), 2);
        assert_eq!(config.supervision.restart_policy, RestartPolicy::Never);
        assert_eq!(config.dashboard.sink, DashboardSinkKind::Json);
        assert_eq!(config.pipeline.mode, PipelineMode::Command);
        let command = config.command_config().unwrap();
        assert_eq!(command.program, "./detect-wrapper.sh");
        assert_eq!(command.args, vec!["-e", "{launch}"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SupervisorConfig::default();
        assert!(config.validate().is_ok());

        // More workers than partitions in range
        config.fleet.num_workers = 5;
        assert!(config.validate().is_err());
        config.fleet.num_workers = 4;

        // Range beyond capacity
        config.fleet.partitions = PartitionRange::new(2, 5);
        assert!(config.validate().is_err());
        config.fleet.partitions = PartitionRange::new(1, 4);

        // Threshold out of range
        config.pipeline.score_threshold = 1.5;
        assert!(config.validate().is_err());
        config.pipeline.score_threshold = 0.3;

        // Descriptor list of the wrong length
        config.pipeline.models = vec!["a.hef".into(), "b.hef".into()];
        assert!(config.validate().is_err());
        config.pipeline.models = vec!["a.hef".into(); 4];
        assert!(config.validate().is_ok());

        // Zero interval
        config.supervision.health_interval_ms = 0;
        assert!(config.validate().is_err());
        config.supervision.health_interval_ms = 1000;

        // Display worker outside the pool
        config.fleet.display_worker = 4;
        assert!(config.validate().is_err());
        config.fleet.display_worker = 0;

        // Invalid log_level
        config.logging.log_level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_command_mode_requires_frame_reporting_program() {
        let mut config = SupervisorConfig::default();
        config.pipeline.mode = PipelineMode::Command;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("--program"), "{}", err);
        assert!(config.command_config().is_err());

        // Stock gst-launch never prints frame reports
        config.pipeline.program = Some("/usr/bin/gst-launch-1.0".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("gst-launch-1.0"), "{}", err);

        config.pipeline.program = Some("hailo-detect-wrapper".to_string());
        assert!(config.validate().is_ok());
        let command = config.command_config().unwrap();
        assert_eq!(command.args, vec!["{launch}"]);
        assert!(command.check_model);
    }

    #[test]
    fn test_log_file_follows_dashboard() {
        let mut config = SupervisorConfig::default();
        assert_eq!(config.log_file(), None);

        config.dashboard.sink = DashboardSinkKind::Tui;
        assert_eq!(config.log_file(), Some(PathBuf::from(DEFAULT_TUI_LOG_FILE)));

        config.logging.log_file = Some(PathBuf::from("/tmp/fleet.log"));
        assert_eq!(config.log_file(), Some(PathBuf::from("/tmp/fleet.log")));

        let parsed = SupervisorConfig::parse_from(["fleet-supervisor", "--log-file", "run.log"]);
        assert_eq!(parsed.log_file(), Some(PathBuf::from("run.log")));
    }

    #[test]
    fn test_restart_policy_parse() {
        assert_eq!("never".parse::<RestartPolicy>().unwrap(), RestartPolicy::Never);
        assert_eq!(
            "on-failure".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure { max_retries: 3 }
        );
        assert_eq!(
            "on-failure:5".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure { max_retries: 5 }
        );
        assert!("always".parse::<RestartPolicy>().is_err());
        assert!("on-failure:x".parse::<RestartPolicy>().is_err());
        assert_eq!(RestartPolicy::OnFailure { max_retries: 2 }.to_string(), "on-failure:2");
        assert_eq!(RestartPolicy::Never.budget(), 0);
    }

    #[test]
    fn test_partition_range() {
        let range: PartitionRange = "2-4".parse().unwrap();
        assert_eq!(range.len(), 3);
        assert_eq!(range.nth(0), Some(PartitionId(2)));
        assert_eq!(range.nth(2), Some(PartitionId(4)));
        assert_eq!(range.nth(3), None);
        assert!(range.contains(PartitionId(3)));
        assert_eq!(range.to_string(), "2-4");

        let single: PartitionRange = "3".parse().unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single.to_string(), "3");

        assert!("0-3".parse::<PartitionRange>().is_err());
        assert!("4-2".parse::<PartitionRange>().is_err());
        assert!("a-b".parse::<PartitionRange>().is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = std::env::temp_dir().join(format!("fleet-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fleet.yaml");
        std::fs::write(
            &path,
            "fleet:\n  num_workers: 2\n  partitions: \"1-2\"\n\
             supervision:\n  restart_policy: \"on-failure:1\"\n\
             dashboard:\n  sink: tui\n",
        )
        .unwrap();

        let config = SupervisorConfig::from_file(&path).unwrap();
        assert_eq!(config.fleet.num_workers, 2);
        assert_eq!(config.fleet.partitions, PartitionRange::new(1, 2));
        assert_eq!(
            config.supervision.restart_policy,
            RestartPolicy::OnFailure { max_retries: 1 }
        );
        assert_eq!(config.dashboard.sink, DashboardSinkKind::Tui);
        // Missing sections take defaults
        assert_eq!(config.pipeline.score_threshold, 0.3);
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());

        let bad = dir.join("fleet.toml");
        std::fs::write(&bad, "").unwrap();
        assert!(SupervisorConfig::from_file(&bad).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_to_settings() {
        let mut config = SupervisorConfig::default();
        config.supervision.min_workers = Some(2);
        config.supervision.stagger_ms = 250;
        let settings = config.to_settings();
        assert_eq!(settings.min_workers, Some(2));
        assert_eq!(settings.stagger, Duration::from_millis(250));
        assert_eq!(settings.video_format.width, 640);

        let dashboard = config.to_dashboard_settings();
        assert_eq!(dashboard.interval, Duration::from_secs(15));
        assert_eq!(dashboard.warmup, Duration::from_secs(5));
    }
}
