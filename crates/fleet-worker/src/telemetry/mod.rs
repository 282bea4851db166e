//! Telemetry Module
//!
//! Per-frame samples flow from every worker into one aggregator:
//!
//! ```text
//! Worker 0 ──┐
//! Worker 1 ──┤  TelemetryEmitter::emit ──try_send──► bounded channel
//! Worker N ──┘                                          │
//!                                                       ▼
//!                                               ingest loop task
//!                                                       │ ingest()
//!                                                       ▼
//!                                  TelemetryAggregator (per-entry locks)
//!                                                       │ snapshot()
//!                                                       ▼
//!                                              Dashboard Reporter
//! ```

pub mod aggregator;
pub mod channel;
pub mod rate;

pub use aggregator::{TelemetryAggregator, TelemetrySnapshot, WorkerStats};
pub use channel::{
    telemetry_channel, IngestLoop, TelemetryBus, TelemetryEmitter, DEFAULT_CHANNEL_CAPACITY,
};
pub use rate::{RateEstimator, DEFAULT_RATE_WINDOW};
