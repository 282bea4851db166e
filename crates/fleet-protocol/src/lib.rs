//! Shared data types for the detect-fleet supervisor.
//!
//! Everything that crosses a component boundary lives here: the partition
//! token, the immutable per-worker spec, the telemetry sample a worker emits
//! per frame, the frame report an external pipeline prints on stdout, and the
//! liveness state machine.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

mod liveness;

pub use liveness::{Liveness, StateTransitionError};

/// Exclusive slice of accelerator capacity (a vdevice group on the device).
///
/// Valid ids are `1..=max_partitions`; `0` is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl PartitionId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// NMS thresholds handed to the detection post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionThresholds {
    /// Minimum detection score, in [0, 1]
    pub score: f32,
    /// IoU threshold for non-maximum suppression, in [0, 1]
    pub iou: f32,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            score: 0.3,
            iou: 0.45,
        }
    }
}

impl DetectionThresholds {
    pub fn new(score: f32, iou: f32) -> Self {
        Self { score, iou }
    }

    /// Both thresholds must be finite and inside [0, 1].
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [("score", self.score), ("iou", self.iou)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{} threshold {} is outside [0, 1]", name, value));
            }
        }
        Ok(())
    }
}

/// Static configuration of one worker slot.
///
/// Immutable once a worker is started; a restart reuses the same spec,
/// including the partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Ordinal index (0-based)
    pub index: usize,

    /// Partition this worker is bound to
    pub partition: PartitionId,

    /// Whether this worker renders to a display sink
    pub display: bool,

    /// Opaque video source descriptor (device path, file, URI)
    pub source: String,

    /// Opaque model descriptor (usually a compiled network path)
    pub model: String,

    /// Detection thresholds
    pub thresholds: DetectionThresholds,
}

impl WorkerSpec {
    /// Human-readable identifier, e.g. `worker-2`
    pub fn worker_id(&self) -> String {
        format!("worker-{}", self.index)
    }
}

/// One processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Worker index that produced the frame
    pub worker: usize,

    /// Wall-clock time in seconds since the UNIX epoch
    pub timestamp: f64,

    /// Number of detections in this frame
    pub detections: u32,

    /// Instance of the worker slot that produced the frame (0 = first launch)
    #[serde(default)]
    pub generation: u32,
}

impl TelemetrySample {
    pub fn new(worker: usize, timestamp: f64, detections: u32) -> Self {
        Self {
            worker,
            timestamp,
            detections,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u32) -> Self {
        self.generation = generation;
        self
    }

    /// Sample stamped with the current wall-clock time.
    pub fn now(worker: usize, detections: u32) -> Self {
        Self::new(worker, unix_now(), detections)
    }
}

/// Line an external pipeline prints on stdout for every processed frame.
///
/// ```text
/// {"detections": 3}
/// {"detections": 0, "timestamp": 1718000000.25}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    pub detections: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl FrameReport {
    /// Parse one stdout line. Returns `None` for anything that is not a report.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Seconds since the UNIX epoch as `f64`.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_validate() {
        assert!(DetectionThresholds::default().validate().is_ok());
        assert!(DetectionThresholds::new(0.0, 1.0).validate().is_ok());

        let err = DetectionThresholds::new(1.2, 0.45).validate().unwrap_err();
        assert!(err.contains("score"));
        assert!(DetectionThresholds::new(0.3, -0.1).validate().is_err());
        assert!(DetectionThresholds::new(f32::NAN, 0.5).validate().is_err());
    }

    #[test]
    fn test_worker_id() {
        let spec = WorkerSpec {
            index: 2,
            partition: PartitionId(3),
            display: false,
            source: "/dev/video0".to_string(),
            model: "yolov11l.hef".to_string(),
            thresholds: DetectionThresholds::default(),
        };
        assert_eq!(spec.worker_id(), "worker-2");
        assert_eq!(spec.partition.to_string(), "3");
    }

    #[test]
    fn test_frame_report_parse() {
        let report = FrameReport::parse_line(r#"{"detections": 4}"#).unwrap();
        assert_eq!(report.detections, 4);
        assert_eq!(report.timestamp, None);

        let report = FrameReport::parse_line(r#"  {"detections":0,"timestamp":12.5}  "#).unwrap();
        assert_eq!(report.timestamp, Some(12.5));

        assert!(FrameReport::parse_line("Setting pipeline to PLAYING ...").is_none());
        assert!(FrameReport::parse_line(r#"{"fps": 30}"#).is_none());
    }

    #[test]
    fn test_partition_serde_transparent() {
        let json = serde_json::to_string(&PartitionId(4)).unwrap();
        assert_eq!(json, "4");
    }
}
