//! Launch description builder.
//!
//! Builds the textual media pipeline for one worker from its spec:
//!
//! ```text
//! <source> ! <inference, vdevice-group-id=<partition>> ! <callback> ! <sink>
//! ```
//!
//! Only the display-enabled worker gets a real video sink; every other
//! worker drains into a queue and a non-synchronized fakesink.
//!
//! `identity_callback_<index>` is where the wrapper program attaches its
//! per-frame callback and prints one `FrameReport` line per buffer.

use fleet_protocol::WorkerSpec;
use serde::{Deserialize, Serialize};

/// Raw video format negotiated after the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Sink element used by the display-enabled worker
    pub video_sink: String,
    /// Inference batch size
    pub batch_size: u32,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            width: 640,
            height: 640,
            fps: 30,
            video_sink: "autovideosink".to_string(),
            batch_size: 1,
        }
    }
}

fn source_element(spec: &WorkerSpec) -> String {
    let name = format!("source_{}", spec.index);
    let source = spec.source.as_str();
    if source.starts_with("/dev/video") {
        format!("v4l2src device={} name={}", source, name)
    } else if source.contains("://") {
        format!("uridecodebin uri={} name={}", source, name)
    } else {
        format!("filesrc location={} name={} ! decodebin", source, name)
    }
}

/// Build the launch description of one worker.
pub fn build_launch_description(spec: &WorkerSpec, format: &VideoFormat) -> String {
    let i = spec.index;

    let source = format!(
        "{} ! videoscale ! videoconvert ! video/x-raw,format=RGB,width={},height={},framerate={}/1",
        source_element(spec),
        format.width,
        format.height,
        format.fps
    );

    let inference = format!(
        "queue name=inference_queue_{i} ! hailonet name=inference_{i} hef-path={} \
         batch-size={} vdevice-group-id={} nms-score-threshold={} nms-iou-threshold={} \
         output-format-type=HAILO_FORMAT_TYPE_FLOAT32",
        spec.model, format.batch_size, spec.partition, spec.thresholds.score, spec.thresholds.iou,
    );

    let callback = format!("identity name=identity_callback_{i}");

    let sink = if spec.display {
        format!(
            "queue name=display_queue_{i} ! videoconvert ! fpsdisplaysink video-sink={} \
             text-overlay=false sync=false",
            format.video_sink
        )
    } else {
        format!("queue name=sink_queue_{i} ! fakesink sync=false")
    };

    format!("{} ! {} ! {} ! {}", source, inference, callback, sink)
}
