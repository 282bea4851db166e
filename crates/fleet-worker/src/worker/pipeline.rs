//! Pipeline contract between a worker and the inference backend.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fleet_protocol::{unix_now, Liveness, WorkerSpec};
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::base::error::Result;
use crate::telemetry::TelemetryEmitter;

/// Terminal status reported by a pipeline, exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    /// The pipeline ended on its own or after a stop request
    Completed(i32),
    /// The pipeline hit an unrecoverable error
    Failed(String),
}

impl fmt::Display for PipelineExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineExit::Completed(code) => write!(f, "completed ({})", code),
            PipelineExit::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Everything a running pipeline may touch.
pub struct PipelineContext {
    spec: Arc<WorkerSpec>,
    emitter: TelemetryEmitter,
    stop_rx: watch::Receiver<bool>,
    liveness: Arc<watch::Sender<Liveness>>,
    first_frame: AtomicBool,
}

impl PipelineContext {
    pub(crate) fn new(
        spec: Arc<WorkerSpec>,
        emitter: TelemetryEmitter,
        stop_rx: watch::Receiver<bool>,
        liveness: Arc<watch::Sender<Liveness>>,
    ) -> Self {
        Self {
            spec,
            emitter,
            stop_rx,
            liveness,
            first_frame: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Report one processed frame. Never blocks.
    ///
    /// The first frame moves the instance from `Starting` to `Running`.
    pub fn emit(&self, timestamp: f64, detections: u32) -> bool {
        if !self.first_frame.swap(true, Ordering::AcqRel) {
            self.liveness.send_if_modified(|state| {
                if *state == Liveness::Starting {
                    *state = Liveness::Running;
                    true
                } else {
                    false
                }
            });
        }
        self.emitter.emit(timestamp, detections)
    }

    /// `emit` stamped with the current wall-clock time.
    pub fn emit_now(&self, detections: u32) -> bool {
        self.emit(unix_now(), detections)
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Resolves once a graceful stop has been requested.
    ///
    /// Never resolves if the worker handle is gone without a stop request;
    /// the task is aborted in that case.
    pub async fn stopped(&self) {
        let mut rx = self.stop_rx.clone();
        let signalled = rx.wait_for(|stop| *stop).await.map(|_| ());
        if signalled.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// One running media pipeline.
pub trait Pipeline: Send {
    /// Run until end of stream, failure, or a stop request.
    fn run(self: Box<Self>, ctx: PipelineContext) -> BoxFuture<'static, PipelineExit>;
}

/// Builds pipelines from worker specs.
pub trait PipelineFactory: Send + Sync {
    /// Build (but do not start) the pipeline for `spec`.
    ///
    /// `launch` is the launch description produced for this spec.
    fn build(&self, spec: &WorkerSpec, launch: &str) -> Result<Box<dyn Pipeline>>;
}
