//! Worker instance lifecycle.
//!
//! A worker instance owns one pipeline and one partition lease for its
//! lifetime. The instance's liveness lives in a `watch` channel: the
//! pipeline context flips it to `Running` on the first frame, the worker
//! task sets the terminal state, and the handle drives `Stopping` and kills.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use fleet_protocol::{Liveness, PartitionId, WorkerSpec};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::partition::PartitionTable;
use super::pipeline::{PipelineContext, PipelineExit, PipelineFactory};
use crate::base::error::{Error, Result};
use crate::telemetry::TelemetryBus;

/// Map a pipeline exit to the instance's terminal state.
///
/// A clean exit that nobody asked for is end of stream; a non-zero one is
/// a crash.
fn terminal_state(exit: PipelineExit, stop_requested: bool) -> Liveness {
    match exit {
        PipelineExit::Completed(code) if stop_requested || code == 0 => Liveness::Exited(code),
        PipelineExit::Completed(code) => Liveness::Crashed(format!("exited with code {}", code)),
        PipelineExit::Failed(reason) => Liveness::Crashed(reason),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Apply `target` if the state machine allows it. Returns whether it did.
fn try_transition(liveness: &watch::Sender<Liveness>, target: Liveness) -> bool {
    liveness.send_if_modified(|state| state.transition(target).is_ok())
}

/// Entry point for starting worker instances.
pub struct Worker;

impl Worker {
    /// Start one instance of `spec`.
    ///
    /// Acquires the spec's partition, builds the pipeline and runs it on its
    /// own task. `generation` distinguishes instances of the same slot.
    pub fn start(
        spec: Arc<WorkerSpec>,
        generation: u32,
        launch: &str,
        factory: &dyn PipelineFactory,
        partitions: &Arc<PartitionTable>,
        bus: &TelemetryBus,
    ) -> Result<WorkerHandle> {
        let lease = partitions.acquire(spec.partition, spec.index)?;
        let token = lease.token();

        // The lease is dropped (released) if the build fails
        let pipeline = factory.build(&spec, launch)?;

        let (liveness_tx, liveness_rx) = watch::channel(Liveness::Starting);
        let liveness_tx = Arc::new(liveness_tx);
        let (stop_tx, stop_rx) = watch::channel(false);

        let ctx = PipelineContext::new(
            Arc::clone(&spec),
            bus.emitter(spec.index, generation),
            stop_rx.clone(),
            Arc::clone(&liveness_tx),
        );

        let worker_id = spec.worker_id();
        let task_liveness = Arc::clone(&liveness_tx);
        let task = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(pipeline.run(ctx)).catch_unwind().await;
            let stop_requested = *stop_rx.borrow();

            let state = match outcome {
                Ok(exit) => terminal_state(exit, stop_requested),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!("[{}] Pipeline panicked: {}", worker_id, message);
                    Liveness::Crashed(format!("panicked: {}", message))
                }
            };

            // Partition goes back before the terminal state is visible
            drop(lease);
            if try_transition(&task_liveness, state.clone()) {
                debug!("[{}] Instance finished: {}", worker_id, state);
            }
        });

        info!(
            "[{}] Started on partition {} (generation {})",
            spec.worker_id(),
            spec.partition,
            generation
        );

        Ok(WorkerHandle {
            spec,
            generation,
            token,
            partitions: Arc::clone(partitions),
            liveness: liveness_tx,
            liveness_rx,
            stop_tx,
            task,
            task_joined: false,
            started_at: Instant::now(),
        })
    }
}

/// Control handle of one running worker instance.
#[derive(Debug)]
pub struct WorkerHandle {
    spec: Arc<WorkerSpec>,
    generation: u32,
    token: u64,
    partitions: Arc<PartitionTable>,
    liveness: Arc<watch::Sender<Liveness>>,
    liveness_rx: watch::Receiver<Liveness>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    task_joined: bool,
    started_at: Instant,
}

impl WorkerHandle {
    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    pub fn index(&self) -> usize {
        self.spec.index
    }

    pub fn partition(&self) -> PartitionId {
        self.spec.partition
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Current liveness of this instance.
    pub fn liveness(&self) -> Liveness {
        self.liveness_rx.borrow().clone()
    }

    /// Request a graceful stop. No-op on a stopping or terminal instance.
    pub fn stop(&self) {
        if try_transition(&self.liveness, Liveness::Stopping) {
            debug!("[{}] Stop requested", self.spec.worker_id());
            self.stop_tx.send_replace(true);
        }
    }

    /// Forced termination.
    ///
    /// Aborts the task and releases the partition whatever the pipeline is
    /// doing; records `Crashed("killed")` unless already terminal.
    pub fn kill(&self) {
        self.task.abort();
        self.partitions.release_if(self.spec.partition, self.token);
        if try_transition(&self.liveness, Liveness::Crashed("killed".to_string())) {
            warn!("[{}] Killed", self.spec.worker_id());
        }
    }

    /// Resolves once the instance is in a terminal state.
    pub async fn terminated(&self) -> Liveness {
        let mut rx = self.liveness_rx.clone();
        // The sender lives in `self`, so the channel cannot close here
        let state = rx.wait_for(Liveness::is_terminal).await.map(|s| s.clone());
        state.unwrap_or_else(|_| self.liveness())
    }

    /// Wait up to `timeout` for a terminal state.
    ///
    /// Returns `Err(ShutdownTimeout)` when the instance is still alive.
    pub async fn join(&self, timeout: Duration) -> Result<Liveness> {
        tokio::time::timeout(timeout, self.terminated())
            .await
            .map_err(|_| Error::ShutdownTimeout {
                worker: self.spec.index,
                timeout,
            })
    }

    /// Whether the worker task has finished (normally or aborted).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves when the worker task has finished, normally or aborted.
    ///
    /// Cancel safe; may be awaited again after it resolved.
    pub async fn finished(&mut self) {
        if !self.task_joined {
            if let Err(e) = (&mut self.task).await {
                if e.is_panic() {
                    warn!("[{}] Worker task panicked", self.spec.worker_id());
                }
            }
            self.task_joined = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{telemetry_channel, TelemetryAggregator};
    use crate::worker::synthetic::{SyntheticConfig, SyntheticFactory};
    use crate::worker::Pipeline;
    use fleet_protocol::DetectionThresholds;
    use futures::future::BoxFuture;

    fn spec(index: usize) -> Arc<WorkerSpec> {
        Arc::new(WorkerSpec {
            index,
            partition: PartitionId(index as u32 + 1),
            display: index == 0,
            source: "/dev/video0".to_string(),
            model: "model.hef".to_string(),
            thresholds: DetectionThresholds::default(),
        })
    }

    struct Fixture {
        aggregator: Arc<TelemetryAggregator>,
        bus: TelemetryBus,
        partitions: Arc<PartitionTable>,
    }

    fn fixture() -> Fixture {
        let aggregator = Arc::new(TelemetryAggregator::default());
        let (bus, ingest) = telemetry_channel(Arc::clone(&aggregator), 1024);
        tokio::spawn(ingest.run());
        Fixture {
            aggregator,
            bus,
            partitions: Arc::new(PartitionTable::new(4)),
        }
    }

    struct PanickingPipeline;

    impl Pipeline for PanickingPipeline {
        fn run(self: Box<Self>, _ctx: PipelineContext) -> BoxFuture<'static, PipelineExit> {
            Box::pin(async move { panic!("decoder exploded") })
        }
    }

    struct PanickingFactory;

    impl PipelineFactory for PanickingFactory {
        fn build(&self, _spec: &WorkerSpec, _launch: &str) -> Result<Box<dyn Pipeline>> {
            Ok(Box::new(PanickingPipeline))
        }
    }

    #[test]
    fn test_terminal_state_mapping() {
        assert_eq!(terminal_state(PipelineExit::Completed(0), false), Liveness::Exited(0));
        assert_eq!(terminal_state(PipelineExit::Completed(1), true), Liveness::Exited(1));
        assert!(matches!(
            terminal_state(PipelineExit::Completed(2), false),
            Liveness::Crashed(_)
        ));
        assert_eq!(
            terminal_state(PipelineExit::Failed("boom".into()), true),
            Liveness::Crashed("boom".into())
        );
    }

    #[tokio::test]
    async fn test_start_run_stop() {
        let fx = fixture();
        let factory = SyntheticFactory::new(SyntheticConfig::default().with_fps(100.0));
        let handle = Worker::start(spec(0), 0, "", &factory, &fx.partitions, &fx.bus).unwrap();
        assert!(fx.partitions.is_held(PartitionId(1)));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.liveness(), Liveness::Running);

        handle.stop();
        handle.stop();
        let state = handle.join(Duration::from_secs(2)).await.unwrap();
        assert_eq!(state, Liveness::Exited(0));
        assert!(!fx.partitions.is_held(PartitionId(1)));
        assert!(fx.aggregator.stats(0).unwrap().total_frames > 0);
    }

    #[tokio::test]
    async fn test_partition_conflict() {
        let fx = fixture();
        let factory = SyntheticFactory::default();
        let first = Worker::start(spec(1), 0, "", &factory, &fx.partitions, &fx.bus).unwrap();
        let err = Worker::start(spec(1), 1, "", &factory, &fx.partitions, &fx.bus).unwrap_err();
        assert!(matches!(err, Error::ResourceUnavailable { holder: 1, .. }));
        first.kill();
    }

    #[tokio::test]
    async fn test_launch_failure_releases_partition() {
        let fx = fixture();
        let factory = SyntheticFactory::default().with_launch_failure(2);
        let err = Worker::start(spec(2), 0, "", &factory, &fx.partitions, &fx.bus).unwrap_err();
        assert!(matches!(err, Error::LaunchFailure { worker: 2, .. }));
        assert!(!fx.partitions.is_held(PartitionId(3)));
    }

    #[tokio::test]
    async fn test_failure_becomes_crash() {
        let fx = fixture();
        let factory = SyntheticFactory::new(
            SyntheticConfig::default()
                .with_fps(100.0)
                .with_fail_after(Duration::from_millis(100)),
        );
        let handle = Worker::start(spec(0), 0, "", &factory, &fx.partitions, &fx.bus).unwrap();
        let state = handle.join(Duration::from_secs(2)).await.unwrap();
        assert!(matches!(state, Liveness::Crashed(_)));
        assert!(!fx.partitions.is_held(PartitionId(1)));
    }

    #[tokio::test]
    async fn test_end_of_stream_is_clean_exit() {
        let fx = fixture();
        let factory = SyntheticFactory::new(
            SyntheticConfig::default().with_fps(200.0).with_frame_limit(5),
        );
        let handle = Worker::start(spec(3), 0, "", &factory, &fx.partitions, &fx.bus).unwrap();
        let state = handle.join(Duration::from_secs(2)).await.unwrap();
        assert_eq!(state, Liveness::Exited(0));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let fx = fixture();
        let handle =
            Worker::start(spec(0), 0, "", &PanickingFactory, &fx.partitions, &fx.bus).unwrap();
        let state = handle.join(Duration::from_secs(2)).await.unwrap();
        match state {
            Liveness::Crashed(reason) => assert!(reason.contains("decoder exploded")),
            other => panic!("expected Crashed, got {}", other),
        }
        assert!(!fx.partitions.is_held(PartitionId(1)));
    }

    #[tokio::test]
    async fn test_kill_hanging_worker() {
        let fx = fixture();
        let factory = SyntheticFactory::new(
            SyntheticConfig::default().with_fps(100.0).with_hang(true),
        );
        let handle = Worker::start(spec(1), 0, "", &factory, &fx.partitions, &fx.bus).unwrap();

        handle.stop();
        let err = handle.join(Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, Error::ShutdownTimeout { worker: 1, .. }));

        handle.kill();
        assert_eq!(handle.liveness(), Liveness::Crashed("killed".into()));
        assert!(!fx.partitions.is_held(PartitionId(2)));

        // Kill after terminal keeps the first terminal state
        handle.kill();
        assert_eq!(handle.liveness(), Liveness::Crashed("killed".into()));
    }

    #[tokio::test]
    async fn test_finished_resolves_after_kill() {
        let fx = fixture();
        let factory = SyntheticFactory::new(SyntheticConfig::default().with_hang(true));
        let mut handle = Worker::start(spec(1), 0, "", &factory, &fx.partitions, &fx.bus).unwrap();

        handle.kill();
        tokio::time::timeout(Duration::from_secs(1), handle.finished())
            .await
            .unwrap();
        assert!(handle.is_finished());
        // Second await returns immediately
        tokio::time::timeout(Duration::from_millis(10), handle.finished())
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_pipeline_reports_frames() {
        use crate::worker::command::{CommandConfig, CommandFactory};

        let fx = fixture();
        let factory = CommandFactory::new(CommandConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "echo starting; for i in 1 2 3; do echo '{\"detections\": {index}}'; done".to_string(),
            ],
            check_model: false,
        });
        let handle = Worker::start(spec(2), 0, "", &factory, &fx.partitions, &fx.bus).unwrap();
        let state = handle.join(Duration::from_secs(5)).await.unwrap();
        assert_eq!(state, Liveness::Exited(0));

        // Give the ingest task a moment to drain
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = fx.aggregator.stats(2).unwrap();
        assert_eq!(stats.total_frames, 3);
        assert_eq!(stats.total_detections, 6);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_pipeline_stop_is_clean_exit() {
        use crate::worker::command::{CommandConfig, CommandFactory};

        let fx = fixture();
        let factory = CommandFactory::new(CommandConfig {
            program: "cat".to_string(),
            args: vec![],
            check_model: false,
        });
        let handle = Worker::start(spec(0), 0, "", &factory, &fx.partitions, &fx.bus).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        handle.stop();
        let state = handle.join(Duration::from_secs(5)).await.unwrap();
        // Either the interrupt (128 + SIGINT) or the closed stdin ends `cat`
        assert!(
            matches!(state, Liveness::Exited(0) | Liveness::Exited(130)),
            "unexpected state {:?}",
            state
        );
        assert!(!fx.partitions.is_held(PartitionId(1)));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_command_pipeline_interrupted_on_stop() {
        use crate::worker::command::{CommandConfig, CommandFactory};

        let fx = fixture();
        // Ignores stdin entirely; only SIGINT ends the stream
        let factory = CommandFactory::new(CommandConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "trap 'echo eos >&2; exit 0' INT; while :; do echo '{\"detections\": 1}'; sleep 0.05; done"
                    .to_string(),
            ],
            check_model: false,
        });
        let handle = Worker::start(spec(3), 0, "", &factory, &fx.partitions, &fx.bus).unwrap();

        let mut rx = handle.liveness_rx.clone();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(Liveness::is_running))
            .await
            .unwrap()
            .unwrap();

        handle.stop();
        let state = handle.join(Duration::from_secs(3)).await.unwrap();
        assert_eq!(state, Liveness::Exited(0));
        assert!(!fx.partitions.is_held(PartitionId(4)));
    }
}
