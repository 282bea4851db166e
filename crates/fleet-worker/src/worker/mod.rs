//! Worker Module
//!
//! One worker instance = one pipeline + one partition lease + one tokio task.
//!
//! ```text
//! Worker::start(spec)
//!   ├─ PartitionTable::acquire(spec.partition)   ResourceUnavailable
//!   ├─ PipelineFactory::build(spec, launch)      LaunchFailure
//!   └─ tokio::spawn(pipeline.run(ctx))
//!         ctx.emit() ──► TelemetryEmitter (try_send)
//!         exit / panic ──► release lease ──► Exited | Crashed
//! ```

pub mod command;
pub mod handle;
pub mod launch;
pub mod partition;
pub mod pipeline;
pub mod synthetic;

pub use command::{CommandConfig, CommandFactory, CommandPipeline};
pub use handle::{Worker, WorkerHandle};
pub use launch::{build_launch_description, VideoFormat};
pub use partition::{LeaseHolder, PartitionLease, PartitionTable};
pub use pipeline::{Pipeline, PipelineContext, PipelineExit, PipelineFactory};
pub use synthetic::{SyntheticConfig, SyntheticFactory, SyntheticPipeline};
