//! External pipeline process.
//!
//! Runs one child process per worker. The program is a wrapper around the
//! GStreamer launch description that prints one `FrameReport` JSON line per
//! frame seen at the `identity_callback_<index>` element, e.g.
//! `{"detections": 3}`. Stock `gst-launch-1.0` prints no such lines and
//! would show up as a fleet that never produces frames.
//!
//! Every stdout line that parses as a `FrameReport` is one processed frame;
//! everything else is logged at debug level. A stop request sends SIGINT to
//! the child (EOS for GStreamer applications) and closes its stdin.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use fleet_protocol::{unix_now, FrameReport, WorkerSpec};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::pipeline::{Pipeline, PipelineContext, PipelineExit, PipelineFactory};
use crate::base::error::{Error, Result};

/// Program and argument template of the external pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Wrapper program printing one `FrameReport` line per frame
    pub program: String,
    /// Arguments; `{launch}`, `{partition}`, `{index}`, `{source}` and
    /// `{model}` are substituted per worker
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    /// Require the model descriptor to be an existing file
    #[serde(default = "default_check_model")]
    pub check_model: bool,
}

fn default_args() -> Vec<String> {
    vec!["{launch}".to_string()]
}

fn default_check_model() -> bool {
    true
}

impl CommandConfig {
    /// Run `program` with the launch description as its only argument.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: default_args(),
            check_model: default_check_model(),
        }
    }
}

/// Substitute the per-worker placeholders in one argument.
pub fn substitute(template: &str, spec: &WorkerSpec, launch: &str) -> String {
    template
        .replace("{launch}", launch)
        .replace("{partition}", &spec.partition.to_string())
        .replace("{index}", &spec.index.to_string())
        .replace("{source}", &spec.source)
        .replace("{model}", &spec.model)
}

/// Resolve `program` the way a shell would: paths are taken as is, bare
/// names are looked up in `PATH`.
fn find_program(program: &str) -> Option<PathBuf> {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    })
}

/// One external pipeline process.
#[derive(Debug)]
pub struct CommandPipeline {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandPipeline {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    async fn run_child(self, ctx: PipelineContext) -> PipelineExit {
        let worker_id = ctx.spec().worker_id();

        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return PipelineExit::Failed(format!(
                    "failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            }
        };
        info!("[{}] Pipeline process started (PID: {:?})", worker_id, child.id());

        let mut stdin = child.stdin.take();
        let mut interrupted = false;

        if let Some(stderr) = child.stderr.take() {
            let worker_id = worker_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] stderr: {}", worker_id, line);
                }
            });
        }

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = ctx.stopped(), if !interrupted => {
                        interrupted = true;
                        debug!("[{}] Interrupting pipeline process", worker_id);
                        interrupt(&child);
                        drop(stdin.take());
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match FrameReport::parse_line(&line) {
                            Some(report) => {
                                let timestamp = report.timestamp.unwrap_or_else(unix_now);
                                ctx.emit(timestamp, report.detections);
                            }
                            None => debug!("[{}] {}", worker_id, line),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!("[{}] Failed to read pipeline output: {}", worker_id, e);
                            break;
                        }
                    }
                }
            }
        }

        drop(stdin);
        match child.wait().await {
            Ok(status) => match (status.code(), signal_code(&status)) {
                (Some(code), _) => PipelineExit::Completed(code),
                // Dying from our own interrupt is a requested stop
                (None, Some(code)) if interrupted => PipelineExit::Completed(code),
                (None, _) => PipelineExit::Failed(format!("terminated by signal ({})", status)),
            },
            Err(e) => PipelineExit::Failed(format!("failed to wait for pipeline: {}", e)),
        }
    }
}

/// Shell-style exit code (128 + signal) of a signal-terminated child.
#[cfg(unix)]
fn signal_code(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|signal| 128 + signal)
}

#[cfg(not(unix))]
fn signal_code(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Ask the child to finish its stream; `kill_on_drop` covers the rest.
#[cfg(unix)]
fn interrupt(child: &Child) {
    if let Some(pid) = child.id() {
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
        if rc != 0 {
            debug!(
                "SIGINT to pipeline {} failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) {}

impl Pipeline for CommandPipeline {
    fn run(self: Box<Self>, ctx: PipelineContext) -> BoxFuture<'static, PipelineExit> {
        Box::pin(self.run_child(ctx))
    }
}

/// Builds `CommandPipeline`s from worker specs.
#[derive(Debug, Clone)]
pub struct CommandFactory {
    config: CommandConfig,
}

impl CommandFactory {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

impl PipelineFactory for CommandFactory {
    fn build(&self, spec: &WorkerSpec, launch: &str) -> Result<Box<dyn Pipeline>> {
        if self.config.check_model && !Path::new(&spec.model).is_file() {
            return Err(Error::LaunchFailure {
                worker: spec.index,
                reason: format!("model not found: {}", spec.model),
            });
        }

        let program = find_program(&self.config.program).ok_or_else(|| Error::LaunchFailure {
            worker: spec.index,
            reason: format!("program not found: {}", self.config.program),
        })?;

        let args = self
            .config
            .args
            .iter()
            .map(|arg| substitute(arg, spec, launch))
            .collect();

        Ok(Box::new(CommandPipeline::new(program, args)))
    }
}
