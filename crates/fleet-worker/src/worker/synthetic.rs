//! Synthetic detector.
//!
//! Emits frames at a fixed rate with random detection counts, for dry runs
//! of the supervisor without an accelerator. Failure injection:
//! - `fail_after`: fail once the instance has run this long
//! - `crash_chance`: fail right at startup with this probability
//! - `silent_after`: stop emitting after N frames but keep running
//! - `hang`: ignore stop requests

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use fleet_protocol::WorkerSpec;
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::pipeline::{Pipeline, PipelineContext, PipelineExit, PipelineFactory};
use crate::base::error::{Error, Result};

/// Behavior of a synthetic pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Frames per second
    pub fps: f64,
    /// Upper bound (inclusive) of detections per frame
    pub max_detections: u32,
    /// End of stream after this many frames
    pub frame_limit: Option<u64>,
    /// Fail after running this long
    #[serde(with = "opt_secs")]
    pub fail_after: Option<Duration>,
    /// Probability of failing at startup
    pub crash_chance: Option<f32>,
    /// Go silent after this many frames
    pub silent_after: Option<u64>,
    /// Ignore stop requests
    pub hang: bool,
    /// Base seed; each worker mixes in its index
    pub seed: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            max_detections: 8,
            frame_limit: None,
            fail_after: None,
            crash_chance: None,
            silent_after: None,
            hang: false,
            seed: None,
        }
    }
}

impl SyntheticConfig {
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    pub fn with_fail_after(mut self, after: Duration) -> Self {
        self.fail_after = Some(after);
        self
    }

    pub fn with_crash_chance(mut self, chance: f32) -> Self {
        self.crash_chance = Some(chance);
        self
    }

    pub fn with_silent_after(mut self, frames: u64) -> Self {
        self.silent_after = Some(frames);
        self
    }

    pub fn with_hang(mut self, hang: bool) -> Self {
        self.hang = hang;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs: Option<f64> = Option::deserialize(d)?;
        match secs {
            Some(s) if s.is_finite() && s >= 0.0 => Ok(Some(Duration::from_secs_f64(s))),
            Some(s) => Err(serde::de::Error::custom(format!("invalid duration {}", s))),
            None => Ok(None),
        }
    }
}

/// Simulated detector instance.
pub struct SyntheticPipeline {
    config: SyntheticConfig,
    rng: StdRng,
}

impl SyntheticPipeline {
    pub fn new(config: SyntheticConfig, index: usize) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ (index as u64).wrapping_mul(0x9E37_79B9)),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self { config, rng }
    }

    async fn run_loop(mut self, ctx: PipelineContext) -> PipelineExit {
        let worker_id = ctx.spec().worker_id();
        let cfg = self.config.clone();

        if let Some(chance) = cfg.crash_chance {
            if chance > 0.0 && self.rng.random::<f32>() < chance {
                warn!("[{}] Simulated crash at startup", worker_id);
                return PipelineExit::Failed("simulated startup crash".to_string());
            }
        }

        if !(cfg.fps.is_finite() && cfg.fps > 0.0) {
            return PipelineExit::Failed(format!("invalid frame rate {}", cfg.fps));
        }

        let started = Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / cfg.fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = ctx.stopped(), if !cfg.hang => {
                    debug!("[{}] Stop requested after {} frames", worker_id, frames);
                    return PipelineExit::Completed(0);
                }
                _ = ticker.tick() => {
                    if let Some(after) = cfg.fail_after {
                        if started.elapsed() >= after {
                            warn!("[{}] Simulated failure after {:?}", worker_id, after);
                            return PipelineExit::Failed(format!("simulated failure after {:?}", after));
                        }
                    }

                    if cfg.silent_after.is_some_and(|limit| frames >= limit) {
                        continue;
                    }

                    let detections = self.rng.random_range(0..=cfg.max_detections);
                    ctx.emit_now(detections);
                    frames += 1;

                    if cfg.frame_limit.is_some_and(|limit| frames >= limit) {
                        debug!("[{}] End of stream after {} frames", worker_id, frames);
                        return PipelineExit::Completed(0);
                    }
                }
            }
        }
    }
}

impl Pipeline for SyntheticPipeline {
    fn run(self: Box<Self>, ctx: PipelineContext) -> BoxFuture<'static, PipelineExit> {
        Box::pin(self.run_loop(ctx))
    }
}

/// Builds synthetic pipelines, optionally with per-worker behavior.
#[derive(Debug, Clone, Default)]
pub struct SyntheticFactory {
    config: SyntheticConfig,
    overrides: HashMap<usize, SyntheticConfig>,
    launch_failures: HashSet<usize>,
}

impl SyntheticFactory {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            overrides: HashMap::new(),
            launch_failures: HashSet::new(),
        }
    }

    /// Use `config` for worker `index` instead of the shared one.
    pub fn with_override(mut self, index: usize, config: SyntheticConfig) -> Self {
        self.overrides.insert(index, config);
        self
    }

    /// Make building worker `index` fail.
    pub fn with_launch_failure(mut self, index: usize) -> Self {
        self.launch_failures.insert(index);
        self
    }

    fn config_for(&self, index: usize) -> &SyntheticConfig {
        self.overrides.get(&index).unwrap_or(&self.config)
    }
}

impl PipelineFactory for SyntheticFactory {
    fn build(&self, spec: &WorkerSpec, _launch: &str) -> Result<Box<dyn Pipeline>> {
        if self.launch_failures.contains(&spec.index) {
            return Err(Error::LaunchFailure {
                worker: spec.index,
                reason: "simulated launch failure".to_string(),
            });
        }
        Ok(Box::new(SyntheticPipeline::new(
            self.config_for(spec.index).clone(),
            spec.index,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders() {
        let cfg = SyntheticConfig::default()
            .with_fps(100.0)
            .with_frame_limit(10)
            .with_fail_after(Duration::from_millis(500))
            .with_hang(true)
            .with_seed(7);
        assert_eq!(cfg.fps, 100.0);
        assert_eq!(cfg.frame_limit, Some(10));
        assert_eq!(cfg.fail_after, Some(Duration::from_millis(500)));
        assert!(cfg.hang);
        assert_eq!(cfg.seed, Some(7));
    }

    #[test]
    fn test_config_from_yaml() {
        let cfg: SyntheticConfig =
            serde_yaml::from_str("fps: 50\nfail_after: 2.5\nmax_detections: 3\n").unwrap();
        assert_eq!(cfg.fps, 50.0);
        assert_eq!(cfg.fail_after, Some(Duration::from_millis(2500)));
        assert_eq!(cfg.max_detections, 3);
        assert!(!cfg.hang);

        assert!(serde_yaml::from_str::<SyntheticConfig>("fail_after: -1\n").is_err());
    }

    #[test]
    fn test_factory_overrides() {
        let factory = SyntheticFactory::new(SyntheticConfig::default())
            .with_override(2, SyntheticConfig::default().with_fps(5.0))
            .with_launch_failure(3);
        assert_eq!(factory.config_for(0).fps, 30.0);
        assert_eq!(factory.config_for(2).fps, 5.0);
        assert!(factory.launch_failures.contains(&3));
    }
}
