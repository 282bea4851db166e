//! Worker planning: static WorkerSpecs from configuration.

use fleet_protocol::{DetectionThresholds, WorkerSpec};

use super::config::PartitionRange;
use crate::base::error::{Error, Result};

/// Inputs shared by every worker of the fleet.
#[derive(Debug, Clone)]
pub struct FleetPlan {
    /// One descriptor for all workers, or one per worker
    pub sources: Vec<String>,
    /// One descriptor for all workers, or one per worker
    pub models: Vec<String>,
    pub thresholds: DetectionThresholds,
    /// Index of the display-enabled worker
    pub display_worker: usize,
}

impl FleetPlan {
    pub fn uniform(source: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            sources: vec![source.into()],
            models: vec![model.into()],
            thresholds: DetectionThresholds::default(),
            display_worker: 0,
        }
    }

    pub fn with_thresholds(mut self, thresholds: DetectionThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_display_worker(mut self, index: usize) -> Self {
        self.display_worker = index;
        self
    }
}

fn pick<'a>(list: &'a [String], index: usize, n: usize, what: &str) -> Result<&'a str> {
    match list.len() {
        1 => Ok(&list[0]),
        len if len == n => Ok(&list[index]),
        len => Err(Error::InvalidArgument(format!(
            "expected 1 or {} {} descriptor(s), got {}",
            n, what, len
        ))),
    }
}

/// Build the WorkerSpecs of `n` workers.
///
/// Worker `i` is bound to partition `range.first + i`; exactly one worker
/// is display-enabled.
pub fn plan_workers(n: usize, range: PartitionRange, plan: &FleetPlan) -> Result<Vec<WorkerSpec>> {
    if n == 0 || n > range.len() {
        return Err(Error::InsufficientPartitions {
            requested: n,
            available: range.len(),
        });
    }
    if plan.display_worker >= n {
        return Err(Error::InvalidArgument(format!(
            "display worker {} is outside 0..{}",
            plan.display_worker, n
        )));
    }
    plan.thresholds.validate().map_err(Error::InvalidArgument)?;

    (0..n)
        .map(|index| {
            let partition = range.nth(index).ok_or(Error::InsufficientPartitions {
                requested: n,
                available: range.len(),
            })?;
            Ok(WorkerSpec {
                index,
                partition,
                display: index == plan.display_worker,
                source: pick(&plan.sources, index, n, "source")?.to_string(),
                model: pick(&plan.models, index, n, "model")?.to_string(),
                thresholds: plan.thresholds,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_protocol::PartitionId;
    use std::collections::HashSet;

    #[test]
    fn test_partitions_unique_for_every_n() {
        let range = PartitionRange::new(1, 8);
        let plan = FleetPlan::uniform("/dev/video0", "yolov11l.hef");
        for n in 1..=8 {
            let specs = plan_workers(n, range, &plan).unwrap();
            let partitions: HashSet<PartitionId> = specs.iter().map(|s| s.partition).collect();
            assert_eq!(partitions.len(), n);
            assert!(partitions.iter().all(|p| range.contains(*p)));
            assert_eq!(specs.iter().filter(|s| s.display).count(), 1);
        }
    }

    #[test]
    fn test_partition_offset() {
        let specs = plan_workers(
            2,
            PartitionRange::new(3, 4),
            &FleetPlan::uniform("a", "m"),
        )
        .unwrap();
        assert_eq!(specs[0].partition, PartitionId(3));
        assert_eq!(specs[1].partition, PartitionId(4));
    }

    #[test]
    fn test_insufficient_partitions() {
        let plan = FleetPlan::uniform("a", "m");
        let err = plan_workers(5, PartitionRange::new(1, 4), &plan).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientPartitions {
                requested: 5,
                available: 4
            }
        ));
        assert!(plan_workers(0, PartitionRange::new(1, 4), &plan).is_err());
    }

    #[test]
    fn test_per_worker_descriptors() {
        let plan = FleetPlan {
            sources: vec!["s0".into(), "s1".into(), "s2".into()],
            models: vec!["m".into()],
            thresholds: DetectionThresholds::new(0.25, 0.45),
            display_worker: 2,
        };
        let specs = plan_workers(3, PartitionRange::new(1, 4), &plan).unwrap();
        assert_eq!(specs[1].source, "s1");
        assert_eq!(specs[1].model, "m");
        assert!(specs[2].display);
        assert!(!specs[0].display);
        assert_eq!(specs[0].thresholds.score, 0.25);

        let err = plan_workers(2, PartitionRange::new(1, 4), &plan).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_invalid_thresholds() {
        let plan = FleetPlan::uniform("a", "m").with_thresholds(DetectionThresholds::new(2.0, 0.5));
        assert!(matches!(
            plan_workers(1, PartitionRange::new(1, 1), &plan),
            Err(Error::InvalidArgument(_))
        ));
    }
}
