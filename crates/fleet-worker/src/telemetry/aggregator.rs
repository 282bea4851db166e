//! Telemetry Aggregator
//!
//! Process-wide map of worker index to cumulative statistics. Every entry
//! carries its own mutex, so an ingest for worker 2 never waits on an ingest
//! for worker 3; the map itself (a `DashMap`) is only touched to find or
//! lazily create an entry.
//!
//! Writers:
//! - `ingest()`: the telemetry path, one call per frame
//! - `begin_instance()` / `mark_liveness()`: the supervisor, the single
//!   writer of liveness and of the current instance generation
//!
//! Samples tagged with an older generation than the slot's current one were
//! still in the channel when their instance was replaced; they are counted
//! as stale and otherwise ignored.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use fleet_protocol::{unix_now, Liveness, TelemetrySample};
use serde::Serialize;

use super::rate::{RateEstimator, DEFAULT_RATE_WINDOW};

/// Cumulative statistics of one worker slot (copied out by `snapshot()`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStats {
    /// Worker index
    pub index: usize,
    /// Frames processed across all instances of this slot
    pub total_frames: u64,
    /// Detections across all instances of this slot
    pub total_detections: u64,
    /// Detections in the most recent frame
    pub last_detections: u32,
    /// Sliding-window rate of the current instance (frames/s)
    pub current_rate: f64,
    /// First time this slot was seen (seconds since epoch)
    pub started_at: f64,
    /// Timestamp of the latest sample
    pub last_sample_at: Option<f64>,
    /// Liveness as last recorded by the supervisor
    pub liveness: Liveness,
    /// Number of times the slot was restarted
    pub restarts: u32,
    /// Generation of the current instance
    pub generation: u32,
}

impl WorkerStats {
    fn new(index: usize, started_at: f64) -> Self {
        Self {
            index,
            total_frames: 0,
            total_detections: 0,
            last_detections: 0,
            current_rate: 0.0,
            started_at,
            last_sample_at: None,
            liveness: Liveness::Starting,
            restarts: 0,
            generation: 0,
        }
    }

    /// Seconds between the slot's first appearance and `now`.
    pub fn lifetime_secs(&self, now: f64) -> f64 {
        (now - self.started_at).max(0.0)
    }

    /// Lifetime average frame rate (frames / lifetime seconds).
    pub fn average_rate(&self, now: f64) -> f64 {
        let lifetime = self.lifetime_secs(now);
        if lifetime > 0.0 {
            self.total_frames as f64 / lifetime
        } else {
            0.0
        }
    }
}

/// Immutable copy of the aggregate state.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    /// Wall-clock time the snapshot was taken
    pub taken_at: f64,
    /// One entry per known worker, sorted by index
    pub workers: Vec<WorkerStats>,
    /// Samples dropped because the ingestion channel was full
    pub dropped_samples: u64,
}

impl TelemetrySnapshot {
    pub fn get(&self, index: usize) -> Option<&WorkerStats> {
        self.workers.iter().find(|w| w.index == index)
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[derive(Debug)]
struct StatsEntry {
    stats: WorkerStats,
    estimator: RateEstimator,
}

/// Shared telemetry store. Owned by the supervisor, shared by `Arc`.
#[derive(Debug)]
pub struct TelemetryAggregator {
    entries: DashMap<usize, Arc<Mutex<StatsEntry>>>,
    rate_window: usize,
    dropped: AtomicU64,
    stale: AtomicU64,
}

impl Default for TelemetryAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW)
    }
}

impl TelemetryAggregator {
    pub fn new(rate_window: usize) -> Self {
        Self {
            entries: DashMap::new(),
            rate_window,
            dropped: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    /// Find or lazily create the entry for `index`.
    ///
    /// The map shard lock is released before the entry lock is taken.
    fn entry(&self, index: usize) -> Arc<Mutex<StatsEntry>> {
        if let Some(entry) = self.entries.get(&index) {
            return Arc::clone(entry.value());
        }
        let rate_window = self.rate_window;
        let entry = self.entries.entry(index).or_insert_with(|| {
            Arc::new(Mutex::new(StatsEntry {
                stats: WorkerStats::new(index, unix_now()),
                estimator: RateEstimator::new(rate_window),
            }))
        });
        Arc::clone(entry.value())
    }

    fn lock(entry: &Mutex<StatsEntry>) -> MutexGuard<'_, StatsEntry> {
        entry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold one sample into its worker's counters and rate window.
    pub fn ingest(&self, sample: TelemetrySample) {
        let entry = self.entry(sample.worker);
        let mut guard = Self::lock(&entry);
        let StatsEntry { stats, estimator } = &mut *guard;

        if sample.generation < stats.generation {
            self.stale.fetch_add(1, Ordering::Relaxed);
            return;
        }

        stats.total_frames += 1;
        stats.total_detections += u64::from(sample.detections);
        stats.last_detections = sample.detections;
        stats.last_sample_at = Some(match stats.last_sample_at {
            Some(prev) => prev.max(sample.timestamp),
            None => sample.timestamp,
        });
        estimator.record(sample.timestamp);
        stats.current_rate = estimator.rate();
    }

    /// Record a liveness transition observed by the supervisor.
    ///
    /// Moving a slot from a terminal state back to `Starting` is a restart:
    /// the rate window is cleared and the restart counter incremented, while
    /// cumulative counters are kept.
    pub fn mark_liveness(&self, index: usize, state: Liveness) {
        let entry = self.entry(index);
        let mut guard = Self::lock(&entry);
        let StatsEntry { stats, estimator } = &mut *guard;

        if state == Liveness::Starting && stats.liveness.is_terminal() {
            stats.restarts += 1;
            estimator.reset();
            stats.current_rate = 0.0;
        }
        if state.is_terminal() {
            stats.current_rate = 0.0;
        }
        stats.liveness = state;
    }

    /// Record that instance `generation` of slot `index` is starting.
    ///
    /// Same restart semantics as `mark_liveness(index, Starting)`; from now on
    /// samples of earlier instances are ignored.
    pub fn begin_instance(&self, index: usize, generation: u32) {
        {
            let entry = self.entry(index);
            let mut guard = Self::lock(&entry);
            guard.stats.generation = guard.stats.generation.max(generation);
        }
        self.mark_liveness(index, Liveness::Starting);
    }

    /// Count a sample the ingestion path had to drop.
    pub fn note_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Samples ignored because a newer instance of their slot had started.
    pub fn stale_samples(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    /// Timestamp of the latest sample of `index`, if any.
    pub fn last_sample_at(&self, index: usize) -> Option<f64> {
        let entry = self.entries.get(&index).map(|e| Arc::clone(e.value()))?;
        let guard = Self::lock(&entry);
        guard.stats.last_sample_at
    }

    /// Copy of one worker's statistics.
    pub fn stats(&self, index: usize) -> Option<WorkerStats> {
        let entry = self.entries.get(&index).map(|e| Arc::clone(e.value()))?;
        let guard = Self::lock(&entry);
        Some(guard.stats.clone())
    }

    /// Copy all statistics, sorted by worker index.
    ///
    /// Each entry lock is held only while that entry is cloned.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let entries: Vec<Arc<Mutex<StatsEntry>>> = self
            .entries
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut workers: Vec<WorkerStats> = entries
            .iter()
            .map(|entry| Self::lock(entry).stats.clone())
            .collect();
        workers.sort_by_key(|w| w.index);

        TelemetrySnapshot {
            taken_at: unix_now(),
            workers,
            dropped_samples: self.dropped_samples(),
        }
    }

    /// Number of worker slots seen so far.
    pub fn worker_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_lazy_entry_creation() {
        let agg = TelemetryAggregator::default();
        assert!(agg.snapshot().is_empty());
        assert!(agg.stats(0).is_none());

        agg.ingest(TelemetrySample::new(3, 10.0, 2));
        let snap = agg.snapshot();
        assert_eq!(snap.workers.len(), 1);
        assert_eq!(snap.workers[0].index, 3);
        assert_eq!(snap.workers[0].total_frames, 1);
        assert_eq!(snap.workers[0].total_detections, 2);
    }

    #[test]
    fn test_ingest_counters_and_rate() {
        let agg = TelemetryAggregator::new(60);
        for i in 0..21 {
            agg.ingest(TelemetrySample::new(0, 100.0 + i as f64 * 0.05, 3));
        }

        let stats = agg.stats(0).unwrap();
        assert_eq!(stats.total_frames, 21);
        assert_eq!(stats.total_detections, 63);
        assert_eq!(stats.last_detections, 3);
        assert!((stats.current_rate - 20.0).abs() < 1e-6);
        assert_eq!(agg.last_sample_at(0), Some(101.0));
    }

    #[test]
    fn test_snapshot_sorted() {
        let agg = TelemetryAggregator::default();
        for index in [2usize, 0, 3, 1] {
            agg.ingest(TelemetrySample::new(index, 1.0, 0));
        }
        let indices: Vec<usize> = agg.snapshot().workers.iter().map(|w| w.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_concurrent_ingest_no_lost_updates() {
        let agg = Arc::new(TelemetryAggregator::default());
        let workers = 8;
        let per_worker = 5_000u64;

        let threads: Vec<_> = (0..workers)
            .map(|index| {
                let agg = Arc::clone(&agg);
                thread::spawn(move || {
                    for i in 0..per_worker {
                        agg.ingest(TelemetrySample::new(index, i as f64 * 0.001, 1));
                    }
                })
            })
            .collect();

        // A concurrent reader must not disturb the writers
        for _ in 0..50 {
            let _ = agg.snapshot();
        }

        for t in threads {
            t.join().unwrap();
        }

        let snap = agg.snapshot();
        assert_eq!(snap.workers.len(), workers);
        for stats in &snap.workers {
            assert_eq!(stats.total_frames, per_worker);
            assert_eq!(stats.total_detections, per_worker);
        }
    }

    #[test]
    fn test_restart_keeps_totals_and_resets_window() {
        let agg = TelemetryAggregator::default();
        agg.mark_liveness(1, Liveness::Starting);
        for i in 0..10 {
            agg.ingest(TelemetrySample::new(1, i as f64 * 0.1, 1));
        }
        agg.mark_liveness(1, Liveness::Running);
        assert!(agg.stats(1).unwrap().current_rate > 0.0);

        agg.mark_liveness(1, Liveness::Crashed("accelerator fault".into()));
        agg.mark_liveness(1, Liveness::Starting);

        let stats = agg.stats(1).unwrap();
        assert_eq!(stats.total_frames, 10);
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.current_rate, 0.0);
        assert_eq!(stats.liveness, Liveness::Starting);

        // A single post-restart sample is not enough for a rate
        agg.ingest(TelemetrySample::new(1, 5.0, 0));
        let stats = agg.stats(1).unwrap();
        assert_eq!(stats.total_frames, 11);
        assert_eq!(stats.current_rate, 0.0);
    }

    #[test]
    fn test_samples_of_replaced_instance_are_ignored() {
        let agg = TelemetryAggregator::default();
        agg.begin_instance(2, 0);
        for i in 0..5 {
            agg.ingest(TelemetrySample::new(2, 10.0 + i as f64 * 0.25, 1));
        }
        agg.mark_liveness(2, Liveness::Crashed("killed".into()));
        agg.begin_instance(2, 1);

        // Still queued from the killed instance
        for i in 0..5 {
            agg.ingest(TelemetrySample::new(2, 20.0 + i as f64 * 0.1, 7).with_generation(0));
        }
        let stats = agg.stats(2).unwrap();
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.total_frames, 5);
        assert_eq!(stats.total_detections, 5);
        assert_eq!(stats.current_rate, 0.0);
        assert_eq!(stats.last_sample_at, Some(11.0));
        assert_eq!(agg.stale_samples(), 5);

        agg.ingest(TelemetrySample::new(2, 30.0, 4).with_generation(1));
        let stats = agg.stats(2).unwrap();
        assert_eq!(stats.total_frames, 6);
        assert_eq!(stats.last_detections, 4);
        assert_eq!(stats.last_sample_at, Some(30.0));
    }

    #[test]
    fn test_starting_to_running_is_not_restart() {
        let agg = TelemetryAggregator::default();
        agg.mark_liveness(0, Liveness::Starting);
        agg.mark_liveness(0, Liveness::Running);
        agg.mark_liveness(0, Liveness::Stopping);
        agg.mark_liveness(0, Liveness::Exited(0));
        assert_eq!(agg.stats(0).unwrap().restarts, 0);
    }

    #[test]
    fn test_average_rate() {
        let mut stats = WorkerStats::new(0, 100.0);
        stats.total_frames = 300;
        assert!((stats.average_rate(110.0) - 30.0).abs() < 1e-9);
        assert_eq!(stats.average_rate(100.0), 0.0);
        assert_eq!(stats.average_rate(90.0), 0.0);
    }

    #[test]
    fn test_dropped_counter() {
        let agg = TelemetryAggregator::default();
        agg.note_dropped();
        agg.note_dropped();
        assert_eq!(agg.snapshot().dropped_samples, 2);
    }
}
