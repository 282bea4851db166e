//! Sliding-window frame rate estimation.

use std::collections::VecDeque;

/// Default number of timestamps kept per worker.
pub const DEFAULT_RATE_WINDOW: usize = 60;

/// Fixed-capacity ring of recent sample timestamps.
///
/// The window is count-based rather than time-based, so the estimate stays
/// stable when frames arrive in bursts.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window: VecDeque<f64>,
    capacity: usize,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW)
    }
}

impl RateEstimator {
    /// A capacity below 2 can never produce a rate, so it is raised to 2.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a timestamp (seconds), evicting the oldest one when full.
    pub fn record(&mut self, timestamp: f64) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(timestamp);
    }

    /// Samples per second over the current window.
    ///
    /// Returns `0.0` with fewer than two samples or a non-positive span.
    pub fn rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.window.front(), self.window.back()) else {
            return 0.0;
        };
        let span = last - first;
        if self.window.len() < 2 || span <= 0.0 {
            return 0.0;
        }
        (self.window.len() - 1) as f64 / span
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}
