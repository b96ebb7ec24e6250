//! Multi-window exponential moving averages, sampled at irregular intervals.
//!
//! A sample's weight depends on how long it's been since the last update: `alpha = 1 -
//! exp(-dt / window)`. Samples that arrive in quick succession barely move a long
//! window's average; samples separated by a long gap are weighted almost fully, since a
//! sparse sample is the best information the window has.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A set of independently tracked moving averages, one per configured window.
pub struct TimeEma {
    inner: Mutex<Inner>,
}

struct Inner {
    windows: HashMap<Duration, f64>,
    last: Option<Instant>,
}

impl TimeEma {
    /// Create a tracker for the given windows, all initialized to zero.
    pub fn new(windows: impl IntoIterator<Item = Duration>) -> Self {
        let windows = windows.into_iter().map(|w| (w, 0.0)).collect();
        Self {
            inner: Mutex::new(Inner {
                windows,
                last: None,
            }),
        }
    }

    /// Fold a new sample (e.g. a task duration, in seconds) into every window.
    pub fn update(&self, sample: f64) {
        self.update_at(sample, Instant::now());
    }

    /// Like [`TimeEma::update`], but with an explicit timestamp — used by tests to avoid
    /// depending on wall-clock sleeps.
    pub fn update_at(&self, sample: f64, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let dt = inner.last.map_or(Duration::ZERO, |last| {
            now.saturating_duration_since(last)
        });
        inner.last = Some(now);

        for (window, avg) in &mut inner.windows {
            let alpha = if window.is_zero() {
                1.0
            } else {
                1.0 - (-dt.as_secs_f64() / window.as_secs_f64()).exp()
            };
            *avg = alpha * sample + (1.0 - alpha) * *avg;
        }
    }

    /// The configured windows, in no particular order.
    pub fn keys(&self) -> Vec<Duration> {
        self.inner.lock().unwrap().windows.keys().copied().collect()
    }

    /// The current average for `window`, or `None` if that window wasn't configured.
    pub fn get(&self, window: Duration) -> Option<f64> {
        self.inner.lock().unwrap().windows.get(&window).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_adopted_fully() {
        let ema = TimeEma::new([Duration::from_secs(60)]);
        ema.update(10.0);
        assert_eq!(ema.get(Duration::from_secs(60)), Some(10.0));
    }

    #[test]
    fn sparse_sample_is_weighted_more_than_dense_one() {
        let start = Instant::now();
        let window = Duration::from_secs(60);

        let dense = TimeEma::new([window]);
        dense.update_at(10.0, start);
        dense.update_at(0.0, start + Duration::from_millis(1));

        let sparse = TimeEma::new([window]);
        sparse.update_at(10.0, start);
        sparse.update_at(0.0, start + Duration::from_secs(600));

        let dense_avg = dense.get(window).unwrap();
        let sparse_avg = sparse.get(window).unwrap();
        assert!(sparse_avg < dense_avg, "{sparse_avg} should be < {dense_avg}");
        assert!(sparse_avg < 0.1, "a long gap should nearly fully adopt the new sample");
    }

    #[test]
    fn unconfigured_window_is_none() {
        let ema = TimeEma::new([Duration::from_secs(60)]);
        assert_eq!(ema.get(Duration::from_secs(5)), None);
    }

    #[test]
    fn keys_reflects_constructed_windows() {
        let windows = [Duration::from_secs(1), Duration::from_secs(60)];
        let ema = TimeEma::new(windows);
        let mut keys = ema.keys();
        keys.sort();
        assert_eq!(keys, windows);
    }
}
