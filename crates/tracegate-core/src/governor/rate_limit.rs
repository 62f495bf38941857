//! Per-requester start throttling.
//!
//! Combines a minimum spacing between consecutive starts with a sliding
//! window cap on the number of starts, both keyed by requester.

use crate::session::Identity;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct StartLimiter {
    /// Minimum time between two starts by the same requester.
    min_interval: Duration,
    /// Maximum starts allowed within `window`.
    max_starts: u32,
    window: Duration,
    /// Per-requester start timestamps, oldest first.
    entries: HashMap<Identity, Vec<Instant>>,
}

impl StartLimiter {
    /// Create a limiter.
    ///
    /// # Arguments
    ///
    /// * `min_interval` - Minimum gap between two starts by one requester (zero disables).
    /// * `max_starts` - Starts allowed per `window` (zero disables).
    /// * `window` - Length of the sliding window.
    pub fn new(min_interval: Duration, max_starts: u32, window: Duration) -> Self {
        Self {
            min_interval,
            max_starts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Check whether `requester` may start now. `Err` carries the wait time.
    pub fn check(&self, requester: &Identity, now: Instant) -> Result<(), Duration> {
        let Some(starts) = self.entries.get(requester) else {
            return Ok(());
        };

        if let Some(last) = starts.last() {
            let since = now.saturating_duration_since(*last);
            if since < self.min_interval {
                return Err(self.min_interval - since);
            }
        }

        let in_window: Vec<&Instant> = starts
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.window)
            .collect();
        if self.max_starts > 0 && in_window.len() as u32 >= self.max_starts {
            let oldest = in_window[0];
            return Err(self.window - now.saturating_duration_since(*oldest));
        }

        Ok(())
    }

    /// Record a start. Only called once admission has fully succeeded.
    pub fn record(&mut self, requester: &Identity, now: Instant) {
        let window = self.window;
        let starts = self.entries.entry(requester.clone()).or_default();
        starts.retain(|t| now.saturating_duration_since(*t) < window);
        starts.push(now);
    }

    /// Drop timestamps that no longer affect any decision.
    pub fn gc(&mut self, now: Instant) {
        let horizon = self.window.max(self.min_interval);
        self.entries.retain(|_, starts| {
            starts.retain(|t| now.saturating_duration_since(*t) < horizon);
            !starts.is_empty()
        });
    }

    /// Number of requesters with recorded starts.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
