//! Admission control.
//!
//! [`ResourceGovernor::admit`] checks duration, concurrency and rate limits
//! and reserves a slot in one critical section, handing out a [`Permit`].
//! The permit lives inside the session and gives the slot back when it is
//! dropped, so the counters always equal the number of live permits.

pub mod rate_limit;

pub use rate_limit::StartLimiter;

use crate::error::Rejection;
use crate::session::{Identity, RecordingConfig};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Admission limits.
#[derive(Debug, Clone)]
pub struct GovernorPolicy {
    /// Global ceiling on active sessions.
    pub max_concurrent_sessions: usize,
    /// Per-requester ceiling on active sessions.
    pub max_concurrent_per_requester: usize,
    /// Upper bound on a requested duration. Longer requests are rejected, not clamped.
    pub max_duration: Duration,
    /// Applied when a request names no duration.
    pub default_duration: Duration,
    pub min_interval_between_starts: Duration,
    /// Sliding-window start cap per requester (0 disables).
    pub starts_per_window: u32,
    pub start_window: Duration,
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 4,
            max_concurrent_per_requester: 2,
            max_duration: Duration::from_secs(600),
            default_duration: Duration::from_secs(60),
            min_interval_between_starts: Duration::from_secs(1),
            starts_per_window: 10,
            start_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Ledger {
    active_total: usize,
    per_requester: HashMap<Identity, usize>,
    limiter: StartLimiter,
}

impl Ledger {
    fn release(&mut self, requester: &Identity) {
        self.active_total = self.active_total.saturating_sub(1);
        if let Some(count) = self.per_requester.get_mut(requester) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_requester.remove(requester);
            }
        }
    }
}

/// Enforces concurrency, duration and rate limits.
pub struct ResourceGovernor {
    policy: GovernorPolicy,
    ledger: Arc<Mutex<Ledger>>,
}

impl ResourceGovernor {
    /// Create a governor enforcing `policy`.
    ///
    /// # Arguments
    ///
    /// * `policy` - Concurrency, duration and rate limits applied by [`Self::admit`].
    pub fn new(policy: GovernorPolicy) -> Self {
        let limiter = StartLimiter::new(
            policy.min_interval_between_starts,
            policy.starts_per_window,
            policy.start_window,
        );
        Self {
            policy,
            ledger: Arc::new(Mutex::new(Ledger {
                active_total: 0,
                per_requester: HashMap::new(),
                limiter,
            })),
        }
    }

    /// The limits this governor enforces.
    pub fn policy(&self) -> &GovernorPolicy {
        &self.policy
    }

    /// Admit a session, reserving its slot.
    ///
    /// `requester_cap` tightens (never loosens) the per-requester ceiling.
    /// Rejected attempts leave no trace in the counters or the rate limiter.
    pub fn admit(
        &self,
        requester: &Identity,
        config: &RecordingConfig,
        requester_cap: Option<usize>,
    ) -> Result<Permit, Rejection> {
        let duration = match config.max_duration() {
            Some(d) if d > self.policy.max_duration => {
                return Err(Rejection::DurationExceedsPolicy {
                    requested_ms: d.as_millis() as u64,
                    max_ms: self.policy.max_duration.as_millis() as u64,
                })
            }
            Some(d) => d,
            None => self.policy.default_duration.min(self.policy.max_duration),
        };

        let per_requester_limit = requester_cap
            .map(|cap| cap.min(self.policy.max_concurrent_per_requester))
            .unwrap_or(self.policy.max_concurrent_per_requester);

        let now = Instant::now();
        let mut ledger = self.lock();

        if ledger.active_total >= self.policy.max_concurrent_sessions {
            return Err(Rejection::TooManyConcurrentSessions {
                limit: self.policy.max_concurrent_sessions,
            });
        }
        let mine = ledger.per_requester.get(requester).copied().unwrap_or(0);
        if mine >= per_requester_limit {
            return Err(Rejection::TooManyForRequester {
                limit: per_requester_limit,
            });
        }
        if let Err(wait) = ledger.limiter.check(requester, now) {
            return Err(Rejection::RateLimited {
                retry_after_ms: wait.as_millis().max(1) as u64,
            });
        }

        ledger.active_total += 1;
        *ledger.per_requester.entry(requester.clone()).or_insert(0) += 1;
        ledger.limiter.record(requester, now);
        debug!(requester = %requester, active = ledger.active_total, "slot reserved");

        Ok(Permit {
            ledger: Arc::clone(&self.ledger),
            requester: requester.clone(),
            duration,
        })
    }

    /// Number of reserved slots.
    pub fn in_flight(&self) -> usize {
        self.lock().active_total
    }

    /// Slots currently held by `requester`.
    ///
    /// # Arguments
    ///
    /// * `requester` - Identity whose outstanding permits are counted.
    pub fn in_flight_for(&self, requester: &Identity) -> usize {
        self.lock().per_requester.get(requester).copied().unwrap_or(0)
    }

    /// Prune stale rate-limit state.
    pub fn gc(&self) {
        self.lock().limiter.gc(Instant::now());
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A reserved concurrency slot. Dropping it releases the slot.
pub struct Permit {
    ledger: Arc<Mutex<Ledger>>,
    requester: Identity,
    duration: Duration,
}

impl Permit {
    /// Identity the slot was reserved for.
    pub fn requester(&self) -> &Identity {
        &self.requester
    }

    /// Effective duration bound granted with this slot.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("requester", &self.requester)
            .field("duration", &self.duration)
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .release(&self.requester);
    }
}
