//! Per-client fixed-window request limiting.

use crate::core::clock::{Clock, SystemClock};
use crate::core::config::{MAX_DURATION_SECS, RateLimitConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Grace period an entry outlives its window before the sweep drops it.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(60);

/// Longest window or grace period the store accepts; longer values are clamped.
pub const MAX_WINDOW: Duration = Duration::from_secs(MAX_DURATION_SECS);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_start: Instant,
    pub reset_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Rejected { reset_at: Instant },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }

    /// Time left until the window resets, as seen from `now`. Zero when allowed.
    pub fn retry_after(&self, now: Instant) -> Duration {
        match self {
            RateLimitDecision::Allowed => Duration::ZERO,
            RateLimitDecision::Rejected { reset_at } => reset_at.saturating_duration_since(now),
        }
    }
}

/// Table of client key to request-count window.
///
/// A single mutex serializes every check and sweep, so concurrent requests
/// from the same key never lose increments. The lock is never held across
/// an await point.
#[derive(Debug)]
pub struct RateLimitStore {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
    window: Duration,
    max_requests: u32,
    grace: Duration,
    clock: Arc<dyn Clock>,
}

impl RateLimitStore {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self::with_clock(window, max_requests, Arc::new(SystemClock))
    }

    pub fn with_clock(window: Duration, max_requests: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            window: window.min(MAX_WINDOW),
            max_requests,
            grace: DEFAULT_GRACE,
            clock,
        }
    }

    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_clock(config.window(), config.max_requests, clock).with_grace(config.grace())
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace.min(MAX_WINDOW);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// End of a window opened at `now`. Saturates instead of overflowing.
    fn window_end(&self, now: Instant) -> Instant {
        now.checked_add(self.window).unwrap_or(now)
    }

    pub fn check_and_increment(&self, key: &str) -> RateLimitDecision {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.get_mut(key) {
            Some(entry) if now < entry.reset_at => {
                if entry.count < self.max_requests {
                    entry.count += 1;
                    RateLimitDecision::Allowed
                } else {
                    debug!(key, count = entry.count, "Rate limit exceeded");
                    RateLimitDecision::Rejected {
                        reset_at: entry.reset_at,
                    }
                }
            }
            _ => {
                if self.max_requests == 0 {
                    return RateLimitDecision::Rejected {
                        reset_at: self.window_end(now),
                    };
                }
                entries.insert(
                    key.to_string(),
                    RateLimitEntry {
                        count: 1,
                        window_start: now,
                        reset_at: self.window_end(now),
                    },
                );
                RateLimitDecision::Allowed
            }
        }
    }

    /// Drops entries whose window ended more than the grace period before
    /// `now`. Returns how many were removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| {
            entry
                .reset_at
                .checked_add(self.grace)
                .is_none_or(|stale_after| now <= stale_after)
        });
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept stale rate limit entries");
        }
        removed
    }

    pub fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
