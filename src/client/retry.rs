//! Backoff schedules and failure-streak bookkeeping.
//!
//! A [`Backoff`] maps an escalation index to a delay, clamping at the last
//! entry. [`RetryState`] is the mutable half shared by every request a
//! handler dispatches: consecutive failures walk the index up, any success
//! resets it, and a streak that outlives the refresh window trips the
//! circuit breaker once.

use std::time::Duration;
use tokio::time::Instant;

/// Delay schedule indexed by consecutive failure count.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    delays: Vec<Duration>,
    escalate: bool,
}

impl Backoff {
    /// Schedule from explicit delays. With `escalate` off only the first is used.
    pub fn new(delays: Vec<Duration>, escalate: bool) -> Self {
        Self { delays, escalate }
    }

    /// Schedule from seconds; negative and non-finite entries become zero.
    pub fn from_secs(delays: &[f64], escalate: bool) -> Self {
        let delays = delays.iter().copied().map(secs).collect();
        Self::new(delays, escalate)
    }

    /// Delay for the failure at `index` (0-based).
    pub fn delay_for(&self, index: usize) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let index = if self.escalate {
            index.min(self.delays.len() - 1)
        } else {
            0
        };
        self.delays[index]
    }

    /// Number of distinct steps
    pub fn len(&self) -> usize {
        self.delays.len()
    }

    /// True when there are no delays configured
    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }
}

/// What the caller should do after recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// How long to wait before the next attempt
    pub delay: Duration,
    /// Index of the delay used
    pub index: usize,
    /// True exactly once per streak, when it outlives the refresh window
    pub refresh: bool,
    /// How long the current streak has lasted
    pub streak: Duration,
}

/// Mutable retry bookkeeping.
#[derive(Debug, Default)]
pub struct RetryState {
    index: usize,
    streak_started: Option<Instant>,
    refresh_signalled: bool,
}

impl RetryState {
    /// Fresh state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure at `now` and pick the next delay.
    pub fn record_failure(
        &mut self,
        backoff: &Backoff,
        refresh_after: Option<Duration>,
        now: Instant,
    ) -> RetryDecision {
        let started = *self.streak_started.get_or_insert(now);
        let streak = now.saturating_duration_since(started);

        let index = self.index;
        let delay = backoff.delay_for(index);
        self.index = self.index.saturating_add(1);

        let refresh = match refresh_after {
            Some(window) if !self.refresh_signalled && streak >= window => {
                self.refresh_signalled = true;
                true
            }
            _ => false,
        };

        RetryDecision {
            delay,
            index,
            refresh,
            streak,
        }
    }

    /// Record a success: the next failure starts a new streak at index 0.
    pub fn record_success(&mut self) {
        *self = Self::default();
    }

    /// Current escalation index
    pub fn index(&self) -> usize {
        self.index
    }

    /// When the current failure streak started
    pub fn streak_started(&self) -> Option<Instant> {
        self.streak_started
    }
}

/// Longest delay any configured interval can produce (one year).
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Seconds to a duration. Junk becomes zero; oversized values cap at [`MAX_DELAY`].
pub(crate) fn secs(value: f64) -> Duration {
    if !value.is_finite() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value)
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY)
}

/// `from + delay`, saturating instead of overflowing the clock.
pub(crate) fn deadline(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(MAX_DELAY))
        .unwrap_or(from)
}
