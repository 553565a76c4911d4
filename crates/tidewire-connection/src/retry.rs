//! Connection attempt history, retry delays and fallback host selection.

use std::time::Duration;

use rand::Rng as _;
use rand::seq::SliceRandom as _;
use tidewire_protocol::ErrorInfo;
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Attempt history
// ---------------------------------------------------------------------------

/// One failed connection attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    /// When the attempt failed.
    pub at: Instant,
    /// The host it was made against.
    pub host: String,
    /// Why it failed.
    pub error: ErrorInfo,
}

/// The current run of connection attempts, from the first attempt after
/// the connection was last established.
#[derive(Debug, Clone, Default)]
pub struct ConnectionAttempts {
    first_attempt: Option<Instant>,
    failures: Vec<FailureRecord>,
}

impl ConnectionAttempts {
    /// Marks the start of a run, if one is not already in progress.
    pub fn start(&mut self, now: Instant) {
        self.first_attempt.get_or_insert(now);
    }

    /// Records a failed attempt.
    pub fn record(&mut self, at: Instant, host: impl Into<String>, error: ErrorInfo) {
        self.failures.push(FailureRecord {
            at,
            host: host.into(),
            error,
        });
    }

    /// Whether the run has lasted long enough that the server no longer
    /// holds the connection's state.
    pub fn should_suspend(&self, now: Instant, state_ttl: Duration) -> bool {
        self.first_attempt
            .is_some_and(|first| now.saturating_duration_since(first) >= state_ttl)
    }

    /// When the run started.
    pub fn first_attempt(&self) -> Option<Instant> {
        self.first_attempt
    }

    /// Failures recorded in this run, oldest first.
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }

    /// Number of failures in this run.
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Ends the run.
    pub fn clear(&mut self) {
        self.first_attempt = None;
        self.failures.clear();
    }
}

// ---------------------------------------------------------------------------
// Retry delay
// ---------------------------------------------------------------------------

/// Grows the retry delay linearly over the first attempts, capped at twice
/// the base delay.
///
/// ```text
/// attempt:      1     2     3     4     5+
/// coefficient:  1.0   1.33  1.67  2.0   2.0
/// ```
pub fn backoff_coefficient(attempt: u32) -> f64 {
    ((f64::from(attempt.max(1)) + 2.0) / 3.0).min(2.0)
}

/// A random factor in `[0.8, 1.0]` so clients don't retry in lockstep.
pub fn jitter_coefficient() -> f64 {
    rand::rng().random_range(0.8..=1.0)
}

/// The delay before retry number `attempt` (1-based), starting from `base`.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.mul_f64(backoff_coefficient(attempt) * jitter_coefficient())
}

/// Whether a failure may be retried against a fallback host: no status
/// (the network failed) or a server-side 5xx.
pub fn is_fallback_eligible(error: &ErrorInfo) -> bool {
    error.status_code.is_none_or(|status| status >= 500)
}

// ---------------------------------------------------------------------------
// Host selection
// ---------------------------------------------------------------------------

/// Chooses which host the next attempt goes to.
///
/// Every attempt starts at the primary host. After a failure that qualifies
/// for fallback, the fallback hosts are tried one by one in an order shuffled
/// once per run.
#[derive(Debug, Clone)]
pub struct HostSelector {
    primary: String,
    fallbacks: Vec<String>,
    order: Vec<String>,
    remaining: Vec<String>,
    current: String,
}

impl HostSelector {
    /// Creates a selector. An empty `fallbacks` disables fallback.
    pub fn new(primary: impl Into<String>, fallbacks: Vec<String>) -> Self {
        let primary = primary.into();
        let mut selector = Self {
            current: primary.clone(),
            primary,
            fallbacks,
            order: Vec::new(),
            remaining: Vec::new(),
        };
        selector.reset();
        selector
    }

    /// Starts a run: a freshly shuffled fallback order, then
    /// [`rewind`](Self::rewind).
    pub fn reset(&mut self) {
        self.order = self.fallbacks.clone();
        self.order.shuffle(&mut rand::rng());
        self.rewind();
    }

    /// Back to the primary host, keeping the run's fallback order.
    pub fn rewind(&mut self) {
        self.remaining = self.order.iter().rev().cloned().collect();
        self.current = self.primary.clone();
    }

    /// Moves to the next untried fallback host.
    pub fn next_fallback(&mut self) -> Option<&str> {
        let host = self.remaining.pop()?;
        self.current = host;
        Some(&self.current)
    }

    /// Whether any fallback hosts are configured.
    pub fn fallback_enabled(&self) -> bool {
        !self.fallbacks.is_empty()
    }

    /// Whether an untried fallback host remains in this run.
    pub fn has_remaining(&self) -> bool {
        !self.remaining.is_empty()
    }

    /// The host the next (or current) attempt goes to.
    pub fn current(&self) -> &str {
        &self.current
    }

    /// The primary host.
    pub fn primary(&self) -> &str {
        &self.primary
    }
}
