//! Rate limit counter primitives.
//!
//! Three interchangeable algorithms track consumption against a limit over a
//! time horizon. All arithmetic is in unix seconds supplied by the caller, so
//! counter behavior is deterministic under test and `reset_at` maps directly
//! onto HTTP headers. Sliding and fixed windows take the effective limit per
//! call: adaptive and priority adjustments change the limit between checks
//! without recreating the counter.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Rate limiting algorithm selector, fixed per rule at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
        };
        write!(f, "{}", s)
    }
}

/// How a counter should be shaped and limited when consulted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CounterSpec {
    pub algorithm: Algorithm,
    /// Maximum requests per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Token bucket capacity override (burst allowance)
    pub burst: Option<u64>,
}

impl CounterSpec {
    /// A per-minute limit using the given algorithm, the common case.
    pub fn per_minute(algorithm: Algorithm, limit: u64) -> Self {
        Self {
            algorithm,
            limit,
            window_secs: 60,
            burst: None,
        }
    }
}

/// Outcome of a single counter consultation.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub allowed: bool,
    /// Requests remaining after this check
    pub remaining: u64,
    /// Unix timestamp (seconds) at which quota next becomes available
    pub reset_at: u64,
    /// Suggested wait before retrying, set only on denial
    pub retry_after: Option<Duration>,
}

/// A token bucket with lazy refill.
///
/// Invariant: `0 <= tokens <= capacity` at every observable point.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    tokens: f64,
    last_refill: f64,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64, now: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: f64) {
        let elapsed = (now - self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Refill from elapsed time, then take `n` tokens if available.
    pub fn consume(&mut self, now: f64, n: f64) -> bool {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Seconds until `n` tokens will be available.
    pub fn wait_time(&mut self, now: f64, n: f64) -> f64 {
        self.refill(now);
        if self.tokens >= n {
            0.0
        } else {
            (n - self.tokens) / self.refill_rate
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// An exact rolling window of request timestamps, oldest first.
///
/// O(limit) memory per key, acceptable because limits are bounded by
/// configuration (tens to low hundreds).
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window_secs: f64,
    timestamps: VecDeque<f64>,
}

impl SlidingWindow {
    pub fn new(window_secs: f64) -> Self {
        Self {
            window_secs,
            timestamps: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: f64) {
        let cutoff = now - self.window_secs;
        // Timestamps are chronologically ordered, so eviction is a prefix trim.
        while self.timestamps.front().is_some_and(|&t| t <= cutoff) {
            self.timestamps.pop_front();
        }
    }

    /// Evict expired timestamps, then record and admit if under `limit`.
    pub fn is_allowed(&mut self, now: f64, limit: u64) -> bool {
        self.evict(now);
        if (self.timestamps.len() as u64) < limit {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Seconds until the oldest recorded request leaves the window.
    pub fn wait_time(&mut self, now: f64, limit: u64) -> f64 {
        self.evict(now);
        if (self.timestamps.len() as u64) < limit {
            0.0
        } else {
            match self.timestamps.front() {
                Some(&oldest) => (oldest + self.window_secs - now).max(0.0),
                None => 0.0,
            }
        }
    }

    pub fn count(&self) -> usize {
        self.timestamps.len()
    }

    /// Timestamp of the most recent admitted request, if any.
    pub fn newest(&self) -> Option<f64> {
        self.timestamps.back().copied()
    }

    fn oldest(&self) -> Option<f64> {
        self.timestamps.front().copied()
    }
}

/// A counter over wall-clock-aligned fixed windows.
///
/// O(1) memory, but admits up to `2 x limit` requests across a window
/// boundary. That is an accepted trade-off of the algorithm, not a bug.
#[derive(Debug, Clone)]
pub struct FixedWindowCounter {
    window_secs: u64,
    window_start: u64,
    count: u64,
}

impl FixedWindowCounter {
    pub fn new(window_secs: u64, now: u64) -> Self {
        Self {
            window_secs,
            window_start: (now / window_secs) * window_secs,
            count: 0,
        }
    }

    /// Increment within the current window, rolling to a fresh window when
    /// the clock has passed `window_end`. A closed window is replaced, never
    /// mutated.
    pub fn try_increment(&mut self, now: u64, limit: u64) -> bool {
        let window_start = (now / self.window_secs) * self.window_secs;
        if window_start != self.window_start {
            self.window_start = window_start;
            self.count = 0;
        }
        if self.count < limit {
            self.count += 1;
            true
        } else {
            false
        }
    }

    pub fn window_end(&self) -> u64 {
        self.window_start + self.window_secs
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// A keyed counter: one of the three algorithm variants plus the bookkeeping
/// the janitor needs for idle eviction.
#[derive(Debug, Clone)]
pub enum Counter {
    TokenBucket { bucket: TokenBucket, last_seen: f64 },
    SlidingWindow { window: SlidingWindow, last_seen: f64 },
    FixedWindow { counter: FixedWindowCounter, last_seen: f64 },
}

impl Counter {
    /// Create a counter shaped by `spec`. Token buckets start full with
    /// capacity `burst` (or `limit` when no burst is configured) and refill
    /// at `limit / window` tokens per second.
    pub fn new(spec: &CounterSpec, now: f64) -> Self {
        match spec.algorithm {
            Algorithm::TokenBucket => {
                let capacity = spec.burst.unwrap_or(spec.limit) as f64;
                let refill_rate = spec.limit as f64 / spec.window_secs as f64;
                Counter::TokenBucket {
                    bucket: TokenBucket::new(capacity, refill_rate, now),
                    last_seen: now,
                }
            }
            Algorithm::SlidingWindow => Counter::SlidingWindow {
                window: SlidingWindow::new(spec.window_secs as f64),
                last_seen: now,
            },
            Algorithm::FixedWindow => Counter::FixedWindow {
                counter: FixedWindowCounter::new(spec.window_secs, now as u64),
                last_seen: now,
            },
        }
    }

    /// Consult and mutate the counter for one request against the effective
    /// limit in `spec`.
    pub fn check(&mut self, now: f64, spec: &CounterSpec) -> CheckOutcome {
        match self {
            Counter::TokenBucket { bucket, last_seen } => {
                *last_seen = now;
                let allowed = bucket.consume(now, 1.0);
                let remaining = bucket.tokens().floor() as u64;
                let wait = bucket.wait_time(now, 1.0);
                CheckOutcome {
                    allowed,
                    remaining,
                    reset_at: (now + wait).ceil() as u64,
                    retry_after: (!allowed).then(|| Duration::from_secs_f64(wait)),
                }
            }
            Counter::SlidingWindow { window, last_seen } => {
                *last_seen = now;
                let allowed = window.is_allowed(now, spec.limit);
                let remaining = spec.limit.saturating_sub(window.count() as u64);
                let reset_at = match window.oldest() {
                    Some(oldest) => (oldest + window.window_secs).ceil() as u64,
                    None => now.ceil() as u64,
                };
                let wait = window.wait_time(now, spec.limit);
                CheckOutcome {
                    allowed,
                    remaining,
                    reset_at,
                    retry_after: (!allowed).then(|| Duration::from_secs_f64(wait)),
                }
            }
            Counter::FixedWindow { counter, last_seen } => {
                *last_seen = now;
                let allowed = counter.try_increment(now as u64, spec.limit);
                let remaining = spec.limit.saturating_sub(counter.count());
                let reset_at = counter.window_end();
                let wait = reset_at.saturating_sub(now as u64);
                CheckOutcome {
                    allowed,
                    remaining,
                    reset_at,
                    retry_after: (!allowed).then(|| Duration::from_secs(wait.max(1))),
                }
            }
        }
    }

    /// Whether the janitor should evict this counter.
    pub fn is_stale(&self, now: f64, idle_threshold_secs: u64, evict_token_buckets: bool) -> bool {
        let idle = idle_threshold_secs as f64;
        match self {
            Counter::TokenBucket { last_seen, .. } => {
                evict_token_buckets && now - last_seen > idle
            }
            Counter::SlidingWindow { window, last_seen } => {
                let newest = window.newest().unwrap_or(*last_seen);
                now - newest > idle
            }
            Counter::FixedWindow { counter, .. } => {
                now - counter.window_end() as f64 > idle
            }
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Counter::TokenBucket { .. } => Algorithm::TokenBucket,
            Counter::SlidingWindow { .. } => Algorithm::SlidingWindow,
            Counter::FixedWindow { .. } => Algorithm::FixedWindow,
        }
    }
}
