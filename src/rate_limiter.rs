//! Sliding-window rate limiting for session traffic.
//!
//! This module provides the [`RateLimiter`] struct which admits at most
//! `rate_limit` operations within any trailing window of length `period`.
//!
//! # Overview
//!
//! Each session owns exactly one limiter, so requests to different slots
//! never wait for each other. Requests sharing a slot share the limiter and
//! are admitted in whatever order wins the window check; any order that
//! respects the window is acceptable.
//!
//! The constraint is time-based rather than concurrency-based: an
//! [`Admission`] marks that the caller was let through and releases nothing
//! when dropped.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use requestr::RateLimiter;
//!
//! # async fn example() {
//! // Two operations per second
//! let limiter = RateLimiter::new(2, Duration::from_secs(1));
//!
//! // First two proceed immediately
//! let _first = limiter.acquire().await;
//! let _second = limiter.acquire().await;
//!
//! // Third waits until the first leaves the window
//! let third = limiter.acquire().await;
//! assert!(third.waited() >= Duration::from_secs(1));
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, DEFAULT_POLL_INTERVAL};

/// Sliding-window rate limiter.
///
/// Tracks the admission timestamps that still fall inside the trailing
/// `period`; stale entries are purged on every check. Callers that find the
/// window full re-check every `poll_interval`.
///
/// # Thread Safety
///
/// `RateLimiter` is `Send + Sync` and is shared by every concurrent send on
/// its session. Cancelling a waiting `acquire` leaves the limiter untouched.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum admissions per window.
    rate_limit: usize,

    /// Window length.
    period: Duration,

    /// Delay between re-checks while the window is full.
    poll_interval: Duration,

    /// Whether rate limiting is disabled (rate limit of 0).
    disabled: bool,

    /// Admission timestamps inside the current window, oldest first.
    events: Mutex<VecDeque<Instant>>,

    /// Total time callers spent waiting (in milliseconds).
    cumulative_delay_ms: AtomicU64,

    /// Set once the cumulative delay warning has been emitted.
    warned: AtomicBool,
}

/// Proof of admission returned by [`RateLimiter::acquire`].
///
/// Dropping it is a no-op; there is nothing to release.
#[must_use = "hold the admission for the duration of the rate-limited operation"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    waited: Duration,
}

impl Admission {
    /// Returns how long the caller waited for admission.
    #[must_use]
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl RateLimiter {
    /// Creates a limiter admitting `rate_limit` operations per `period`.
    ///
    /// A `rate_limit` of zero creates a disabled limiter.
    #[must_use]
    #[instrument(skip_all, fields(rate_limit = rate_limit, period_ms = period.as_millis()))]
    pub fn new(rate_limit: usize, period: Duration) -> Self {
        if rate_limit == 0 {
            return Self::disabled();
        }
        debug!(rate_limit, "creating rate limiter");
        Self {
            rate_limit,
            period,
            poll_interval: DEFAULT_POLL_INTERVAL,
            disabled: false,
            events: Mutex::new(VecDeque::with_capacity(rate_limit)),
            cumulative_delay_ms: AtomicU64::new(0),
            warned: AtomicBool::new(false),
        }
    }

    /// Creates a disabled rate limiter that admits everything immediately.
    #[must_use]
    pub fn disabled() -> Self {
        debug!("creating disabled rate limiter");
        Self {
            rate_limit: 0,
            period: Duration::ZERO,
            poll_interval: DEFAULT_POLL_INTERVAL,
            disabled: true,
            events: Mutex::new(VecDeque::new()),
            cumulative_delay_ms: AtomicU64::new(0),
            warned: AtomicBool::new(false),
        }
    }

    /// Sets the interval between re-checks while the window is full.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the maximum admissions per window.
    #[must_use]
    pub fn rate_limit(&self) -> usize {
        self.rate_limit
    }

    /// Returns the window length.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Returns the re-check interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns the total time callers have spent waiting on this limiter.
    #[must_use]
    pub fn cumulative_delay(&self) -> Duration {
        Duration::from_millis(self.cumulative_delay_ms.load(Ordering::SeqCst))
    }

    /// Waits until the window has room, then records a new admission.
    ///
    /// The window check and the insertion happen under one lock, so no two
    /// callers can both take the last free place.
    #[instrument(skip(self), fields(rate_limit = self.rate_limit))]
    pub async fn acquire(&self) -> Admission {
        if self.disabled {
            return Admission {
                waited: Duration::ZERO,
            };
        }

        let started = Instant::now();
        loop {
            {
                let mut events = self.events.lock().await;
                let now = Instant::now();
                purge_stale(&mut events, now, self.period);
                if events.len() < self.rate_limit {
                    events.push_back(now);
                    break;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let waited = started.elapsed();
        if !waited.is_zero() {
            self.record_delay(waited);
        }
        Admission { waited }
    }

    /// Adds to the cumulative delay and warns once it becomes excessive.
    #[allow(clippy::cast_possible_truncation)]
    fn record_delay(&self, delay: Duration) {
        let delay_ms = delay.as_millis() as u64;
        let total_ms = self.cumulative_delay_ms.fetch_add(delay_ms, Ordering::SeqCst) + delay_ms;
        let cumulative = Duration::from_millis(total_ms);

        debug!(
            delay_ms,
            cumulative_ms = total_ms,
            "applied rate limit delay"
        );

        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD && !self.warned.swap(true, Ordering::SeqCst)
        {
            warn!(
                cumulative_delay_secs = cumulative.as_secs(),
                rate_limit = self.rate_limit,
                "excessive rate limiting - consider raising the limit or reducing request volume"
            );
        }
    }
}

/// Drops admissions older than `period` from the front of the window.
fn purge_stale(events: &mut VecDeque<Instant>, now: Instant, period: Duration) {
    while let Some(&oldest) = events.front() {
        if now.duration_since(oldest) > period {
            events.pop_front();
        } else {
            break;
        }
    }
}
