//! Retry with backoff on status codes or transport failures.
//!
//! # Overview
//!
//! Both retry middlewares share one bookkeeping scheme kept in the request's
//! [`Meta`](crate::Meta):
//!
//! - The request hook seeds `retries = 0` and `max_retries = times` unless the
//!   request already carries them, so a request can bring its own ceiling.
//! - When a trigger matches and `retries < max_retries`, the middleware sleeps
//!   for the backoff delay, bumps `retries` and hands the request back for
//!   re-dispatch.
//! - Once `retries` reaches `max_retries` the dispatch fails with
//!   [`DispatchError::RequestFailed`].
//!
//! The wait before retry `k` (1-based) is schedule entry `k - 1`; past the
//! end of the schedule the last entry is reused.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use requestr::{Backoff, RetryStatuses};
//!
//! let transient = RetryStatuses::new([502, 503]).with_times(3);
//! let not_found = RetryStatuses::new([404]).with_backoff(Backoff::Fixed(Duration::ZERO));
//!
//! // Union of triggers; times and backoff come from the left operand
//! let combined = transient + not_found;
//! assert_eq!(combined.statuses(), &[502, 503, 404]);
//! assert_eq!(combined.times(), 3);
//! ```

use std::ops::Add;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Action, HookContext, Middleware};
use crate::error::DispatchError;
use crate::request::Request;
use crate::response::Response;
use crate::stats::{REQ_RETRY, SLEEP_ELAPSED};
use crate::transport::{TransportError, TransportErrorKind};

/// Default number of retries per logical request.
pub const DEFAULT_RETRY_TIMES: u32 = 2;

/// Default backoff schedule in seconds.
const DEFAULT_SCHEDULE_SECS: [u64; 9] = [0, 1, 3, 6, 10, 16, 32, 64, 128];

/// Statuses retried by default.
const DEFAULT_STATUSES: [u16; 1] = [500];

/// Transport failures retried by default.
const DEFAULT_KINDS: [TransportErrorKind; 2] =
    [TransportErrorKind::Connection, TransportErrorKind::Response];

/// How long to wait before each retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed(Duration),
    /// Delay indexed by retries already issued, clamped to the last entry.
    Schedule(Vec<Duration>),
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Schedule(
            DEFAULT_SCHEDULE_SECS
                .iter()
                .map(|&secs| Duration::from_secs(secs))
                .collect(),
        )
    }
}

impl Backoff {
    /// Returns the delay before the retry following `retries` earlier ones.
    ///
    /// An empty schedule never waits.
    #[must_use]
    pub fn delay(&self, retries: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Schedule(schedule) => {
                let index = usize::try_from(retries).unwrap_or(usize::MAX);
                schedule
                    .get(index)
                    .or_else(|| schedule.last())
                    .copied()
                    .unwrap_or_default()
            }
        }
    }
}

/// Bookkeeping shared by the retry middlewares.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RetryState {
    times: u32,
    backoff: Backoff,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            times: DEFAULT_RETRY_TIMES,
            backoff: Backoff::default(),
        }
    }
}

impl RetryState {
    fn seed(&self, request: &mut Request) {
        let meta = request.meta_mut();
        meta.max_retries.get_or_insert(self.times);
        meta.retries.get_or_insert(0);
    }

    async fn retry(
        &self,
        mut request: Request,
        ctx: HookContext<'_>,
        middleware: &str,
    ) -> Result<Action, DispatchError> {
        let retries = request.meta().retries.unwrap_or(0);
        let max_retries = request.meta().max_retries.unwrap_or(self.times);
        if retries >= max_retries {
            info!(url = %request.url(), retries, middleware, "giving up on request");
            return Err(DispatchError::request_failed(
                request,
                format!("retries exceeded after {retries} retries"),
            ));
        }

        let delay = self.backoff.delay(retries);
        let meta = request.meta_mut();
        meta.retries = Some(retries + 1);
        meta.max_retries = Some(max_retries);
        ctx.stats.incr(REQ_RETRY);
        ctx.stats.add(SLEEP_ELAPSED, delay.as_secs_f64());

        debug!(
            url = %request.url(),
            attempt = retries + 1,
            max_retries,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            middleware,
            "retrying request"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(Action::Request(request))
    }
}

/// Appends the items of `right` missing from `left`, keeping order.
fn union<T: PartialEq + Copy>(left: &[T], right: &[T]) -> Vec<T> {
    let mut merged = left.to_vec();
    for item in right {
        if !merged.contains(item) {
            merged.push(*item);
        }
    }
    merged
}

/// Retries responses whose status is in a configured set (default {500}).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryStatuses {
    statuses: Vec<u16>,
    state: RetryState,
}

impl Default for RetryStatuses {
    fn default() -> Self {
        Self::new([])
    }
}

impl RetryStatuses {
    /// Creates a middleware retrying on `statuses`; empty means the default set.
    pub fn new(statuses: impl IntoIterator<Item = u16>) -> Self {
        let statuses = union(&[], &statuses.into_iter().collect::<Vec<_>>());
        Self {
            statuses: if statuses.is_empty() {
                DEFAULT_STATUSES.to_vec()
            } else {
                statuses
            },
            state: RetryState::default(),
        }
    }

    /// Sets the retry ceiling.
    #[must_use]
    pub fn with_times(mut self, times: u32) -> Self {
        self.state.times = times;
        self
    }

    /// Sets the backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.state.backoff = backoff;
        self
    }

    /// Returns the triggering statuses.
    #[must_use]
    pub fn statuses(&self) -> &[u16] {
        &self.statuses
    }

    /// Returns the retry ceiling.
    #[must_use]
    pub fn times(&self) -> u32 {
        self.state.times
    }

    /// Returns the backoff.
    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.state.backoff
    }
}

impl Add for RetryStatuses {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            statuses: union(&self.statuses, &other.statuses),
            state: self.state,
        }
    }
}

#[async_trait]
impl Middleware for RetryStatuses {
    fn name(&self) -> &str {
        "retry_statuses"
    }

    async fn process_request(
        &self,
        request: &mut Request,
        _ctx: HookContext<'_>,
    ) -> Result<Action, DispatchError> {
        self.state.seed(request);
        Ok(Action::Continue)
    }

    async fn process_response(
        &self,
        response: &mut Response,
        ctx: HookContext<'_>,
    ) -> Result<Action, DispatchError> {
        if !self.statuses.contains(&response.status()) {
            return Ok(Action::Continue);
        }
        debug!(status = response.status(), url = %response.url(), "retryable status");
        self.state
            .retry(response.request().clone(), ctx, self.name())
            .await
    }
}

/// Retries transport failures of configured kinds (default connection and response errors).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExceptions {
    kinds: Vec<TransportErrorKind>,
    state: RetryState,
}

impl Default for RetryExceptions {
    fn default() -> Self {
        Self::new([])
    }
}

impl RetryExceptions {
    /// Creates a middleware retrying on `kinds`; empty means the default set.
    pub fn new(kinds: impl IntoIterator<Item = TransportErrorKind>) -> Self {
        let kinds = union(&[], &kinds.into_iter().collect::<Vec<_>>());
        Self {
            kinds: if kinds.is_empty() {
                DEFAULT_KINDS.to_vec()
            } else {
                kinds
            },
            state: RetryState::default(),
        }
    }

    /// Sets the retry ceiling.
    #[must_use]
    pub fn with_times(mut self, times: u32) -> Self {
        self.state.times = times;
        self
    }

    /// Sets the backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.state.backoff = backoff;
        self
    }

    /// Returns the triggering failure kinds.
    #[must_use]
    pub fn kinds(&self) -> &[TransportErrorKind] {
        &self.kinds
    }

    /// Returns the retry ceiling.
    #[must_use]
    pub fn times(&self) -> u32 {
        self.state.times
    }

    /// Returns the backoff.
    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.state.backoff
    }
}

impl Add for RetryExceptions {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            kinds: union(&self.kinds, &other.kinds),
            state: self.state,
        }
    }
}

#[async_trait]
impl Middleware for RetryExceptions {
    fn name(&self) -> &str {
        "retry_exceptions"
    }

    async fn process_request(
        &self,
        request: &mut Request,
        _ctx: HookContext<'_>,
    ) -> Result<Action, DispatchError> {
        self.state.seed(request);
        Ok(Action::Continue)
    }

    async fn process_exception(
        &self,
        error: &TransportError,
        request: &mut Request,
        ctx: HookContext<'_>,
    ) -> Result<Action, DispatchError> {
        if !self.kinds.contains(&error.kind()) {
            return Ok(Action::Continue);
        }
        debug!(kind = %error.kind(), url = %request.url(), "retryable transport error");
        self.state.retry(request.clone(), ctx, self.name()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::{Session, SessionConfig};
    use crate::stats::Stats;
    use crate::transport::testing::MockTransport;

    fn session() -> Session {
        Session::new(
            "example.com",
            SessionConfig::default(),
            Arc::new(MockTransport::status(200)),
        )
    }

    fn seeded(middleware: &impl Fn(&mut Request)) -> Request {
        let mut request = Request::new("https://example.com/").unwrap();
        middleware(&mut request);
        request
    }

    // ==================== Backoff Tests ====================

    #[test]
    fn test_default_schedule() {
        let backoff = Backoff::default();
        let delays: Vec<u64> = (0..9).map(|i| backoff.delay(i).as_secs()).collect();
        assert_eq!(delays, vec![0, 1, 3, 6, 10, 16, 32, 64, 128]);
    }

    #[test]
    fn test_schedule_clamps_to_last_entry() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(9), Duration::from_secs(128));
        assert_eq!(backoff.delay(1000), Duration::from_secs(128));
    }

    #[test]
    fn test_fixed_and_empty_schedules() {
        assert_eq!(
            Backoff::Fixed(Duration::from_millis(250)).delay(5),
            Duration::from_millis(250)
        );
        assert_eq!(Backoff::Schedule(Vec::new()).delay(0), Duration::ZERO);
    }

    // ==================== Composition Tests ====================

    #[test]
    fn test_defaults() {
        assert_eq!(RetryStatuses::default().statuses(), &[500]);
        assert_eq!(RetryStatuses::default().times(), 2);
        assert_eq!(
            RetryExceptions::default().kinds(),
            &[TransportErrorKind::Connection, TransportErrorKind::Response]
        );
    }

    #[test]
    fn test_add_statuses_unions_and_keeps_left_settings() {
        let left = RetryStatuses::new([404]).with_times(3);
        let right = RetryStatuses::new([500, 502]).with_backoff(Backoff::Fixed(Duration::ZERO));

        let combined = left + right;

        assert_eq!(combined.statuses(), &[404, 500, 502]);
        assert_eq!(combined.times(), 3);
        assert_eq!(combined.backoff(), &Backoff::default());
    }

    #[test]
    fn test_add_deduplicates_shared_triggers() {
        let combined = RetryStatuses::new([500, 503]) + RetryStatuses::new([503, 504]);
        assert_eq!(combined.statuses(), &[500, 503, 504]);
    }

    #[test]
    fn test_add_exceptions_unions_kinds() {
        let left = RetryExceptions::new([TransportErrorKind::Connection]).with_times(5);
        let right = RetryExceptions::new([TransportErrorKind::Other]);

        let combined = left + right;

        assert_eq!(
            combined.kinds(),
            &[TransportErrorKind::Connection, TransportErrorKind::Other]
        );
        assert_eq!(combined.times(), 5);
    }

    // ==================== Hook Tests ====================

    #[test]
    fn test_seed_respects_existing_meta() {
        let state = RetryState::default();
        let fresh = seeded(&|r: &mut Request| state.seed(r));
        assert_eq!(fresh.meta().retries, Some(0));
        assert_eq!(fresh.meta().max_retries, Some(2));

        let mut own = Request::new("https://example.com/").unwrap();
        own.meta_mut().max_retries = Some(7);
        state.seed(&mut own);
        assert_eq!(own.meta().max_retries, Some(7));
    }

    #[tokio::test]
    async fn test_status_retry_bumps_counter_and_stats() {
        tokio::time::pause();

        let middleware = RetryStatuses::default();
        let session = session();
        let stats = Stats::new();
        let ctx = HookContext {
            session: &session,
            stats: &stats,
        };
        let mut request = Request::new("https://example.com/").unwrap();
        middleware.process_request(&mut request, ctx).await.unwrap();
        let mut response = Response::new(request, 500);

        let action = middleware.process_response(&mut response, ctx).await.unwrap();

        let retried = match action {
            Action::Request(retried) => retried,
            other => panic!("expected a retry, got {}", other.describe()),
        };
        assert_eq!(retried.meta().retries, Some(1));
        assert_eq!(stats.count(REQ_RETRY), 1);
        assert!(stats.get(SLEEP_ELAPSED).abs() < f64::EPSILON, "first retry waits 0s");
    }

    #[tokio::test]
    async fn test_status_not_in_set_continues() {
        let middleware = RetryStatuses::default();
        let session = session();
        let stats = Stats::new();
        let ctx = HookContext {
            session: &session,
            stats: &stats,
        };
        let mut response = Response::new(Request::new("https://example.com/").unwrap(), 404);

        let action = middleware.process_response(&mut response, ctx).await.unwrap();

        assert!(matches!(action, Action::Continue));
        assert_eq!(stats.count(REQ_RETRY), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_request() {
        let middleware = RetryStatuses::default();
        let session = session();
        let stats = Stats::new();
        let ctx = HookContext {
            session: &session,
            stats: &stats,
        };
        let mut request = Request::new("https://example.com/").unwrap();
        request.meta_mut().retries = Some(2);
        request.meta_mut().max_retries = Some(2);
        let mut response = Response::new(request, 500);

        let error = middleware
            .process_response(&mut response, ctx)
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            DispatchError::RequestFailed { ref reason, .. } if reason == "retries exceeded after 2 retries"
        ));
    }

    #[tokio::test]
    async fn test_exception_retry_sleeps_schedule_entry() {
        tokio::time::pause();

        let middleware = RetryExceptions::default();
        let session = session();
        let stats = Stats::new();
        let ctx = HookContext {
            session: &session,
            stats: &stats,
        };
        let mut request = Request::new("https://example.com/").unwrap();
        request.meta_mut().retries = Some(1);
        request.meta_mut().max_retries = Some(2);
        let error = TransportError::connection("https://example.com/", "refused");

        let start = tokio::time::Instant::now();
        let action = middleware
            .process_exception(&error, &mut request, ctx)
            .await
            .unwrap();

        assert!(matches!(action, Action::Request(ref r) if r.meta().retries == Some(2)));
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!((stats.get(SLEEP_ELAPSED) - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_exception_kind_not_in_set_continues() {
        let middleware = RetryExceptions::default();
        let session = session();
        let stats = Stats::new();
        let ctx = HookContext {
            session: &session,
            stats: &stats,
        };
        let mut request = Request::new("https://example.com/").unwrap();
        let error = TransportError::invalid_request("https://example.com/", "bad header");

        let action = middleware
            .process_exception(&error, &mut request, ctx)
            .await
            .unwrap();

        assert!(matches!(action, Action::Continue));
    }
}
