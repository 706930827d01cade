//! Request dispatch loop.
//!
//! # Overview
//!
//! [`Dispatcher::send`] drives one request through the pipeline:
//!
//! ```text
//! select session -> request hooks -> transport -> response hooks -> done
//!       ^                |              |               |
//!       |             rewrite      exception hooks   rewrite
//!       +----------------+--------------+---------------+
//! ```
//!
//! Every rewrite records the replaced request in a history; once the history
//! holds `rewrite_limit` entries the next pass fails with
//! [`DispatchError::TooManyRewrites`]. Sessions are resolved per pass, so a
//! middleware that changes the slot routes the rewritten request through a
//! different session.
//!
//! # Example
//!
//! ```no_run
//! use requestr::{Dispatcher, Middlewares, Request, RetryStatuses};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let middlewares = Middlewares::defaults().with(950, RetryStatuses::new([429]))?;
//! let dispatcher = Dispatcher::builder().middlewares(middlewares).build()?;
//!
//! let response = dispatcher.send(Request::new("https://example.com/")?).await?;
//! println!("{}", response.text());
//! dispatcher.close().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, DispatcherConfig, validate_session};
use crate::error::DispatchError;
use crate::middleware::{ChainOutcome, HookContext, Middlewares, Recovery};
use crate::request::Request;
use crate::response::Response;
use crate::session::{Session, SessionConfig, SessionPool};
use crate::stats::{
    CLOSE, ELAPSED, OPEN, REQ_SCHEDULED, REQ_SENT, REQMID_RETURN_REQ, REQMID_RETURN_RESP,
    RESPMID_EXC_REQ, RESPMID_EXC_RESP, RESPMID_RETURN_REQ, RESPMID_RETURN_RESP, Stats,
};
use crate::transport::{ReqwestFactory, TransportFactory};

/// Routes requests through per-slot sessions and a middleware pipeline.
///
/// Safe to share across tasks: any number of concurrent `send` calls use the
/// same session pool and statistics.
pub struct Dispatcher {
    config: DispatcherConfig,
    middlewares: Middlewares,
    factory: Arc<dyn TransportFactory>,
    sessions: SessionPool,
    stats: Arc<Stats>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("middlewares", &self.middlewares)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with the default configuration, the default
    /// middleware stack and the reqwest transport.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(
            DispatcherConfig::default(),
            Middlewares::defaults(),
            Arc::new(ReqwestFactory),
        )
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    fn from_parts(
        config: DispatcherConfig,
        middlewares: Middlewares,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let stats = Arc::new(Stats::new());
        Self {
            config,
            middlewares,
            factory,
            sessions: SessionPool::new(Arc::clone(&stats)),
            stats,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Returns the configured middleware set.
    #[must_use]
    pub fn middlewares(&self) -> &Middlewares {
        &self.middlewares
    }

    /// Returns the statistics.
    #[must_use]
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Returns the session pool.
    #[must_use]
    pub fn sessions(&self) -> &SessionPool {
        &self.sessions
    }

    /// Sends `request` through the configured middleware set.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::send_with`].
    pub async fn send(&self, request: Request) -> Result<Response, DispatchError> {
        self.send_with(request, &self.middlewares).await
    }

    /// Sends `request` through `middlewares` instead of the configured set.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::RequestFailed`] / [`DispatchError::RequestDropped`]
    ///   when a middleware ends the dispatch
    /// - [`DispatchError::TooManyRewrites`] when the rewrite ceiling is reached
    /// - [`DispatchError::UnsupportedReturn`] when a middleware breaks its hook contract
    /// - [`DispatchError::Transport`] when a transport failure goes unclaimed
    /// - [`DispatchError::SessionOpen`] when a session cannot be created
    #[instrument(skip_all, fields(method = %request.method(), url = %request.url(), slot = %request.slot()))]
    pub async fn send_with(
        &self,
        request: Request,
        middlewares: &Middlewares,
    ) -> Result<Response, DispatchError> {
        self.stats.incr(REQ_SCHEDULED);
        let limit = self.config.rewrite_limit;
        let mut history: Vec<Request> = Vec::new();
        let mut request = request;

        loop {
            if history.len() >= limit {
                warn!(limit, url = %request.url(), "middleware rewrite limit reached");
                return Err(DispatchError::TooManyRewrites { limit, history });
            }

            let session = self.session_for(request.slot()).await?;
            let ctx = HookContext {
                session: &session,
                stats: &self.stats,
            };

            match middlewares.run_request(&mut request, ctx).await? {
                ChainOutcome::Pass => {}
                ChainOutcome::Rewrite(next) => {
                    debug!(from = %request, to = %next, "request rewritten before send");
                    self.stats.incr(REQMID_RETURN_REQ);
                    history.push(mem::replace(&mut request, next));
                    continue;
                }
                ChainOutcome::ShortCircuit(response) => {
                    debug!(%request, status = response.status(), "answered before send");
                    self.stats.incr(REQMID_RETURN_RESP);
                    return Ok(response);
                }
            }

            self.stats.incr(REQ_SENT);
            let raw = match session.send(&request).await {
                Ok(raw) => raw,
                Err(error) => {
                    debug!(%request, error = %error, "transport failed");
                    match middlewares.run_exception(error, &mut request, ctx).await? {
                        Recovery::Rewrite(next) => {
                            self.stats.incr(RESPMID_EXC_REQ);
                            history.push(mem::replace(&mut request, next));
                            continue;
                        }
                        Recovery::Respond(response) => {
                            self.stats.incr(RESPMID_EXC_RESP);
                            return Ok(response);
                        }
                    }
                }
            };

            let mut response = Response::from_raw(request, raw);
            match middlewares.run_response(&mut response, ctx).await? {
                ChainOutcome::Pass => {
                    debug!(status = response.status(), url = %response.url(), "request completed");
                    return Ok(response);
                }
                ChainOutcome::Rewrite(next) => {
                    debug!(status = response.status(), to = %next, "response rewritten to request");
                    self.stats.incr(RESPMID_RETURN_REQ);
                    history.push(response.into_request());
                    request = next;
                }
                ChainOutcome::ShortCircuit(replacement) => {
                    self.stats.incr(RESPMID_RETURN_RESP);
                    return Ok(replacement);
                }
            }
        }
    }

    async fn session_for(&self, slot: &str) -> Result<Arc<Session>, DispatchError> {
        self.sessions
            .get_or_create(slot, self.factory.as_ref(), &self.config.session)
            .await
            .map_err(|e| DispatchError::session_open(slot, e))
    }

    /// Opens (or replaces) the session for `slot` with `config`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidSession`] if `config` is out of range
    /// (the existing session is kept), or [`DispatchError::SessionOpen`] if
    /// the transport cannot be built.
    pub async fn new_session(
        &self,
        slot: &str,
        config: SessionConfig,
    ) -> Result<Arc<Session>, DispatchError> {
        validate_session(&config).map_err(|source| DispatchError::InvalidSession {
            slot: slot.to_string(),
            source,
        })?;
        info!(slot, "starting session");
        self.sessions
            .reopen(slot, self.factory.as_ref(), &config)
            .await
            .map_err(|e| DispatchError::session_open(slot, e))
    }

    /// Records the open timestamp.
    pub fn open(&self) {
        self.stats.set(OPEN, unix_now());
        debug!("dispatcher opened");
    }

    /// Closes every session and records the close timestamp and elapsed time.
    ///
    /// Safe to call repeatedly; later sends reopen sessions on demand.
    pub async fn close(&self) {
        self.sessions.close().await;
        let closed = unix_now();
        self.stats.set(CLOSE, closed);
        if self.stats.contains(OPEN) {
            self.stats
                .set(ELAPSED, (closed - self.stats.get(OPEN)).max(0.0));
        }
        info!(stats = ?self.stats.snapshot(), "dispatcher closed");
    }

    /// Opens the dispatcher, runs `body` and closes it again.
    pub async fn scope<'a, F, Fut, T>(&'a self, body: F) -> T
    where
        F: FnOnce(&'a Self) -> Fut,
        Fut: Future<Output = T>,
    {
        self.open();
        let output = body(self).await;
        self.close().await;
        output
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64())
}

/// Builder for [`Dispatcher`].
#[derive(Default)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    middlewares: Option<Middlewares>,
    factory: Option<Arc<dyn TransportFactory>>,
}

impl fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("config", &self.config)
            .field("middlewares", &self.middlewares)
            .field("custom_transport", &self.factory.is_some())
            .finish()
    }
}

impl DispatcherBuilder {
    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default middleware stack.
    #[must_use]
    pub fn middlewares(mut self, middlewares: Middlewares) -> Self {
        self.middlewares = Some(middlewares);
        self
    }

    /// Replaces the reqwest transport.
    #[must_use]
    pub fn transport_factory(mut self, factory: impl TransportFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Validates the configuration and builds the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for out-of-range settings.
    pub fn build(self) -> Result<Dispatcher, ConfigError> {
        self.config.validate()?;
        Ok(Dispatcher::from_parts(
            self.config,
            self.middlewares.unwrap_or_else(Middlewares::defaults),
            self.factory.unwrap_or_else(|| Arc::new(ReqwestFactory)),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use futures_util::future::join_all;
    use tokio::time::Instant;

    use super::*;
    use crate::middleware::testing::Scripted;
    use crate::middleware::{Action, Backoff, Hook, RetryExceptions, RetryStatuses};
    use crate::stats::{REQ_RETRY, SESSION_NEW, SLEEP_ELAPSED};
    use crate::transport::testing::{MockTransport, shared};
    use crate::transport::{RawResponse, Transport, TransportError, TransportErrorKind};

    fn dispatcher(mock: &Arc<MockTransport>, middlewares: Middlewares) -> Dispatcher {
        Dispatcher::builder()
            .middlewares(middlewares)
            .transport_factory(shared(mock))
            .build()
            .unwrap()
    }

    fn request() -> Request {
        Request::new("https://example.com/page").unwrap()
    }

    fn journal() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn refused() -> MockTransport {
        MockTransport::new(|request, _| {
            Err(TransportError::connection(request.url().as_str(), "connection refused"))
        })
    }

    // ==================== Send Loop Tests ====================

    #[tokio::test]
    async fn test_send_without_middleware_preserves_request() {
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new());
        let mut original = request().with_param("q", "rust");
        original.meta_mut().insert("tag", serde_json::json!("x"));

        let response = dl.send(original.clone()).await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.request(), &original);
        assert_eq!(dl.stats().count(REQ_SCHEDULED), 1);
        assert_eq!(dl.stats().count(REQ_SENT), 1);
        assert_eq!(dl.stats().count(SESSION_NEW), 1);
    }

    #[tokio::test]
    async fn test_unclaimed_transport_failure_propagates_unchanged() {
        let mock = Arc::new(refused());
        let dl = dispatcher(&mock, Middlewares::new());

        let error = dl.send(request()).await.unwrap_err();

        let transport = error.as_transport().unwrap();
        assert_eq!(transport.kind(), TransportErrorKind::Connection);
        assert_eq!(transport.message(), "connection refused");
        assert_eq!(dl.stats().count(REQ_SENT), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_retry_sends_n_plus_one_and_sleeps_schedule() {
        let mock = Arc::new(MockTransport::status(500));
        let middlewares = Middlewares::new()
            .with(900, RetryStatuses::new([500]).with_times(3))
            .unwrap();
        let dl = dispatcher(&mock, middlewares);
        let start = Instant::now();

        let error = dl.send(request()).await.unwrap_err();

        assert!(matches!(error, DispatchError::RequestFailed { .. }), "{error}");
        assert!(error.to_string().contains("retries exceeded after 3 retries"));
        assert_eq!(mock.calls(), 4);
        assert_eq!(dl.stats().count(REQ_SENT), 4);
        assert_eq!(dl.stats().count(REQ_RETRY), 3);
        assert!((dl.stats().get(SLEEP_ELAPSED) - 4.0).abs() < f64::EPSILON);
        assert!(start.elapsed() >= Duration::from_secs(4));
        assert_eq!(dl.stats().count(RESPMID_RETURN_REQ), 3);
    }

    #[tokio::test]
    async fn test_retry_on_exception_recovers() {
        let mock = Arc::new(MockTransport::new(|request, call| {
            if call == 0 {
                Err(TransportError::timeout(request.url().as_str(), "timed out"))
            } else {
                Ok(RawResponse::new(request.url().clone(), 200))
            }
        }));
        let middlewares = Middlewares::new()
            .with(
                1000,
                RetryExceptions::default().with_backoff(Backoff::Fixed(Duration::ZERO)),
            )
            .unwrap();
        let dl = dispatcher(&mock, middlewares);

        let response = dl.send(request()).await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.request().meta().retries, Some(1));
        assert_eq!(dl.stats().count(RESPMID_EXC_REQ), 1);
        assert_eq!(dl.stats().count(REQ_SENT), 2);
    }

    #[tokio::test]
    async fn test_endless_rewrite_hits_limit_with_full_history() {
        let log = journal();
        let endless =
            Scripted::new("endless", &log).on_request(|req| Ok(Action::Request(req.clone())));
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new().with(10, endless).unwrap());

        let error = dl.send(request()).await.unwrap_err();

        match error {
            DispatchError::TooManyRewrites { limit, history } => {
                assert_eq!(limit, 10);
                assert_eq!(history.len(), 10);
            }
            other => panic!("expected TooManyRewrites, got {other}"),
        }
        assert_eq!(mock.calls(), 0);
        assert_eq!(dl.stats().count(REQMID_RETURN_REQ), 10);
    }

    #[tokio::test]
    async fn test_distinct_rewrites_still_hit_limit() {
        let log = journal();
        let crawl = Scripted::new("crawl", &log).on_request(|req| {
            let next = Request::new(&format!("{}x", req.url())).unwrap();
            Ok(Action::Request(next))
        });
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new().with(10, crawl).unwrap());

        let error = dl.send(request()).await.unwrap_err();

        let DispatchError::TooManyRewrites { history, .. } = error else {
            panic!("expected TooManyRewrites, got {error}");
        };
        assert_eq!(history.len(), 10);
        assert_eq!(history[0].url().path(), "/page");
        assert_eq!(history[9].url().path(), "/pagexxxxxxxxx");
        let distinct: HashSet<_> = history.iter().map(|req| req.url().as_str()).collect();
        assert_eq!(distinct.len(), 10);
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_response_rewrites_hit_limit() {
        let log = journal();
        let paginate = Scripted::new("paginate", &log).on_response(|resp| {
            let next = Request::new(&format!("{}x", resp.request().url())).unwrap();
            Ok(Action::Request(next))
        });
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new().with(10, paginate).unwrap());

        let error = dl.send(request()).await.unwrap_err();

        let DispatchError::TooManyRewrites { limit, history } = error else {
            panic!("expected TooManyRewrites, got {error}");
        };
        assert_eq!(limit, 10);
        assert_eq!(history.len(), 10);
        let distinct: HashSet<_> = history.iter().map(|req| req.url().as_str()).collect();
        assert_eq!(distinct.len(), 10);
        assert_eq!(mock.calls(), 10);
        assert_eq!(dl.stats().count(RESPMID_RETURN_REQ), 10);
        assert_eq!(dl.stats().count(REQMID_RETURN_REQ), 0);
    }

    #[tokio::test]
    async fn test_rewrite_limit_is_configurable() {
        let log = journal();
        let endless =
            Scripted::new("endless", &log).on_request(|req| Ok(Action::Request(req.clone())));
        let mock = Arc::new(MockTransport::status(200));
        let dl = Dispatcher::builder()
            .config(DispatcherConfig::default().with_rewrite_limit(3))
            .middlewares(Middlewares::new().with(10, endless).unwrap())
            .transport_factory(shared(&mock))
            .build()
            .unwrap();

        let error = dl.send(request()).await.unwrap_err();

        assert!(matches!(error, DispatchError::TooManyRewrites { limit: 3, .. }));
        assert_eq!(error.request().unwrap().url().as_str(), "https://example.com/page");
    }

    #[tokio::test]
    async fn test_request_hook_short_circuits_transport() {
        let log = journal();
        let cache = Scripted::new("cache", &log)
            .on_request(|req| Ok(Action::Response(Response::new(req.clone(), 299))));
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new().with(10, cache).unwrap());

        let response = dl.send(request()).await.unwrap();

        assert_eq!(response.status(), 299);
        assert_eq!(mock.calls(), 0);
        assert_eq!(dl.stats().count(REQ_SENT), 0);
        assert_eq!(dl.stats().count(REQMID_RETURN_RESP), 1);
    }

    #[tokio::test]
    async fn test_request_hook_drop_is_terminal() {
        let log = journal();
        let veto = Scripted::new("veto", &log)
            .on_request(|req| Err(DispatchError::request_dropped(req.clone(), "blocked host")));
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new().with(10, veto).unwrap());

        let error = dl.send(request()).await.unwrap_err();

        assert!(matches!(error, DispatchError::RequestDropped { .. }));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_raise_from_response_hook_is_contract_violation() {
        let log = journal();
        let bad = Scripted::new("bad", &log).on_response(|resp| {
            Ok(Action::Raise(TransportError::response(
                resp.url().as_str(),
                "nope",
            )))
        });
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new().with(10, bad).unwrap());

        let error = dl.send(request()).await.unwrap_err();

        match error {
            DispatchError::UnsupportedReturn { hook, middleware, .. } => {
                assert_eq!(hook, Hook::Response);
                assert_eq!(middleware, "bad");
            }
            other => panic!("expected UnsupportedReturn, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_exception_hook_response_claims_failure() {
        let log = journal();
        let fallback = Scripted::new("fallback", &log)
            .on_exception(|_, req| Ok(Action::Response(Response::new(req.clone(), 503))));
        let mock = Arc::new(refused());
        let dl = dispatcher(&mock, Middlewares::new().with(10, fallback).unwrap());

        let response = dl.send(request()).await.unwrap();

        assert_eq!(response.status(), 503);
        assert_eq!(dl.stats().count(RESPMID_EXC_RESP), 1);
        assert_eq!(dl.stats().count(REQ_SENT), 1);
    }

    #[tokio::test]
    async fn test_hook_order_ascending_then_descending() {
        let log = journal();
        let middlewares = Middlewares::new()
            .with(20, Scripted::new("b", &log))
            .unwrap()
            .with(10, Scripted::new("a", &log))
            .unwrap();
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, middlewares);

        dl.send(request()).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:request", "b:request", "b:response", "a:response"]
        );
    }

    #[tokio::test]
    async fn test_response_rewrite_follows_to_new_request() {
        let log = journal();
        let follow = Scripted::new("follow", &log).on_response(|resp| {
            if resp.status() == 302 {
                let next = Request::new("https://example.com/landing").unwrap();
                Ok(Action::Request(next))
            } else {
                Ok(Action::Continue)
            }
        });
        let mock = Arc::new(MockTransport::new(|request, call| {
            let status = if call == 0 { 302 } else { 200 };
            Ok(RawResponse::new(request.url().clone(), status))
        }));
        let dl = dispatcher(&mock, Middlewares::new().with(10, follow).unwrap());

        let response = dl.send(request()).await.unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(response.request().url().path(), "/landing");
        assert_eq!(dl.stats().count(RESPMID_RETURN_REQ), 1);
        assert_eq!(dl.stats().count(REQ_SCHEDULED), 1);
    }

    #[tokio::test]
    async fn test_response_hook_replaces_response() {
        let log = journal();
        let replace = Scripted::new("replace", &log).on_response(|resp| {
            Ok(Action::Response(
                Response::new(resp.request().clone(), 204).with_body("replaced"),
            ))
        });
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new().with(10, replace).unwrap());

        let response = dl.send(request()).await.unwrap();

        assert_eq!(response.status(), 204);
        assert_eq!(response.text(), "replaced");
        assert_eq!(dl.stats().count(RESPMID_RETURN_RESP), 1);
    }

    #[tokio::test]
    async fn test_slot_rewrite_routes_through_other_session() {
        let log = journal();
        let reroute = Scripted::new("reroute", &log).on_request(|req| {
            if req.slot() == "example.com" {
                Ok(Action::Request(req.clone().with_slot("mirror")))
            } else {
                Ok(Action::Continue)
            }
        });
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new().with(10, reroute).unwrap());

        let response = dl.send(request()).await.unwrap();

        assert_eq!(response.request().slot(), "mirror");
        assert_eq!(dl.sessions().slots(), vec!["example.com", "mirror"]);
        assert_eq!(dl.stats().count(SESSION_NEW), 2);
    }

    #[tokio::test]
    async fn test_send_with_overrides_configured_middlewares() {
        let mock = Arc::new(MockTransport::status(500));
        let dl = dispatcher(&mock, Middlewares::defaults());

        let response = dl.send_with(request(), &Middlewares::new()).await.unwrap();

        assert_eq!(response.status(), 500);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_session_open_failure_is_reported() {
        let dl = Dispatcher::builder()
            .middlewares(Middlewares::new())
            .transport_factory(|_: &SessionConfig| -> Result<Arc<dyn Transport>, TransportError> {
                Err(TransportError::invalid_request("", "bad proxy"))
            })
            .build()
            .unwrap();

        let error = dl.send(request()).await.unwrap_err();

        assert!(matches!(error, DispatchError::SessionOpen { ref slot, .. } if slot == "example.com"));
        assert!(dl.sessions().is_empty());
    }

    // ==================== Concurrency Tests ====================

    #[tokio::test]
    async fn test_concurrent_sends_share_one_session() {
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new());

        let results = join_all((0..16).map(|_| dl.send(request()))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(dl.stats().count(SESSION_NEW), 1);
        assert_eq!(dl.stats().count(REQ_SENT), 16);
        assert_eq!(dl.stats().count(REQ_SCHEDULED), 16);
        assert_eq!(mock.calls(), 16);
    }

    #[tokio::test]
    async fn test_cancelled_send_leaves_session_usable() {
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new());
        dl.new_session(
            "example.com",
            SessionConfig::default().with_rate_limit(1, Duration::from_secs(3600)),
        )
        .await
        .unwrap();
        dl.send(request()).await.unwrap();

        // The window is full; this send waits on the limiter until dropped.
        let blocked = tokio::time::timeout(Duration::from_millis(20), dl.send(request())).await;

        assert!(blocked.is_err(), "send should still be waiting for the limiter");
        let session = dl.sessions().get("example.com").unwrap();
        assert!(!session.is_closed());
        assert_eq!(mock.calls(), 1);
    }

    // ==================== Lifecycle Tests ====================

    #[tokio::test]
    async fn test_scope_records_lifecycle_and_closes_sessions() {
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new());

        let status = dl
            .scope(|dl| async move { dl.send(request()).await.map(|r| r.status()) })
            .await
            .unwrap();

        assert_eq!(status, 200);
        assert!(dl.stats().contains(OPEN));
        assert!(dl.stats().contains(CLOSE));
        assert!(dl.stats().get(ELAPSED) >= 0.0);
        assert!(dl.stats().get(CLOSE) >= dl.stats().get(OPEN));
        assert!(dl.sessions().is_empty());
        assert!(mock.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_reopens_session() {
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new());
        dl.send(request()).await.unwrap();
        dl.close().await;
        dl.close().await;

        dl.send(request()).await.unwrap();

        assert_eq!(dl.stats().count(SESSION_NEW), 2);
        assert_eq!(dl.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_new_session_replaces_existing() {
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new());
        dl.send(request()).await.unwrap();
        let before = dl.sessions().get("example.com").unwrap();

        let after = dl
            .new_session(
                "example.com",
                SessionConfig::default().with_rate_limit(5, Duration::from_secs(2)),
            )
            .await
            .unwrap();

        assert!(before.is_closed());
        assert!(!after.is_closed());
        assert_eq!(after.limiter().rate_limit(), 5);
        assert_eq!(dl.stats().count(SESSION_NEW), 2);
        assert!(Arc::ptr_eq(&after, &dl.sessions().get("example.com").unwrap()));
    }

    #[tokio::test]
    async fn test_new_session_rejects_invalid_config() {
        let mock = Arc::new(MockTransport::status(200));
        let dl = dispatcher(&mock, Middlewares::new());
        dl.send(request()).await.unwrap();
        let existing = dl.sessions().get("example.com").unwrap();

        let invalid = [
            SessionConfig::default().with_rate_limit(5, Duration::ZERO),
            SessionConfig::default().with_rate_limit(10_001, Duration::from_secs(1)),
        ];
        for config in invalid {
            let error = dl.new_session("example.com", config).await.unwrap_err();
            assert!(
                matches!(error, DispatchError::InvalidSession { ref slot, .. } if slot == "example.com"),
                "{error}"
            );
        }

        assert!(!existing.is_closed());
        assert_eq!(dl.stats().count(SESSION_NEW), 1);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = Dispatcher::builder()
            .config(DispatcherConfig::default().with_rewrite_limit(0))
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid { field: "rewrite_limit", .. })));
    }

    #[test]
    fn test_new_uses_default_stack() {
        let dl = Dispatcher::new();
        assert_eq!(dl.middlewares().priorities(), vec![100, 900, 1000]);
        assert_eq!(dl.config().rewrite_limit, 10);
    }
}
