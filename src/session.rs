//! Per-slot pool entries and the registry that owns them.
//!
//! A [`Session`] pairs one transport context with one [`RateLimiter`]; both
//! belong to that session alone. [`SessionPool`] creates sessions lazily,
//! replaces them on reconfiguration and drains them on shutdown.
//!
//! # Concurrency
//!
//! Lookups are lock-free (`DashMap`). Creation, replacement and shutdown are
//! serialized by one async lock with a re-check after acquiring it, so two
//! sends racing on a new slot install exactly one session. Callers hold
//! sessions through `Arc`, so cancelling a send never closes a shared entry.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_PERIOD, DEFAULT_POLL_INTERVAL, DEFAULT_RATE_LIMIT,
    READ_TIMEOUT_SECS,
};
use crate::rate_limiter::RateLimiter;
use crate::request::Request;
use crate::stats::{SESSION_NEW, Stats};
use crate::transport::{RawResponse, Transport, TransportError, TransportFactory};
use crate::user_agent::default_session_headers;

/// Settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Headers sent with every request unless the request sets them itself.
    pub headers: HeaderMap,
    /// Operations admitted per `period`; 0 disables limiting.
    pub rate_limit: usize,
    /// Rate-limit window.
    pub period: Duration,
    /// Re-check interval while the window is full.
    pub poll_interval: Duration,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Total request timeout.
    pub read_timeout: Duration,
    /// Whether the session keeps a cookie jar.
    pub cookie_store: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            headers: default_session_headers(),
            rate_limit: DEFAULT_RATE_LIMIT,
            period: DEFAULT_PERIOD,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            cookie_store: true,
        }
    }
}

impl SessionConfig {
    /// Sets the rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: usize, period: Duration) -> Self {
        self.rate_limit = rate_limit;
        self.period = period;
        self
    }

    /// Sets a default header.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces all default headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets connect and read timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.connect_timeout = connect;
        self.read_timeout = read;
        self
    }

    /// Enables or disables the cookie jar.
    #[must_use]
    pub fn with_cookie_store(mut self, enabled: bool) -> Self {
        self.cookie_store = enabled;
        self
    }

    fn limiter(&self) -> RateLimiter {
        RateLimiter::new(self.rate_limit, self.period).with_poll_interval(self.poll_interval)
    }
}

/// One pool entry: a transport context and its rate limiter.
pub struct Session {
    slot: String,
    transport: Arc<dyn Transport>,
    limiter: RateLimiter,
    config: SessionConfig,
    closed: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("slot", &self.slot)
            .field("rate_limit", &self.limiter.rate_limit())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session for `slot` over `transport`.
    #[must_use]
    pub fn new(slot: impl Into<String>, config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        let limiter = config.limiter();
        Self {
            slot: slot.into(),
            transport,
            limiter,
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the slot this session serves.
    #[must_use]
    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns the session's rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Returns true once [`Session::close`] ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends `request` once the rate limiter admits it.
    ///
    /// # Errors
    ///
    /// Returns the transport's [`TransportError`] unchanged.
    #[instrument(skip_all, fields(slot = %self.slot, url = %request.url()))]
    pub async fn send(&self, request: &Request) -> Result<RawResponse, TransportError> {
        let admission = self.limiter.acquire().await;
        if !admission.waited().is_zero() {
            debug!(
                waited_ms = u64::try_from(admission.waited().as_millis()).unwrap_or(u64::MAX),
                "rate limit admitted request"
            );
        }
        self.transport.send(request).await
    }

    /// Closes the transport. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.close().await;
        debug!(slot = %self.slot, "session closed");
    }
}

/// Registry of sessions keyed by slot.
pub struct SessionPool {
    sessions: DashMap<String, Arc<Session>>,
    lifecycle: Mutex<()>,
    stats: Arc<Stats>,
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("slots", &self.slots())
            .finish_non_exhaustive()
    }
}

impl SessionPool {
    /// Creates an empty pool recording creations into `stats`.
    #[must_use]
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            sessions: DashMap::new(),
            lifecycle: Mutex::new(()),
            stats,
        }
    }

    /// Returns the session for `slot`, if open.
    #[must_use]
    pub fn get(&self, slot: &str) -> Option<Arc<Session>> {
        self.sessions.get(slot).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the session for `slot`, creating it from `factory` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the factory cannot build a transport.
    #[instrument(skip(self, factory, config))]
    pub async fn get_or_create(
        &self,
        slot: &str,
        factory: &dyn TransportFactory,
        config: &SessionConfig,
    ) -> Result<Arc<Session>, TransportError> {
        if let Some(session) = self.get(slot) {
            return Ok(session);
        }

        let _guard = self.lifecycle.lock().await;
        // Another send may have installed it while we waited
        if let Some(session) = self.get(slot) {
            return Ok(session);
        }
        self.install(slot, factory, config)
    }

    /// Replaces the session for `slot` with one built from `config`.
    ///
    /// An existing session is closed before the new one is installed; a
    /// missing one is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the factory cannot build a transport.
    #[instrument(skip(self, factory, config))]
    pub async fn reopen(
        &self,
        slot: &str,
        factory: &dyn TransportFactory,
        config: &SessionConfig,
    ) -> Result<Arc<Session>, TransportError> {
        let _guard = self.lifecycle.lock().await;
        if let Some((_, previous)) = self.sessions.remove(slot) {
            debug!(slot, "closing session before reopen");
            previous.close().await;
        }
        self.install(slot, factory, config)
    }

    fn install(
        &self,
        slot: &str,
        factory: &dyn TransportFactory,
        config: &SessionConfig,
    ) -> Result<Arc<Session>, TransportError> {
        let transport = factory.build(config)?;
        let session = Arc::new(Session::new(slot, config.clone(), transport));
        self.sessions.insert(slot.to_string(), Arc::clone(&session));
        self.stats.incr(SESSION_NEW);
        info!(
            slot,
            rate_limit = config.rate_limit,
            period_ms = u64::try_from(config.period.as_millis()).unwrap_or(u64::MAX),
            "opened session"
        );
        Ok(session)
    }

    /// Closes every session and clears the registry. Safe to call repeatedly.
    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;
        let slots: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        let drained: Vec<Arc<Session>> = slots
            .iter()
            .filter_map(|slot| self.sessions.remove(slot).map(|(_, session)| session))
            .collect();
        if drained.is_empty() {
            return;
        }
        debug!(count = drained.len(), "closing sessions");
        join_all(drained.iter().map(|session| session.close())).await;
    }

    /// Returns the open slots, sorted.
    #[must_use]
    pub fn slots(&self) -> Vec<String> {
        let mut slots: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        slots.sort();
        slots
    }

    /// Returns the number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
