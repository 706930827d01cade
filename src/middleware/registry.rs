//! Priority-ordered middleware registry and the three chain runners.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use super::{Action, Hook, HookContext, Middleware, RandomHeader, RetryExceptions, RetryStatuses};
use crate::error::DispatchError;
use crate::request::Request;
use crate::response::Response;
use crate::transport::TransportError;
use crate::user_agent::DEFAULT_USER_AGENT;

/// Errors raised while registering middleware.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Another middleware already holds this priority.
    #[error("middleware priority {priority} is already taken by `{existing}`")]
    DuplicatePriority {
        /// The contested priority.
        priority: i32,
        /// Name of the middleware already registered there.
        existing: String,
    },
}

/// Result of the request and response chains.
#[derive(Debug)]
pub(crate) enum ChainOutcome {
    /// Every hook continued.
    Pass,
    /// A hook replaced the request.
    Rewrite(Request),
    /// A hook produced the final response.
    ShortCircuit(Response),
}

/// Result of an exception chain that claimed the failure.
#[derive(Debug)]
pub(crate) enum Recovery {
    /// Retry with this request.
    Rewrite(Request),
    /// Answer with this response.
    Respond(Response),
}

/// Middlewares keyed by unique priority.
///
/// Cloning is cheap; middlewares are shared behind `Arc`.
///
/// # Example
///
/// ```
/// use requestr::{Middlewares, RetryStatuses};
///
/// let mut middlewares = Middlewares::new();
/// middlewares.register(900, RetryStatuses::new([500, 503])).unwrap();
/// assert!(middlewares.register(900, RetryStatuses::default()).is_err());
/// ```
#[derive(Clone, Default)]
pub struct Middlewares {
    chain: BTreeMap<i32, Arc<dyn Middleware>>,
}

impl fmt::Debug for Middlewares {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.chain.iter().map(|(priority, mw)| (priority, mw.name())))
            .finish()
    }
}

impl Middlewares {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the default stack: browser User-Agent injection at 100,
    /// retry on status 500 at 900, retry on connection/response errors at 1000.
    #[must_use]
    pub fn defaults() -> Self {
        let mut chain: BTreeMap<i32, Arc<dyn Middleware>> = BTreeMap::new();
        chain.insert(100, Arc::new(RandomHeader::user_agent([DEFAULT_USER_AGENT])));
        chain.insert(900, Arc::new(RetryStatuses::default()));
        chain.insert(1000, Arc::new(RetryExceptions::default()));
        Self { chain }
    }

    /// Registers `middleware` at `priority`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicatePriority`] if `priority` is taken.
    pub fn register(
        &mut self,
        priority: i32,
        middleware: impl Middleware + 'static,
    ) -> Result<(), RegistrationError> {
        self.register_arc(priority, Arc::new(middleware))
    }

    /// Registers a shared middleware at `priority`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicatePriority`] if `priority` is taken.
    pub fn register_arc(
        &mut self,
        priority: i32,
        middleware: Arc<dyn Middleware>,
    ) -> Result<(), RegistrationError> {
        if let Some(existing) = self.chain.get(&priority) {
            return Err(RegistrationError::DuplicatePriority {
                priority,
                existing: existing.name().to_string(),
            });
        }
        debug!(priority, middleware = middleware.name(), "registered middleware");
        self.chain.insert(priority, middleware);
        Ok(())
    }

    /// Builder form of [`Middlewares::register`].
    ///
    /// # Errors
    ///
    /// Returns [`RegistrationError::DuplicatePriority`] if `priority` is taken.
    pub fn with(
        mut self,
        priority: i32,
        middleware: impl Middleware + 'static,
    ) -> Result<Self, RegistrationError> {
        self.register(priority, middleware)?;
        Ok(self)
    }

    /// Removes and returns the middleware at `priority`.
    pub fn remove(&mut self, priority: i32) -> Option<Arc<dyn Middleware>> {
        self.chain.remove(&priority)
    }

    /// Returns registered priorities in ascending order.
    #[must_use]
    pub fn priorities(&self) -> Vec<i32> {
        self.chain.keys().copied().collect()
    }

    /// Returns the number of registered middlewares.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Runs pre-request hooks in ascending priority.
    pub(crate) async fn run_request(
        &self,
        request: &mut Request,
        ctx: HookContext<'_>,
    ) -> Result<ChainOutcome, DispatchError> {
        for (priority, middleware) in &self.chain {
            let action = middleware
                .process_request(request, ctx)
                .await
                .map_err(|e| contain(Hook::Request, middleware.name(), e))?;
            match action {
                Action::Continue => {}
                Action::Request(next) => {
                    debug!(priority, middleware = middleware.name(), "request hook rewrote request");
                    return Ok(ChainOutcome::Rewrite(next));
                }
                Action::Response(response) => {
                    debug!(priority, middleware = middleware.name(), "request hook answered");
                    return Ok(ChainOutcome::ShortCircuit(response));
                }
                raise @ Action::Raise(_) => {
                    return Err(DispatchError::unsupported_return(
                        Hook::Request,
                        middleware.name(),
                        raise.describe(),
                    ));
                }
            }
        }
        Ok(ChainOutcome::Pass)
    }

    /// Runs post-response hooks in descending priority.
    pub(crate) async fn run_response(
        &self,
        response: &mut Response,
        ctx: HookContext<'_>,
    ) -> Result<ChainOutcome, DispatchError> {
        for (priority, middleware) in self.chain.iter().rev() {
            let action = middleware
                .process_response(response, ctx)
                .await
                .map_err(|e| contain(Hook::Response, middleware.name(), e))?;
            match action {
                Action::Continue => {}
                Action::Request(next) => {
                    debug!(priority, middleware = middleware.name(), "response hook rewrote request");
                    return Ok(ChainOutcome::Rewrite(next));
                }
                Action::Response(replacement) => {
                    debug!(priority, middleware = middleware.name(), "response hook replaced response");
                    return Ok(ChainOutcome::ShortCircuit(replacement));
                }
                raise @ Action::Raise(_) => {
                    return Err(DispatchError::unsupported_return(
                        Hook::Response,
                        middleware.name(),
                        raise.describe(),
                    ));
                }
            }
        }
        Ok(ChainOutcome::Pass)
    }

    /// Runs exception hooks in descending priority.
    ///
    /// A raised error replaces the current one for the remaining hooks. If no
    /// hook claims the failure, the current error is returned as
    /// [`DispatchError::Transport`]. Errors returned by a hook end the chain.
    pub(crate) async fn run_exception(
        &self,
        error: TransportError,
        request: &mut Request,
        ctx: HookContext<'_>,
    ) -> Result<Recovery, DispatchError> {
        let mut current = error;
        for (priority, middleware) in self.chain.iter().rev() {
            match middleware.process_exception(&current, request, ctx).await? {
                Action::Continue => {}
                Action::Request(next) => {
                    debug!(priority, middleware = middleware.name(), "exception hook rewrote request");
                    return Ok(Recovery::Rewrite(next));
                }
                Action::Response(response) => {
                    debug!(priority, middleware = middleware.name(), "exception hook answered");
                    return Ok(Recovery::Respond(response));
                }
                Action::Raise(raised) => {
                    debug!(
                        priority,
                        middleware = middleware.name(),
                        error = %raised,
                        "exception hook raised"
                    );
                    current = raised;
                }
            }
        }
        Err(DispatchError::Transport(current))
    }
}

/// Maps errors a request or response hook may not produce to a contract violation.
fn contain(hook: Hook, middleware: &str, error: DispatchError) -> DispatchError {
    match error {
        DispatchError::Transport(raised) => {
            DispatchError::unsupported_return(hook, middleware, format!("raise({raised})"))
        }
        DispatchError::TooManyRewrites { limit, .. } => DispatchError::unsupported_return(
            hook,
            middleware,
            format!("too many rewrites (limit {limit})"),
        ),
        DispatchError::SessionOpen { slot, .. } | DispatchError::InvalidSession { slot, .. } => {
            DispatchError::unsupported_return(
                hook,
                middleware,
                format!("session error for slot {slot}"),
            )
        }
        other => other,
    }
}
