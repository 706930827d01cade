//! Middleware pipeline for request dispatch.
//!
//! A [`Middleware`] has three hooks, each answering with an [`Action`]:
//!
//! | Hook                                   | Runs                        | Order                  |
//! |----------------------------------------|-----------------------------|------------------------|
//! | [`Middleware::process_request`]        | before the transport call   | ascending priority     |
//! | [`Middleware::process_response`]       | after a transport response  | descending priority    |
//! | [`Middleware::process_exception`]      | after a transport failure   | descending priority    |
//!
//! Low priorities act first on the way to the wire and last on the way back;
//! high priorities (retry) sit closest to the transport. Each chain stops at
//! the first hook that answers with anything but [`Action::Continue`].
//!
//! # Architecture
//!
//! - [`Middlewares`] - Priority-ordered registry and chain runners
//! - [`RandomHeader`] - Sets a missing header to a random configured value
//! - [`RotatingProxy`] - Draws a proxy from one of several [`ProxyPool`](crate::ProxyPool)s
//! - [`RetryStatuses`] / [`RetryExceptions`] - Retry with backoff on status codes or transport errors

mod headers;
mod proxy;
mod registry;
mod retry;

use std::fmt;

use async_trait::async_trait;

pub use headers::RandomHeader;
pub use proxy::RotatingProxy;
pub use registry::{Middlewares, RegistrationError};
pub(crate) use registry::{ChainOutcome, Recovery};
pub use retry::{Backoff, DEFAULT_RETRY_TIMES, RetryExceptions, RetryStatuses};

use crate::error::DispatchError;
use crate::request::Request;
use crate::response::Response;
use crate::session::Session;
use crate::stats::Stats;
use crate::transport::TransportError;

/// The three hook points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Pre-request.
    Request,
    /// Post-response.
    Response,
    /// On transport failure.
    Exception,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Exception => "exception",
        };
        f.write_str(name)
    }
}

/// What a hook wants the dispatcher to do next.
#[derive(Debug)]
pub enum Action {
    /// Keep going with the next middleware.
    Continue,
    /// Replace the in-flight request and restart the pipeline from the top.
    Request(Request),
    /// Stop and return this response.
    Response(Response),
    /// Replace the in-flight transport error (exception hook only).
    Raise(TransportError),
}

impl Action {
    /// Short description used in contract-violation errors.
    pub(crate) fn describe(&self) -> String {
        match self {
            Self::Continue => "continue".to_string(),
            Self::Request(request) => request.to_string(),
            Self::Response(response) => response.to_string(),
            Self::Raise(error) => format!("raise({error})"),
        }
    }
}

/// What a hook can see besides the request or response it is handed.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    /// The session the request is routed through.
    pub session: &'a Session,
    /// The dispatcher's statistics.
    pub stats: &'a Stats,
}

/// A pluggable dispatch policy.
///
/// Every hook defaults to [`Action::Continue`], so implementations only
/// override the ones they need. Returning `Err` ends the dispatch with that
/// error; this is how a policy fails a request for good (see
/// [`DispatchError::request_failed`]).
///
/// # Object Safety
///
/// This trait uses `async_trait` so middlewares can be stored as
/// `Arc<dyn Middleware>` in the registry.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Returns the middleware's name for logs and errors.
    fn name(&self) -> &str;

    /// Runs before the request is sent.
    ///
    /// May modify `request` in place. [`Action::Raise`] is not allowed here.
    async fn process_request(
        &self,
        _request: &mut Request,
        _ctx: HookContext<'_>,
    ) -> Result<Action, DispatchError> {
        Ok(Action::Continue)
    }

    /// Runs after the transport returned a response.
    ///
    /// [`Action::Raise`] is not allowed here.
    async fn process_response(
        &self,
        _response: &mut Response,
        _ctx: HookContext<'_>,
    ) -> Result<Action, DispatchError> {
        Ok(Action::Continue)
    }

    /// Runs after the transport failed with `error` (the original failure,
    /// or the one raised by a higher-priority exception hook).
    async fn process_exception(
        &self,
        _error: &TransportError,
        _request: &mut Request,
        _ctx: HookContext<'_>,
    ) -> Result<Action, DispatchError> {
        Ok(Action::Continue)
    }
}
