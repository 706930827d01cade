//! Error taxonomy for request dispatch.
//!
//! Terminal outcomes decided by middleware ([`DispatchError::RequestFailed`],
//! [`DispatchError::RequestDropped`]), the dispatcher's own loop guard
//! ([`DispatchError::TooManyRewrites`]), programmer errors in middleware
//! ([`DispatchError::UnsupportedReturn`]) and raw transport failures are kept
//! as distinct variants so callers can handle each case on its own.

use thiserror::Error;

use crate::config::ConfigError;
use crate::middleware::Hook;
use crate::request::Request;
use crate::transport::TransportError;

/// Errors returned by [`Dispatcher::send`](crate::Dispatcher::send).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A middleware determined the request cannot succeed (e.g. retries exhausted).
    #[error("request failed for {}: {reason}", .request.url())]
    RequestFailed {
        /// The last request that was attempted.
        request: Box<Request>,
        /// Human-readable reason.
        reason: String,
    },

    /// A middleware vetoed the request before it was sent.
    #[error("request dropped for {}: {reason}", .request.url())]
    RequestDropped {
        /// The vetoed request.
        request: Box<Request>,
        /// Human-readable reason.
        reason: String,
    },

    /// The middleware rewrite ceiling was reached.
    #[error("too many middleware rewrites: limit of {limit} reached")]
    TooManyRewrites {
        /// The configured ceiling.
        limit: usize,
        /// Every request that was replaced, oldest first.
        history: Vec<Request>,
    },

    /// A middleware produced an outcome its hook does not allow.
    #[error("unsupported {hook} middleware return from `{middleware}`: {got}")]
    UnsupportedReturn {
        /// The hook that misbehaved.
        hook: Hook,
        /// Name of the offending middleware.
        middleware: String,
        /// Description of what was returned.
        got: String,
    },

    /// The transport failed and no exception middleware claimed the failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A session could not be opened for a slot.
    #[error("failed to open session for slot {slot}: {source}")]
    SessionOpen {
        /// The slot being opened.
        slot: String,
        /// The transport construction error.
        #[source]
        source: TransportError,
    },

    /// A session was reconfigured with out-of-range settings.
    #[error("invalid session config for slot {slot}: {source}")]
    InvalidSession {
        /// The slot being reconfigured.
        slot: String,
        /// The validation failure.
        #[source]
        source: ConfigError,
    },
}

impl DispatchError {
    /// Creates a terminal failure for `request`.
    pub fn request_failed(request: Request, reason: impl Into<String>) -> Self {
        Self::RequestFailed {
            request: Box::new(request),
            reason: reason.into(),
        }
    }

    /// Creates a veto for `request`.
    pub fn request_dropped(request: Request, reason: impl Into<String>) -> Self {
        Self::RequestDropped {
            request: Box::new(request),
            reason: reason.into(),
        }
    }

    /// Creates a contract-violation error.
    pub fn unsupported_return(
        hook: Hook,
        middleware: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        Self::UnsupportedReturn {
            hook,
            middleware: middleware.into(),
            got: got.into(),
        }
    }

    /// Creates a session-open error.
    pub fn session_open(slot: impl Into<String>, source: TransportError) -> Self {
        Self::SessionOpen {
            slot: slot.into(),
            source,
        }
    }

    /// Returns the request attached to a middleware-decided outcome, if any.
    #[must_use]
    pub fn request(&self) -> Option<&Request> {
        match self {
            Self::RequestFailed { request, .. } | Self::RequestDropped { request, .. } => {
                Some(&**request)
            }
            Self::TooManyRewrites { history, .. } => history.last(),
            _ => None,
        }
    }

    /// Returns the transport error if this is an unclaimed transport failure.
    #[must_use]
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(error) => Some(error),
            _ => None,
        }
    }
}
