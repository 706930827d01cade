//! Requestr Core Library
//!
//! A programmable HTTP request-dispatch engine: every outbound [`Request`] is
//! routed through a per-destination [`Session`] (one transport context plus one
//! sliding-window [`RateLimiter`] per slot), passed through a priority-ordered
//! [`Middleware`] pipeline (retry, header injection, proxy rotation) and turned
//! into a normalized [`Response`] or a terminal [`DispatchError`].
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`rate_limiter`] - Sliding-window limiter bounding operations per period
//! - [`session`] - Per-slot pool entries and the concurrent session registry
//! - [`transport`] - The "send one HTTP request" capability and its reqwest backend
//! - [`request`] / [`response`] - Value types flowing through the pipeline
//! - [`middleware`] - Hook trait, priority registry and reference policies
//! - [`proxy`] - Shuffled single-use-per-draw proxy selection
//! - [`dispatcher`] - The send loop tying everything together
//! - [`stats`] - Concurrent statistics counters
//!
//! # Example
//!
//! ```no_run
//! use requestr::{Dispatcher, Request};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = Dispatcher::new();
//! let request = Request::new("https://example.com/")?;
//! let response = dispatcher
//!     .scope(|dl| async move { dl.send(request).await })
//!     .await?;
//! println!("{} {}", response.status(), response.url());
//! # Ok(())
//! # }
//! ```

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod middleware;
pub mod proxy;
pub mod rate_limiter;
pub mod request;
pub mod response;
pub mod session;
pub mod stats;
pub mod transport;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, DispatcherConfig, FileConfig};
pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::DispatchError;
pub use middleware::{
    Action, Backoff, Hook, HookContext, Middleware, Middlewares, RandomHeader,
    RegistrationError, RetryExceptions, RetryStatuses, RotatingProxy,
};
pub use proxy::ProxyPool;
pub use rate_limiter::{Admission, RateLimiter};
pub use request::{BasicAuth, Body, Meta, RedirectPolicy, Request, RequestError};
pub use response::{Response, ResponseError};
pub use session::{Session, SessionConfig, SessionPool};
pub use stats::Stats;
pub use transport::{
    RawResponse, ReqwestFactory, ReqwestTransport, Transport, TransportError, TransportErrorKind,
    TransportFactory,
};
pub use user_agent::{DEFAULT_USER_AGENT, default_session_headers};
