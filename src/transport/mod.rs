//! The "send one HTTP request" capability.
//!
//! The dispatcher depends only on the [`Transport`] trait: given a
//! [`Request`], produce a [`RawResponse`] (status, headers, body, final URL)
//! or fail with a [`TransportError`]. [`ReqwestTransport`] is the production
//! implementation; sessions build one per slot through a [`TransportFactory`].

mod client;

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use thiserror::Error;
use url::Url;

pub use client::ReqwestTransport;

use crate::request::Request;
use crate::session::SessionConfig;

/// Classes of transport failure, matched by retry-on-exception policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// Could not connect, or the connection broke or timed out.
    Connection,
    /// The peer answered with something that is not a valid HTTP response.
    Response,
    /// The request could not be built (bad header, unsupported proxy URL, ...).
    InvalidRequest,
    /// Anything else.
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connection => "connection",
            Self::Response => "response",
            Self::InvalidRequest => "invalid request",
            Self::Other => "transport",
        };
        f.write_str(name)
    }
}

/// A transport-level failure.
///
/// Cloneable so exception middleware can inspect it, keep it and raise it
/// again (or raise a different one) without consuming the original.
#[derive(Debug, Clone, Error)]
#[error("{kind} error for {url}: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    url: String,
    message: String,
    timed_out: bool,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl TransportError {
    /// Creates a transport error of the given kind.
    pub fn new(kind: TransportErrorKind, url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            message: message.into(),
            timed_out: false,
            source: None,
        }
    }

    /// Creates a connection error.
    pub fn connection(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connection, url, message)
    }

    /// Creates a connection error caused by a timeout.
    pub fn timeout(url: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::connection(url, message);
        error.timed_out = true;
        error
    }

    /// Creates a response (protocol) error.
    pub fn response(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Response, url, message)
    }

    /// Creates an invalid-request error.
    pub fn invalid_request(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidRequest, url, message)
    }

    /// Attaches the underlying error.
    #[must_use]
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the failure class.
    #[must_use]
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Returns the URL that failed.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the failure description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if the failure was a connect or read timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }
}

/// What the transport hands back for one successful exchange.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Final URL after redirects.
    pub url: Url,
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: HeaderMap,
    /// Raw (content-decoded) body bytes.
    pub body: Vec<u8>,
}

impl RawResponse {
    /// Creates a response with no headers and an empty body.
    #[must_use]
    pub fn new(url: Url, status: u16) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }
}

/// One persistent transport context, owned by a single session.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends one request and returns the raw response.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the exchange could not complete.
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError>;

    /// Releases pooled connections. Called once when the owning session closes.
    async fn close(&self) {}
}

/// Builds the transport for a newly opened session.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport configured by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the transport cannot be constructed.
    fn build(&self, config: &SessionConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&SessionConfig) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync,
{
    fn build(&self, config: &SessionConfig) -> Result<Arc<dyn Transport>, TransportError> {
        self(config)
    }
}

/// Factory producing [`ReqwestTransport`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqwestFactory;

impl TransportFactory for ReqwestFactory {
    fn build(&self, config: &SessionConfig) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(ReqwestTransport::new(config.clone())?))
    }
}
