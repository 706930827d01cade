//! Outbound request descriptor.
//!
//! A [`Request`] carries the target URL, method, payloads, headers and the
//! transport tuning knobs, plus two routing/bookkeeping fields the dispatcher
//! understands:
//!
//! - `slot` selects the session (pool entry) the request is sent through. It
//!   defaults to the URL's host and only changes when middleware builds a new
//!   request with a different slot.
//! - `meta` is a typed side channel for middleware state that must survive
//!   rewrites (retry counters and arbitrary extensions).

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors raised while building a request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The target is not an absolute URL.
    #[error("invalid URL '{url}': {source}")]
    InvalidUrl {
        /// The rejected input.
        url: String,
        /// The parser error.
        #[source]
        source: url::ParseError,
    },

    /// The URL has no host to derive a slot from.
    #[error("URL '{url}' has no host")]
    MissingHost {
        /// The rejected URL.
        url: String,
    },

    /// A header name or value is not valid HTTP.
    #[error("invalid header '{name}': {message}")]
    InvalidHeader {
        /// The header name as given.
        name: String,
        /// Why it was rejected.
        message: String,
    },
}

/// Request body payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Raw bytes, sent as-is.
    Bytes(Vec<u8>),
    /// UTF-8 text.
    Text(String),
    /// `application/x-www-form-urlencoded` pairs.
    Form(Vec<(String, String)>),
    /// JSON document.
    Json(serde_json::Value),
}

/// How the transport treats redirects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedirectPolicy {
    /// Return 3xx responses as they are.
    None,
    /// Follow at most this many redirects.
    Limited(usize),
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::Limited(10)
    }
}

/// Username/password credentials for basic authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BasicAuth {
    /// User name.
    pub username: String,
    /// Password, if any.
    pub password: Option<String>,
}

impl BasicAuth {
    /// Creates credentials with a password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
        }
    }
}

/// Per-request middleware state, carried across every rewrite of one dispatch.
///
/// The retry keys are typed; anything else goes into the extension map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Retries already issued for this logical request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Ceiling on retries for this logical request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(flatten)]
    extensions: HashMap<String, serde_json::Value>,
}

impl Meta {
    /// Returns an extension value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.extensions.get(key)
    }

    /// Sets an extension value, returning the previous one.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        self.extensions.insert(key.into(), value.into())
    }

    /// Removes an extension value.
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.extensions.remove(key)
    }

    /// Returns true if no typed key or extension is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.retries.is_none() && self.max_retries.is_none() && self.extensions.is_empty()
    }
}

/// An outbound HTTP request.
///
/// # Example
///
/// ```
/// use requestr::Request;
///
/// # fn example() -> Result<(), requestr::RequestError> {
/// let request = Request::new("https://Example.com/search")?
///     .with_param("q", "rust")
///     .try_header("X-Trace", "1")?;
/// assert_eq!(request.slot(), "example.com");
/// assert_eq!(request.url().as_str(), "https://example.com/search");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: Method,
    url: Url,
    slot: String,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    body: Option<Body>,
    cookies: Vec<(String, String)>,
    auth: Option<BasicAuth>,
    proxy: Option<String>,
    proxy_auth: Option<BasicAuth>,
    proxy_headers: HeaderMap,
    timeout: Option<Duration>,
    redirect: RedirectPolicy,
    verify_tls: bool,
    meta: Meta,
}

impl Request {
    /// Creates a `GET` request for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] if `url` is not absolute or has no host.
    pub fn new(url: &str) -> Result<Self, RequestError> {
        let parsed = Url::parse(url).map_err(|source| RequestError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        Self::from_url(parsed)
    }

    /// Creates a `GET` request for an already parsed URL.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::MissingHost`] if the URL has no host.
    pub fn from_url(url: Url) -> Result<Self, RequestError> {
        let slot = url
            .host_str()
            .filter(|host| !host.is_empty())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| RequestError::MissingHost {
                url: url.to_string(),
            })?;
        Ok(Self {
            method: Method::GET,
            url,
            slot,
            headers: HeaderMap::new(),
            params: Vec::new(),
            body: None,
            cookies: Vec::new(),
            auth: None,
            proxy: None,
            proxy_auth: None,
            proxy_headers: HeaderMap::new(),
            timeout: None,
            redirect: RedirectPolicy::default(),
            verify_tls: true,
            meta: Meta::default(),
        })
    }

    /// Creates a `POST` request for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] if `url` is not absolute or has no host.
    pub fn post(url: &str) -> Result<Self, RequestError> {
        Ok(Self::new(url)?.with_method(Method::POST))
    }

    // ==================== Builders ====================

    /// Sets the HTTP method.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Routes the request through `slot` instead of its host. Empty keeps the host.
    #[must_use]
    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        let slot = slot.into();
        if !slot.is_empty() {
            self.slot = slot;
        }
        self
    }

    /// Sets a header, replacing any previous value.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets a header from strings.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidHeader`] if the name or value is not valid HTTP.
    pub fn try_header(self, name: &str, value: &str) -> Result<Self, RequestError> {
        let (name, value) = parse_header(name, value)?;
        Ok(self.with_header(name, value))
    }

    /// Appends a query parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets a JSON body.
    #[must_use]
    pub fn with_json(self, value: serde_json::Value) -> Self {
        self.with_body(Body::Json(value))
    }

    /// Sets a urlencoded form body.
    #[must_use]
    pub fn with_form<K, V>(self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let pairs = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.with_body(Body::Form(pairs))
    }

    /// Adds a cookie sent with this request only.
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    /// Sets basic-auth credentials.
    #[must_use]
    pub fn with_auth(mut self, auth: BasicAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Routes the request through a proxy.
    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Sets proxy credentials.
    #[must_use]
    pub fn with_proxy_auth(mut self, auth: BasicAuth) -> Self {
        self.proxy_auth = Some(auth);
        self
    }

    /// Sets the total timeout for this request, overriding the session's.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the redirect policy.
    #[must_use]
    pub fn with_redirect(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = redirect;
        self
    }

    /// Enables or disables TLS certificate verification.
    #[must_use]
    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Replaces the meta map.
    #[must_use]
    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    // ==================== Accessors ====================

    /// Returns the HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the target URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the routing slot.
    #[must_use]
    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Returns the request headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the request headers for modification.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns the query parameters appended to the URL.
    #[must_use]
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Returns the body, if any.
    #[must_use]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Returns the per-request cookies.
    #[must_use]
    pub fn cookies(&self) -> &[(String, String)] {
        &self.cookies
    }

    /// Returns the basic-auth credentials.
    #[must_use]
    pub fn auth(&self) -> Option<&BasicAuth> {
        self.auth.as_ref()
    }

    /// Returns the proxy URL.
    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Sets or clears the proxy URL.
    pub fn set_proxy(&mut self, proxy: Option<String>) {
        self.proxy = proxy;
    }

    /// Returns the proxy credentials.
    #[must_use]
    pub fn proxy_auth(&self) -> Option<&BasicAuth> {
        self.proxy_auth.as_ref()
    }

    /// Sets or clears the proxy credentials.
    pub fn set_proxy_auth(&mut self, auth: Option<BasicAuth>) {
        self.proxy_auth = auth;
    }

    /// Returns headers sent to the proxy.
    #[must_use]
    pub fn proxy_headers(&self) -> &HeaderMap {
        &self.proxy_headers
    }

    /// Returns headers sent to the proxy for modification.
    pub fn proxy_headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.proxy_headers
    }

    /// Returns the per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the redirect policy.
    #[must_use]
    pub fn redirect(&self) -> RedirectPolicy {
        self.redirect
    }

    /// Returns whether TLS certificates are verified.
    #[must_use]
    pub fn verify_tls(&self) -> bool {
        self.verify_tls
    }

    /// Returns the middleware meta map.
    #[must_use]
    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    /// Returns the middleware meta map for modification.
    pub fn meta_mut(&mut self) -> &mut Meta {
        &mut self.meta
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({} {})", self.method, self.url)
    }
}

/// Parses a header pair from strings.
pub(crate) fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), RequestError> {
    let header_name =
        HeaderName::from_bytes(name.as_bytes()).map_err(|e| RequestError::InvalidHeader {
            name: name.to_string(),
            message: e.to_string(),
        })?;
    let header_value = HeaderValue::from_str(value).map_err(|e| RequestError::InvalidHeader {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    Ok((header_name, header_value))
}
