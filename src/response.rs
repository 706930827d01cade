//! Normalized response with lazily decoded views.
//!
//! The body is kept as raw bytes. [`Response::text`] and [`Response::json`]
//! decode on first access and cache the result for the response's lifetime.

use std::fmt;
use std::sync::{LazyLock, OnceLock};

use encoding_rs::{Encoding, UTF_8};
use regex::Regex;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::request::Request;
use crate::transport::RawResponse;

/// Content types accepted by [`Response::json`] (`application/json`, `application/ld+json`, ...).
#[allow(clippy::expect_used)]
static JSON_CONTENT_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^application/(?:[\w.+-]+?\+)?json").expect("JSON content-type regex is valid")
});

/// Errors raised by derived response views.
#[derive(Debug, Error)]
pub enum ResponseError {
    /// JSON was requested from a non-JSON content type.
    #[error("attempt to decode JSON with unexpected mimetype: {content_type:?}")]
    UnexpectedMimeType {
        /// The `Content-Type` header value (empty when absent).
        content_type: String,
    },

    /// The body is not valid JSON (or does not match the target type).
    #[error("invalid JSON body: {source}")]
    Json {
        /// The decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// The link could not be resolved against the response URL.
    #[error("cannot join '{href}' onto {base}: {source}")]
    Join {
        /// The relative reference.
        href: String,
        /// The response URL.
        base: String,
        /// The parser error.
        #[source]
        source: url::ParseError,
    },
}

/// A response together with the request that produced it.
pub struct Response {
    request: Request,
    url: Url,
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    encoding: String,
    text: OnceLock<String>,
    json: OnceLock<serde_json::Value>,
}

impl Response {
    /// Creates a response for `request` with an empty body.
    ///
    /// Middleware use this to short-circuit the pipeline with a synthetic answer.
    #[must_use]
    pub fn new(request: Request, status: u16) -> Self {
        let url = request.url().clone();
        Self::from_parts(request, url, status, HeaderMap::new(), Vec::new())
    }

    /// Wraps what the transport returned for `request`.
    #[must_use]
    pub fn from_raw(request: Request, raw: RawResponse) -> Self {
        Self::from_parts(request, raw.url, raw.status, raw.headers, raw.body)
    }

    fn from_parts(request: Request, url: Url, status: u16, headers: HeaderMap, body: Vec<u8>) -> Self {
        let encoding = charset_from_headers(&headers).unwrap_or_else(|| "utf-8".to_string());
        Self {
            request,
            url,
            status,
            headers,
            body,
            encoding,
            text: OnceLock::new(),
            json: OnceLock::new(),
        }
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self.text = OnceLock::new();
        self.json = OnceLock::new();
        self
    }

    /// Sets a header.
    #[must_use]
    pub fn with_header(
        mut self,
        name: reqwest::header::HeaderName,
        value: reqwest::header::HeaderValue,
    ) -> Self {
        if name == CONTENT_TYPE
            && let Some(charset) = value.to_str().ok().and_then(charset_param)
        {
            self.encoding = charset;
        }
        self.headers.insert(name, value);
        self.text = OnceLock::new();
        self.json = OnceLock::new();
        self
    }

    /// Returns the request this response answers.
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Consumes the response, returning its request.
    #[must_use]
    pub fn into_request(self) -> Request {
        self.request
    }

    /// Returns the final URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns the HTTP status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns the response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a header value as a string, if present and printable.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Returns the body encoding (from the `Content-Type` charset, default utf-8).
    #[must_use]
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Returns the raw body bytes.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.body
    }

    /// Returns the decoded body text.
    ///
    /// The charset label is resolved with the WHATWG encoding table; unknown
    /// labels fall back to UTF-8. Malformed sequences are replaced.
    pub fn text(&self) -> &str {
        self.text.get_or_init(|| decode(&self.body, &self.encoding))
    }

    /// Returns the body parsed as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ResponseError::UnexpectedMimeType`] unless the content type
    /// is in the JSON family, or [`ResponseError::Json`] if the body does not parse.
    pub fn json(&self) -> Result<&serde_json::Value, ResponseError> {
        if let Some(value) = self.json.get() {
            return Ok(value);
        }
        self.check_json_content_type()?;
        let value = serde_json::from_str(self.text()).map_err(|source| ResponseError::Json { source })?;
        Ok(self.json.get_or_init(|| value))
    }

    /// Deserializes the JSON body into `T`.
    ///
    /// # Errors
    ///
    /// Same as [`Response::json`], plus a [`ResponseError::Json`] if the
    /// document does not match `T`.
    pub fn json_as<T: DeserializeOwned>(&self) -> Result<T, ResponseError> {
        let value = self.json()?;
        T::deserialize(value).map_err(|source| ResponseError::Json { source })
    }

    /// Resolves `href` against the final URL.
    ///
    /// # Errors
    ///
    /// Returns [`ResponseError::Join`] if the reference cannot be resolved.
    pub fn urljoin(&self, href: &str) -> Result<Url, ResponseError> {
        self.url.join(href).map_err(|source| ResponseError::Join {
            href: href.to_string(),
            base: self.url.to_string(),
            source,
        })
    }

    fn check_json_content_type(&self) -> Result<(), ResponseError> {
        let content_type = self.header(CONTENT_TYPE.as_str()).unwrap_or_default().to_lowercase();
        if JSON_CONTENT_TYPE.is_match(&content_type) {
            Ok(())
        } else {
            Err(ResponseError::UnexpectedMimeType { content_type })
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("body_len", &self.body.len())
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response({} {})", self.status, self.url)
    }
}

fn charset_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(charset_param)
}

/// Extracts the `charset=` parameter from a content type.
fn charset_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
    })
}

fn decode(body: &[u8], encoding: &str) -> String {
    let encoding = Encoding::for_label(encoding.as_bytes()).unwrap_or(UTF_8);
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}
