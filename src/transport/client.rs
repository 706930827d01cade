//! reqwest-backed transport.
//!
//! One [`ReqwestTransport`] serves one session. It owns the session's cookie
//! jar and a small cache of `reqwest::Client`s keyed by the per-request knobs
//! that reqwest only accepts at client build time (proxy, redirect policy,
//! TLS verification). Every cached client shares the jar, so cookies stay
//! within the session no matter which client sent the request.

use std::panic::{AssertUnwindSafe, catch_unwind, set_hook, take_hook};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::cookie::Jar;
use reqwest::header::{
    CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, PROXY_AUTHORIZATION,
};
use reqwest::{Client, ClientBuilder, Proxy, redirect};
use tracing::{debug, instrument, warn};
use url::Url;

use super::{RawResponse, Transport, TransportError, TransportErrorKind};
use crate::request::{BasicAuth, Body, RedirectPolicy, Request};
use crate::session::SessionConfig;

/// Build-time client settings a request can vary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    proxy: Option<String>,
    proxy_auth: Option<BasicAuth>,
    proxy_headers: Vec<(String, Vec<u8>)>,
    redirect: RedirectPolicy,
    verify_tls: bool,
}

impl ClientKey {
    fn for_request(request: &Request) -> Self {
        Self {
            proxy: request.proxy().map(str::to_string),
            proxy_auth: request.proxy_auth().cloned(),
            proxy_headers: request
                .proxy_headers()
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
            redirect: request.redirect(),
            verify_tls: request.verify_tls(),
        }
    }
}

/// HTTP transport for one session.
///
/// # Example
///
/// ```no_run
/// use requestr::{ReqwestTransport, Request, SessionConfig, Transport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = ReqwestTransport::new(SessionConfig::default())?;
/// let raw = transport.send(&Request::new("https://example.com/")?).await?;
/// println!("{} ({} bytes)", raw.status, raw.body.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ReqwestTransport {
    config: SessionConfig,
    jar: Option<Arc<Jar>>,
    clients: DashMap<ClientKey, Client>,
}

impl ReqwestTransport {
    /// Creates a transport for a session configured by `config`.
    ///
    /// The default client (no proxy, default redirects, TLS verified) is
    /// built eagerly so configuration errors surface when the session opens.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the HTTP client cannot be built.
    pub fn new(config: SessionConfig) -> Result<Self, TransportError> {
        let jar = config.cookie_store.then(|| Arc::new(Jar::default()));
        let transport = Self {
            config,
            jar,
            clients: DashMap::new(),
        };
        let default_key = ClientKey {
            proxy: None,
            proxy_auth: None,
            proxy_headers: Vec::new(),
            redirect: RedirectPolicy::default(),
            verify_tls: true,
        };
        transport.client_for(&default_key, "")?;
        Ok(transport)
    }

    /// Returns the session cookie jar, if cookies are enabled.
    #[must_use]
    pub fn cookie_jar(&self) -> Option<&Arc<Jar>> {
        self.jar.as_ref()
    }

    fn client_for(&self, key: &ClientKey, url: &str) -> Result<Client, TransportError> {
        if let Some(client) = self.clients.get(key) {
            return Ok(client.value().clone());
        }
        let client = self.build_client(key, url)?;
        Ok(self
            .clients
            .entry(key.clone())
            .or_insert(client)
            .value()
            .clone())
    }

    fn build_client(&self, key: &ClientKey, url: &str) -> Result<Client, TransportError> {
        debug!(proxy = ?key.proxy, redirect = ?key.redirect, "building HTTP client");
        match try_build(|| self.client_builder(key, url)) {
            Ok(result) => result,
            Err(()) => {
                warn!("HTTP client builder panicked while loading system proxy settings; retrying without them");
                try_build(|| Ok(self.client_builder(key, url)?.no_proxy()))
                    .map_err(|()| TransportError::new(TransportErrorKind::Other, url, "HTTP client builder panicked"))?
            }
        }
    }

    fn client_builder(&self, key: &ClientKey, url: &str) -> Result<ClientBuilder, TransportError> {
        let mut builder = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.read_timeout)
            .gzip(true)
            .default_headers(self.config.headers.clone())
            .redirect(match key.redirect {
                RedirectPolicy::None => redirect::Policy::none(),
                RedirectPolicy::Limited(max) => redirect::Policy::limited(max),
            })
            .danger_accept_invalid_certs(!key.verify_tls);
        if let Some(jar) = &self.jar {
            builder = builder.cookie_provider(Arc::clone(jar));
        }
        if let Some(proxy_url) = &key.proxy {
            let mut proxy = Proxy::all(proxy_url).map_err(|e| {
                TransportError::invalid_request(url, format!("invalid proxy '{proxy_url}'"))
                    .with_source(e)
            })?;
            if let Some(auth) = &key.proxy_auth {
                proxy = proxy.basic_auth(&auth.username, auth.password.as_deref().unwrap_or_default());
            }
            let mut headers = HeaderMap::new();
            for (name, raw) in &key.proxy_headers {
                let invalid = |message: String| TransportError::invalid_request(url, message);
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| invalid(format!("invalid proxy header name '{name}'")).with_source(e))?;
                let value = HeaderValue::from_bytes(raw)
                    .map_err(|e| invalid(format!("invalid proxy header '{name}'")).with_source(e))?;
                if name == PROXY_AUTHORIZATION {
                    proxy = proxy.custom_http_auth(value);
                } else {
                    headers.append(name, value);
                }
            }
            if !headers.is_empty() {
                proxy = proxy.headers(headers);
            }
            builder = builder.proxy(proxy);
        }
        Ok(builder)
    }

    fn build_request(client: &Client, request: &Request) -> reqwest::RequestBuilder {
        let mut url = request.url().clone();
        if !request.params().is_empty() {
            url.query_pairs_mut().extend_pairs(request.params());
        }

        let mut builder = client
            .request(request.method().clone(), url)
            .headers(request.headers().clone());

        if !request.cookies().is_empty() {
            let cookies = request
                .cookies()
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            if let Ok(value) = HeaderValue::from_str(&cookies) {
                builder = builder.header(COOKIE, value);
            }
        }
        if let Some(auth) = request.auth() {
            builder = builder.basic_auth(&auth.username, auth.password.as_deref());
        }
        if let Some(timeout) = request.timeout() {
            builder = builder.timeout(timeout);
        }
        match request.body() {
            Some(Body::Bytes(bytes)) => builder = builder.body(bytes.clone()),
            Some(Body::Text(text)) => builder = builder.body(text.clone()),
            Some(Body::Json(value)) => builder = builder.json(value),
            Some(Body::Form(pairs)) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish();
                if !request.headers().contains_key(CONTENT_TYPE) {
                    builder = builder.header(
                        CONTENT_TYPE,
                        HeaderValue::from_static("application/x-www-form-urlencoded"),
                    );
                }
                builder = builder.body(encoded);
            }
            None => {}
        }
        builder
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[instrument(skip_all, fields(method = %request.method(), url = %request.url()))]
    async fn send(&self, request: &Request) -> Result<RawResponse, TransportError> {
        let url = request.url().as_str();
        let client = self.client_for(&ClientKey::for_request(request), url)?;

        let response = Self::build_request(&client, request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status().as_u16();
        let final_url: Url = response.url().clone();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(url, e))?
            .to_vec();

        debug!(status, bytes = body.len(), final_url = %final_url, "response received");
        Ok(RawResponse {
            url: final_url,
            status,
            headers,
            body,
        })
    }

    async fn close(&self) {
        self.clients.clear();
    }
}

/// Classifies a reqwest failure.
fn map_reqwest_error(url: &str, error: reqwest::Error) -> TransportError {
    let message = error.to_string();
    let mapped = if error.is_timeout() {
        TransportError::timeout(url, message)
    } else if error.is_builder() {
        TransportError::invalid_request(url, message)
    } else if error.is_connect() || error.is_request() {
        TransportError::connection(url, message)
    } else if error.is_body() || error.is_decode() || error.is_redirect() || error.is_status() {
        TransportError::response(url, message)
    } else {
        TransportError::new(TransportErrorKind::Other, url, message)
    };
    mapped.with_source(error)
}

// Some platforms panic inside reqwest's system proxy discovery. The panic is
// caught and the build retried without system proxies; the hook is silenced
// meanwhile so the recovery does not print a backtrace.
static CLIENT_BUILD_PANIC_HOOK_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn try_build<F>(configure: F) -> Result<Result<Client, TransportError>, ()>
where
    F: FnOnce() -> Result<ClientBuilder, TransportError>,
{
    let _guard = CLIENT_BUILD_PANIC_HOOK_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let previous_hook = take_hook();
    set_hook(Box::new(|_| {}));
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        configure()?.build().map_err(|e| {
            TransportError::invalid_request("", "failed to build HTTP client").with_source(e)
        })
    }));
    set_hook(previous_hook);
    outcome.map_err(|_| ())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reqwest::header::USER_AGENT;

    use super::*;

    #[test]
    fn test_new_builds_default_client() {
        let transport = ReqwestTransport::new(SessionConfig::default()).unwrap();
        assert_eq!(transport.clients.len(), 1);
        assert!(transport.cookie_jar().is_some());
    }

    #[test]
    fn test_cookie_store_disabled_has_no_jar() {
        let transport =
            ReqwestTransport::new(SessionConfig::default().with_cookie_store(false)).unwrap();
        assert!(transport.cookie_jar().is_none());
    }

    #[test]
    fn test_client_cache_keys_on_proxy_and_tls() {
        let transport = ReqwestTransport::new(SessionConfig::default()).unwrap();
        let plain = Request::new("https://example.com/").unwrap();
        let proxied = plain.clone().with_proxy("http://127.0.0.1:3128");
        let insecure = plain.clone().with_verify_tls(false);

        for request in [&plain, &proxied, &insecure, &plain] {
            transport
                .client_for(&ClientKey::for_request(request), request.url().as_str())
                .unwrap();
        }
        assert_eq!(transport.clients.len(), 3);
    }

    #[test]
    fn test_client_cache_keys_on_every_proxy_header() {
        let transport = ReqwestTransport::new(SessionConfig::default()).unwrap();
        let base = Request::new("https://example.com/")
            .unwrap()
            .with_proxy("http://127.0.0.1:3128");
        let mut tagged = base.clone();
        tagged
            .proxy_headers_mut()
            .insert("x-proxy-token", HeaderValue::from_static("a"));
        let mut retagged = base.clone();
        retagged
            .proxy_headers_mut()
            .insert("x-proxy-token", HeaderValue::from_static("b"));

        for request in [&base, &tagged, &retagged, &tagged] {
            transport
                .client_for(&ClientKey::for_request(request), request.url().as_str())
                .unwrap();
        }
        // default client plus one per distinct proxy header set
        assert_eq!(transport.clients.len(), 4);
        assert_eq!(
            ClientKey::for_request(&tagged).proxy_headers,
            vec![("x-proxy-token".to_string(), b"a".to_vec())]
        );
    }

    #[test]
    fn test_invalid_proxy_is_invalid_request() {
        let transport = ReqwestTransport::new(SessionConfig::default()).unwrap();
        let request = Request::new("https://example.com/")
            .unwrap()
            .with_proxy("http://[::1");
        let error = transport
            .client_for(&ClientKey::for_request(&request), request.url().as_str())
            .unwrap_err();
        assert_eq!(error.kind(), TransportErrorKind::InvalidRequest);
    }

    #[test]
    fn test_build_request_appends_params_and_overrides_headers() {
        let transport = ReqwestTransport::new(SessionConfig::default()).unwrap();
        let request = Request::new("https://example.com/search?x=1")
            .unwrap()
            .with_param("q", "rust lang")
            .with_header(USER_AGENT, HeaderValue::from_static("custom/1"))
            .with_cookie("sid", "abc")
            .with_form([("a", "1")]);
        let client = transport
            .client_for(&ClientKey::for_request(&request), "")
            .unwrap();

        let built = ReqwestTransport::build_request(&client, &request).build().unwrap();

        assert_eq!(built.url().as_str(), "https://example.com/search?x=1&q=rust+lang");
        assert_eq!(built.headers().get(USER_AGENT).unwrap(), "custom/1");
        assert_eq!(built.headers().get(COOKIE).unwrap(), "sid=abc");
        assert_eq!(
            built.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert_eq!(built.body().unwrap().as_bytes().unwrap(), b"a=1");
    }

    #[tokio::test]
    async fn test_close_clears_client_cache() {
        let transport = ReqwestTransport::new(SessionConfig::default()).unwrap();
        transport.close().await;
        assert!(transport.clients.is_empty());
    }
}
