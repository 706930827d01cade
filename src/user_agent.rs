//! Browser-like default headers applied by every new session.
//!
//! Single source for the default User-Agent so the session defaults and the
//! default header-injection middleware stay consistent.

use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};

/// Default browser User-Agent sent when neither the request nor a middleware sets one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/93.0.4577.82 Safari/537.36.";

const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,\
    image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9";

const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Returns the default headers every session starts with.
///
/// `Accept-Encoding` is left to the transport so it can decode what it advertises.
#[must_use]
pub fn default_session_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE),
    );
    headers
}
