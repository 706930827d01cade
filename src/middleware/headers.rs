//! Header injection.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderName, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use super::{Action, HookContext, Middleware};
use crate::error::DispatchError;
use crate::request::Request;

/// Sets `header` to a random configured value when the request lacks it.
///
/// Requests that already carry the header pass through untouched. Values that
/// are not valid HTTP header values are dropped at construction.
#[derive(Debug, Clone)]
pub struct RandomHeader {
    name: String,
    header: HeaderName,
    values: Vec<HeaderValue>,
}

impl RandomHeader {
    /// Creates a middleware choosing among `values` for `header`.
    pub fn new<I, S>(header: HeaderName, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let values: Vec<HeaderValue> = values
            .into_iter()
            .filter_map(|value| match HeaderValue::from_str(value.as_ref()) {
                Ok(valid) => Some(valid),
                Err(_) => {
                    warn!(header = %header, "skipping invalid header value");
                    None
                }
            })
            .collect();
        Self {
            name: format!("random_header({header})"),
            header,
            values,
        }
    }

    /// Creates a User-Agent rotator.
    pub fn user_agent<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut middleware = Self::new(USER_AGENT, agents);
        middleware.name = "random_user_agent".to_string();
        middleware
    }

    /// Returns the candidate values.
    #[must_use]
    pub fn values(&self) -> &[HeaderValue] {
        &self.values
    }
}

#[async_trait]
impl Middleware for RandomHeader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process_request(
        &self,
        request: &mut Request,
        _ctx: HookContext<'_>,
    ) -> Result<Action, DispatchError> {
        if request.headers().contains_key(&self.header) {
            return Ok(Action::Continue);
        }
        let chosen = self.values.choose(&mut rand::thread_rng()).cloned();
        if let Some(value) = chosen {
            debug!(header = %self.header, "injecting header");
            request.headers_mut().insert(self.header.clone(), value);
        }
        Ok(Action::Continue)
    }
}
