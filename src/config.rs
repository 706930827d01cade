//! Dispatcher configuration and file loading.
//!
//! [`DispatcherConfig`] is the explicit configuration object handed to
//! [`Dispatcher::builder`](crate::Dispatcher::builder). [`FileConfig`] is its
//! on-disk form: a JSON object whose fields are all optional and fall back to
//! the defaults, with durations carried in the unit named by the field suffix.
//!
//! ```json
//! {
//!   "rewrite_limit": 10,
//!   "rate_limit": 60,
//!   "period_ms": 1000,
//!   "read_timeout_secs": 120,
//!   "headers": { "Accept-Language": "de-DE" }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::constants::DEFAULT_REWRITE_LIMIT;
use crate::request::parse_header;
use crate::session::SessionConfig;

/// Upper bound for `rewrite_limit`.
const MAX_REWRITE_LIMIT: usize = 1000;
/// Upper bound for `rate_limit`.
const MAX_RATE_LIMIT: usize = 10_000;
/// Accepted timeout range in seconds.
const TIMEOUT_RANGE_SECS: std::ops::RangeInclusive<u64> = 1..=3600;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// The file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`FileConfig`].
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// The file path.
        path: PathBuf,
        /// The underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    Invalid {
        /// Field name.
        field: &'static str,
        /// The rejected value.
        value: String,
        /// Accepted range.
        expected: &'static str,
    },

    /// A default header name or value is not valid HTTP.
    #[error("invalid default header `{name}`: {message}")]
    InvalidHeader {
        /// Header name as written.
        name: String,
        /// Why it was rejected.
        message: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> Self {
        Self::Invalid {
            field,
            value: value.to_string(),
            expected,
        }
    }
}

/// JSON-backed file configuration. Absent fields keep their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Middleware rewrite ceiling per send.
    pub rewrite_limit: Option<usize>,
    /// Operations per period for every session; 0 disables limiting.
    pub rate_limit: Option<usize>,
    /// Rate-limit window in milliseconds.
    pub period_ms: Option<u64>,
    /// Limiter re-check interval in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Total request timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Whether sessions keep a cookie jar.
    pub cookie_store: Option<bool>,
    /// Extra default headers merged over the built-in ones.
    pub headers: Option<BTreeMap<String, String>>,
}

impl FileConfig {
    /// Applies the values present in this file over `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidHeader`] for a malformed header.
    pub fn apply(&self, mut config: DispatcherConfig) -> Result<DispatcherConfig, ConfigError> {
        if let Some(rewrite_limit) = self.rewrite_limit {
            config.rewrite_limit = rewrite_limit;
        }
        let session = &mut config.session;
        if let Some(rate_limit) = self.rate_limit {
            session.rate_limit = rate_limit;
        }
        if let Some(period_ms) = self.period_ms {
            session.period = Duration::from_millis(period_ms);
        }
        if let Some(poll_ms) = self.poll_interval_ms {
            session.poll_interval = Duration::from_millis(poll_ms);
        }
        if let Some(secs) = self.connect_timeout_secs {
            session.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.read_timeout_secs {
            session.read_timeout = Duration::from_secs(secs);
        }
        if let Some(cookie_store) = self.cookie_store {
            session.cookie_store = cookie_store;
        }
        for (name, value) in self.headers.iter().flatten() {
            let (name, value) = parse_header(name, value).map_err(|e| ConfigError::InvalidHeader {
                name: name.clone(),
                message: e.to_string(),
            })?;
            session.headers.insert(name, value);
        }
        Ok(config)
    }
}

/// Explicit configuration for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How many middleware rewrites one send may perform.
    pub rewrite_limit: usize,
    /// Template for sessions created on demand.
    pub session: SessionConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            rewrite_limit: DEFAULT_REWRITE_LIMIT,
            session: SessionConfig::default(),
        }
    }
}

impl DispatcherConfig {
    /// Sets the rewrite ceiling.
    #[must_use]
    pub fn with_rewrite_limit(mut self, limit: usize) -> Self {
        self.rewrite_limit = limit;
        self
    }

    /// Sets the session template.
    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Loads a JSON config file over the defaults and validates the result.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if a
    /// resulting value is out of range.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let config = file.apply(Self::default())?;
        config.validate()?;
        debug!(path = %path.display(), "loaded dispatcher config");
        Ok(config)
    }

    /// Checks every value against its accepted range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_REWRITE_LIMIT).contains(&self.rewrite_limit) {
            return Err(ConfigError::invalid(
                "rewrite_limit",
                self.rewrite_limit,
                "1..=1000",
            ));
        }
        validate_session(&self.session)
    }

    /// Raises the rewrite ceiling above `retries`.
    ///
    /// The retry middlewares share one counter, so exhausting `retries`
    /// retries takes that many rewrites plus the giving-up pass. Below that
    /// ceiling exhaustion surfaces as
    /// [`DispatchError::TooManyRewrites`](crate::DispatchError::TooManyRewrites)
    /// instead of [`DispatchError::RequestFailed`](crate::DispatchError::RequestFailed).
    #[must_use]
    pub fn with_retry_headroom(mut self, retries: u32) -> Self {
        let needed = usize::try_from(retries).map_or(usize::MAX, |r| r.saturating_add(1));
        self.rewrite_limit = self.rewrite_limit.max(needed);
        self
    }
}

/// Checks a session template against the accepted ranges.
pub(crate) fn validate_session(session: &SessionConfig) -> Result<(), ConfigError> {
    if session.rate_limit > MAX_RATE_LIMIT {
        return Err(ConfigError::invalid(
            "rate_limit",
            session.rate_limit,
            "0..=10000",
        ));
    }
    if session.period.is_zero() {
        return Err(ConfigError::invalid("period_ms", 0, "1.."));
    }
    validate_timeout("connect_timeout_secs", session.connect_timeout)?;
    validate_timeout("read_timeout_secs", session.read_timeout)?;
    Ok(())
}

fn validate_timeout(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    let secs = value.as_secs();
    if value.subsec_nanos() != 0 || !TIMEOUT_RANGE_SECS.contains(&secs) {
        return Err(ConfigError::invalid(
            field,
            format!("{}s", value.as_secs_f64()),
            "1..=3600",
        ));
    }
    Ok(())
}
