//! Default tuning values for sessions, rate limiting and dispatch.

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default number of operations admitted per rate-limit period.
pub const DEFAULT_RATE_LIMIT: usize = 120;

/// Default rate-limit period.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// Default interval between rate-limit re-checks while a caller waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default ceiling on middleware rewrites within one `send`.
pub const DEFAULT_REWRITE_LIMIT: usize = 10;

/// Warning threshold for cumulative rate limit delay per session (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);
