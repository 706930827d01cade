//! Dispatcher statistics.
//!
//! A concurrent map from string key to numeric accumulator. Counters and
//! durations only ever grow; the lifecycle timestamps ([`OPEN`], [`CLOSE`])
//! are the only values that get overwritten.

use std::collections::BTreeMap;

use dashmap::DashMap;

/// External `send` calls.
pub const REQ_SCHEDULED: &str = "req/scheduled";
/// Transport attempts.
pub const REQ_SENT: &str = "req/sent";
/// Retries issued by retry middleware.
pub const REQ_RETRY: &str = "req/retry";
/// Seconds slept by retry middleware.
pub const SLEEP_ELAPSED: &str = "sleep/elapsed";
/// Sessions created.
pub const SESSION_NEW: &str = "session/new";
/// Request hook returned a replacement request.
pub const REQMID_RETURN_REQ: &str = "reqmid/return/req";
/// Request hook returned a response.
pub const REQMID_RETURN_RESP: &str = "reqmid/return/resp";
/// Exception hook returned a replacement request.
pub const RESPMID_EXC_REQ: &str = "respmid/exc/req";
/// Exception hook returned a response.
pub const RESPMID_EXC_RESP: &str = "respmid/exc/resp";
/// Response hook returned a replacement request.
pub const RESPMID_RETURN_REQ: &str = "respmid/return/req";
/// Response hook returned a replacement response.
pub const RESPMID_RETURN_RESP: &str = "respmid/return/resp";
/// Unix timestamp (seconds) of the last `open`.
pub const OPEN: &str = "open";
/// Unix timestamp (seconds) of the last `close`.
pub const CLOSE: &str = "close";
/// Seconds between `open` and `close`.
pub const ELAPSED: &str = "elapsed";

/// Statistics shared by every dispatch path of one dispatcher.
///
/// Uses `DashMap` so concurrent sends can update counters without a global lock.
#[derive(Debug, Default)]
pub struct Stats {
    values: DashMap<String, f64>,
}

impl Stats {
    /// Creates an empty statistics map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments `key` by one.
    pub fn incr(&self, key: &str) {
        self.add(key, 1.0);
    }

    /// Adds `amount` to `key`, creating it at zero if absent.
    pub fn add(&self, key: &str, amount: f64) {
        *self.values.entry(key.to_string()).or_insert(0.0) += amount;
    }

    /// Overwrites `key`.
    pub fn set(&self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }

    /// Returns the value of `key`, zero if it was never touched.
    #[must_use]
    pub fn get(&self, key: &str) -> f64 {
        self.values.get(key).map_or(0.0, |value| *value)
    }

    /// Returns `key` as a whole count.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn count(&self, key: &str) -> u64 {
        self.get(key).max(0.0) as u64
    }

    /// Returns true if `key` has been recorded.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Returns a sorted point-in-time copy of every value.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Returns the number of recorded keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
