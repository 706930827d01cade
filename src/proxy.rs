//! Shuffled proxy selection.
//!
//! A [`ProxyPool`] hands out proxies from a shuffled copy of its source
//! list, one per draw, and reshuffles a fresh copy once every proxy has been
//! handed out. No proxy repeats within one shuffle cycle.

use std::sync::{Mutex, PoisonError};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use reqwest::header::HeaderMap;

use crate::request::BasicAuth;

#[derive(Debug)]
struct DrawState {
    buffer: Vec<String>,
    rng: StdRng,
    refills: u64,
}

/// A list of proxies sharing credentials and proxy headers.
///
/// # Example
///
/// ```
/// use requestr::ProxyPool;
///
/// let pool = ProxyPool::new(["http://10.0.0.1:3128", "http://10.0.0.2:3128"]);
/// let first = pool.draw().unwrap();
/// let second = pool.draw().unwrap();
/// assert_ne!(first, second);
/// ```
#[derive(Debug)]
pub struct ProxyPool {
    proxies: Vec<String>,
    auth: Option<BasicAuth>,
    headers: HeaderMap,
    state: Mutex<DrawState>,
}

impl ProxyPool {
    /// Creates a pool drawing from `proxies`.
    pub fn new<I, S>(proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_rng(proxies, StdRng::from_entropy())
    }

    /// Creates a pool with a deterministic shuffle order.
    pub fn with_seed<I, S>(proxies: I, seed: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_rng(proxies, StdRng::seed_from_u64(seed))
    }

    fn with_rng<I, S>(proxies: I, rng: StdRng) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            proxies: proxies.into_iter().map(Into::into).collect(),
            auth: None,
            headers: HeaderMap::new(),
            state: Mutex::new(DrawState {
                buffer: Vec::new(),
                rng,
                refills: 0,
            }),
        }
    }

    /// Sets credentials attached to every proxy of the pool.
    #[must_use]
    pub fn with_auth(mut self, auth: BasicAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sets headers sent to every proxy of the pool.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Returns the source list.
    #[must_use]
    pub fn proxies(&self) -> &[String] {
        &self.proxies
    }

    /// Returns the pool credentials.
    #[must_use]
    pub fn auth(&self) -> Option<&BasicAuth> {
        self.auth.as_ref()
    }

    /// Returns the pool proxy headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Removes and returns the next proxy, reshuffling when exhausted.
    ///
    /// Returns `None` only for an empty pool.
    #[must_use]
    pub fn draw(&self) -> Option<String> {
        if self.proxies.is_empty() {
            return None;
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.buffer.is_empty() {
            let DrawState {
                buffer,
                rng,
                refills,
            } = &mut *state;
            buffer.clone_from(&self.proxies);
            buffer.shuffle(rng);
            *refills += 1;
        }
        state.buffer.pop()
    }

    /// Returns how many times the draw buffer was (re)filled.
    #[must_use]
    pub fn refills(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).refills
    }

    /// Returns the number of proxies left before the next reshuffle.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .buffer
            .len()
    }
}
