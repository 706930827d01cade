//! Proxy rotation.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::debug;

use super::{Action, HookContext, Middleware};
use crate::error::DispatchError;
use crate::proxy::ProxyPool;
use crate::request::Request;

/// Routes requests without a proxy through a proxy drawn from a random pool.
///
/// The pool's credentials and proxy headers travel with the drawn proxy.
#[derive(Debug, Clone)]
pub struct RotatingProxy {
    pools: Vec<Arc<ProxyPool>>,
}

impl RotatingProxy {
    /// Creates a rotator over `pools`.
    pub fn new(pools: impl IntoIterator<Item = ProxyPool>) -> Self {
        Self::shared(pools.into_iter().map(Arc::new))
    }

    /// Creates a rotator over pools shared with other owners.
    pub fn shared(pools: impl IntoIterator<Item = Arc<ProxyPool>>) -> Self {
        Self {
            pools: pools.into_iter().collect(),
        }
    }

    /// Returns the pools.
    #[must_use]
    pub fn pools(&self) -> &[Arc<ProxyPool>] {
        &self.pools
    }
}

#[async_trait]
impl Middleware for RotatingProxy {
    fn name(&self) -> &str {
        "rotating_proxy"
    }

    async fn process_request(
        &self,
        request: &mut Request,
        _ctx: HookContext<'_>,
    ) -> Result<Action, DispatchError> {
        if request.proxy().is_some() {
            return Ok(Action::Continue);
        }
        let pool = self.pools.choose(&mut rand::thread_rng()).map(Arc::clone);
        let Some(pool) = pool else {
            return Ok(Action::Continue);
        };
        let Some(proxy) = pool.draw() else {
            return Ok(Action::Continue);
        };

        debug!(proxy = %proxy, url = %request.url(), "assigned proxy");
        request.set_proxy(Some(proxy));
        request.set_proxy_auth(pool.auth().cloned());
        for (name, value) in pool.headers() {
            request.proxy_headers_mut().insert(name.clone(), value.clone());
        }
        Ok(Action::Continue)
    }
}
