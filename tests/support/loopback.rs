//! Loopback helpers for tests that talk to local wiremock servers.
//!
//! Sandboxed CI runners sometimes forbid binding 127.0.0.1. Tests ask here
//! first and return early when the loopback interface is unusable, unless
//! `REQUESTR_STRICT_LOOPBACK` is set, in which case they fail loudly.

use std::future::Future;
use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const STRICT_ENV: &str = "REQUESTR_STRICT_LOOPBACK";

fn strict() -> bool {
    std::env::var(STRICT_ENV).is_ok_and(|value| {
        matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

/// Binds an ephemeral loopback port and returns it once released.
fn ephemeral_port() -> Option<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").ok()?;
    listener.local_addr().ok().map(|addr| addr.port())
}

/// Returns true when the calling test should bail out for lack of loopback.
#[track_caller]
#[must_use]
pub fn loopback_unavailable() -> bool {
    if ephemeral_port().is_some() {
        return false;
    }
    let caller = Location::caller();
    assert!(
        !strict(),
        "{}:{} needs a loopback socket but binding 127.0.0.1 failed ({STRICT_ENV} is set)",
        caller.file(),
        caller.line()
    );
    eprintln!(
        "skipping {}:{}: cannot bind 127.0.0.1 (set {STRICT_ENV}=1 to make this an error)",
        caller.file(),
        caller.line()
    );
    true
}

/// Starts a wiremock server, or yields `None` without loopback.
///
/// Not an `async fn` so `#[track_caller]` still reports the test's location.
#[track_caller]
pub fn mock_server() -> impl Future<Output = Option<MockServer>> {
    let unavailable = loopback_unavailable();
    async move {
        if unavailable {
            None
        } else {
            Some(MockServer::start().await)
        }
    }
}

/// Returns a loopback URL nothing listens on, or `None` without loopback.
#[track_caller]
#[must_use]
pub fn refused_url() -> Option<String> {
    if loopback_unavailable() {
        return None;
    }
    ephemeral_port().map(|port| format!("http://127.0.0.1:{port}/"))
}
