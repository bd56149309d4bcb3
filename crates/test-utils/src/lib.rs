//! Shared fixtures for the tickdag integration tests: graph and engine
//! builders, scripted task callables, and the tracing/timeout helpers below.

pub mod builders;
pub mod fake_task;

use std::future::Future;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// Upper bound for any single awaited step in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Route engine logs into the test harness's captured output.
///
/// Safe to call from every test; only the first call installs the
/// subscriber. `RUST_LOG` overrides the default `tickdag=info` filter, e.g.
/// `RUST_LOG=tickdag::store=debug`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tickdag=info,tickdag_test_utils=info"));

    // Err means another test already installed it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(true)
        .try_init();
}

/// Await `fut`, failing the test if it takes longer than `limit`.
pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(limit, fut).await {
        Ok(out) => out,
        Err(_) => panic!("test step did not finish within {limit:?}"),
    }
}

/// [`within`] the default [`TEST_TIMEOUT`].
pub async fn with_timeout<T>(fut: impl Future<Output = T>) -> T {
    within(TEST_TIMEOUT, fut).await
}
