//! Test doubles and fixtures shared by armada's integration tests,
//! benches and examples.

pub mod fixtures;
pub mod handler;
pub mod mock;

pub use fixtures::*;
pub use handler::{Attempt, ScriptedHandler};
pub use mock::{MockDeleter, MockExecutionPlane, MockItemExecutor};

use std::future::Future;
use std::time::Duration;

/// Polls `check` every 10ms until it returns true or `timeout` elapses.
/// Returns the last observed value.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
