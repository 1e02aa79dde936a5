//! Test helper utilities and common testing patterns

use std::time::Duration;

use funchost_domain::ScriptEvent;
use funchost_infrastructure::Subscription;
use tokio::time::{sleep, Instant};

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    ///
    /// Works under paused tokio time as well, since it sleeps on the tokio clock.
    pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    /// Collect every event delivered to `subscription` until it stays quiet for `quiet`.
    pub async fn drain(subscription: &mut Subscription, quiet: Duration) -> Vec<ScriptEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(quiet, subscription.recv()).await {
            events.push(event);
        }
        events
    }
}
