//! Client-level retry with exponential backoff, plus a health signal for
//! sustained store/queue unavailability.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{error, warn};

use crate::error::Result;
use crate::telemetry::metrics;

/// Consecutive transient failures after which the backend is reported unhealthy.
const UNHEALTHY_AFTER: u64 = 5;

/// Tracks consecutive transient failures across all store calls.
#[derive(Debug, Default)]
pub struct HealthSignal {
    consecutive_failures: AtomicU64,
}

impl HealthSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) < UNHEALTHY_AFTER
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if previous >= UNHEALTHY_AFTER {
            warn!(previous_failures = previous, "store connectivity recovered");
        }
        metrics::store_consecutive_failures().record(0, &[]);
    }

    fn record_failure(&self) {
        let n = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::store_consecutive_failures().record(n, &[]);
        if n == UNHEALTHY_AFTER {
            error!(consecutive_failures = n, "store unavailable, reporting unhealthy");
        }
    }
}

/// Exponential backoff policy for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    health: Arc<HealthSignal>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            health: Arc::new(HealthSignal::new()),
        }
    }
}

impl RetryPolicy {
    /// No retries; each call is attempted exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn health(&self) -> Arc<HealthSignal> {
        Arc::clone(&self.health)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    /// Run `op`, retrying transient errors. Non-transient errors return at once.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    self.health.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_transient() => {
                    self.health.record_failure();
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient store error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
