//! Postgres + pgmq backends for every store seam.
//!
//! One shared connection pool. Ownership lives in the `ownership` table and
//! is only ever mutated by single conditional statements evaluated against
//! the database clock. Claim offers ride the `claim_offers` pgmq queue; each
//! workstream gets its own pgmq queue named by [`WorkstreamKey::queue_handle`].
//! Every trait call goes through the client-level [`RetryPolicy`].
//!
//! [`WorkstreamKey::queue_handle`]: crate::model::WorkstreamKey::queue_handle

pub mod messages;
pub mod ownership;
pub mod pgmq;
pub mod results;
pub mod threads;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Error, Result};
use crate::retry::{HealthSignal, RetryPolicy};

/// Name of the pgmq queue carrying claim offers.
pub const OFFER_QUEUE: &str = "claim_offers";

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
    retry: RetryPolicy,
    visibility_timeout: Duration,
    created_queues: Mutex<HashSet<String>>,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
            visibility_timeout: Duration::from_secs(300),
            created_queues: Mutex::new(HashSet::new()),
        }
    }

    /// How long a read offer or message stays hidden before redelivery.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Sustained-unavailability signal shared by every retried call.
    pub fn health(&self) -> Arc<HealthSignal> {
        self.retry.health()
    }
}

/// pgmq takes whole seconds; round sub-second waits up so a short wait
/// still polls.
fn whole_secs(duration: Duration) -> i32 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}
