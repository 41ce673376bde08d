//! Typed configuration.
//!
//! Process settings and coordination tunables come from environment
//! variables, loaded once at startup; invalid values fail fast. The
//! executor and context backend are described by a TOML file. Sensitive
//! values are wrapped in secrecy::SecretString to prevent log leaks.

pub mod secrets;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::context::GitContextConfig;
use crate::error::{Error, Result};
use crate::executor::HookConfig;
use crate::model::WorkerId;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub worker_id: WorkerId,
    pub worker: WorkerConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let worker = WorkerConfig::from_env()?;
        worker.validate()?;
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            worker_id: std::env::var("WORKER_ID")
                .map(WorkerId::new)
                .unwrap_or_else(|_| WorkerId::generate()),
            worker,
        })
    }
}

/// Coordination tunables for one worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Claim lease duration `L`.
    pub lease: Duration,
    /// Lease renewal interval while owned. Must be below `L/2`.
    pub heartbeat_interval: Duration,
    /// Grace period `G` an interrupted executor gets before a hard cancel.
    pub interrupt_grace: Duration,
    /// Inactivity after which an owned workstream is released.
    pub idle_timeout: Duration,
    /// Workstreams one worker may own at once.
    pub max_concurrent_claims: usize,
    /// Long-poll wait on the claim offer queue.
    pub offer_poll_wait: Duration,
    /// Long-poll wait on a workstream queue.
    pub queue_poll_wait: Duration,
    /// How long a read message stays hidden before redelivery.
    pub visibility_timeout: Duration,
    /// How often lapsed leases are swept and their workstreams re-offered.
    pub sweep_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let lease = Duration::from_secs(300);
        Self {
            lease,
            heartbeat_interval: lease / 3,
            interrupt_grace: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(25 * 60),
            max_concurrent_claims: 1,
            offer_poll_wait: Duration::from_secs(10),
            queue_poll_wait: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Defaults overridden by any `*_SECS` / `MAX_CONCURRENT_CLAIMS` vars set.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let lease = secs_var("CLAIM_LEASE_SECS")?.unwrap_or(defaults.lease);
        Ok(Self {
            lease,
            heartbeat_interval: secs_var("HEARTBEAT_INTERVAL_SECS")?.unwrap_or(lease / 3),
            interrupt_grace: secs_var("INTERRUPT_GRACE_SECS")?.unwrap_or(defaults.interrupt_grace),
            idle_timeout: secs_var("IDLE_TIMEOUT_SECS")?.unwrap_or(defaults.idle_timeout),
            max_concurrent_claims: parsed_var("MAX_CONCURRENT_CLAIMS")?
                .unwrap_or(defaults.max_concurrent_claims),
            offer_poll_wait: secs_var("OFFER_POLL_SECS")?.unwrap_or(defaults.offer_poll_wait),
            queue_poll_wait: secs_var("QUEUE_POLL_SECS")?.unwrap_or(defaults.queue_poll_wait),
            visibility_timeout: secs_var("VISIBILITY_TIMEOUT_SECS")?
                .unwrap_or(defaults.visibility_timeout),
            sweep_interval: secs_var("LEASE_SWEEP_SECS")?.unwrap_or(defaults.sweep_interval),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease.is_zero() {
            return Err(Error::Config("claim lease must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.lease / 2 {
            return Err(Error::Config(format!(
                "heartbeat interval {:?} must be positive and below half the lease {:?}",
                self.heartbeat_interval, self.lease
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::Config("idle timeout must be positive".into()));
        }
        if self.max_concurrent_claims == 0 {
            return Err(Error::Config("max concurrent claims must be at least 1".into()));
        }
        if self.offer_poll_wait.is_zero() || self.queue_poll_wait.is_zero() {
            return Err(Error::Config("poll waits must be positive".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config("lease sweep interval must be positive".into()));
        }
        if self.visibility_timeout <= self.interrupt_grace {
            return Err(Error::Config(
                "visibility timeout must exceed the interrupt grace period".into(),
            ));
        }
        Ok(())
    }
}

/// Executor TOML file: an `[executor]` hook and an optional git `[context]`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorFile {
    pub executor: HookConfig,
    pub context: Option<GitContextConfig>,
}

impl ExecutorFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read executor config {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad executor config {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

fn secs_var(name: &str) -> Result<Option<Duration>> {
    Ok(parsed_var::<u64>(name)?.map(Duration::from_secs))
}
