//! Leased ownership of a workstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::workstream::WorkstreamKey;

/// Identity of a worker process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh id of the form `worker-1a2b3c4d`.
    pub fn generate() -> Self {
        Self(format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who owns a workstream and until when.
///
/// At most one non-expired record exists per key. An expired record is
/// logically absent and any claimant may overwrite it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipRecord {
    pub workstream_key: WorkstreamKey,
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl OwnershipRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.lease_expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_owned_by(&self, worker_id: &WorkerId) -> bool {
        &self.worker_id == worker_id
    }

    /// Live and held by `worker_id`.
    pub fn is_held_by(&self, worker_id: &WorkerId, now: DateTime<Utc>) -> bool {
        self.is_owned_by(worker_id) && !self.is_expired_at(now)
    }
}

/// Result of an atomic claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The conditional create landed; the caller now owns the workstream.
    Claimed(OwnershipRecord),
    /// A live record already exists (or a concurrent claim won).
    AlreadyOwned,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}
