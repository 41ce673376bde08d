//! Conditional-write ownership records.
//!
//! Each transition is one SQL statement whose WHERE clause is the
//! condition, evaluated against the database clock:
//!
//! - claim: upsert that only overwrites a row whose lease has lapsed
//! - renew: update only while owned by the caller and unexpired
//! - release: delete only while owned by the caller
//! - reap: delete only once the lease has lapsed

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Db;
use crate::error::Result;
use crate::model::{ClaimOutcome, OwnershipRecord, WorkerId, WorkstreamKey};
use crate::store::OwnershipStore;

const RETURNING: &str =
    "RETURNING workstream_key, worker_id, claimed_at, last_activity_at, lease_expires_at";

#[derive(sqlx::FromRow)]
struct OwnershipRow {
    workstream_key: String,
    worker_id: String,
    claimed_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    lease_expires_at: DateTime<Utc>,
}

impl OwnershipRow {
    fn try_into_record(self) -> Result<OwnershipRecord> {
        Ok(OwnershipRecord {
            workstream_key: self.workstream_key.parse()?,
            worker_id: WorkerId(self.worker_id),
            claimed_at: self.claimed_at,
            last_activity_at: self.last_activity_at,
            lease_expires_at: self.lease_expires_at,
        })
    }
}

impl Db {
    async fn claim_once(
        &self,
        key: &WorkstreamKey,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimOutcome> {
        let sql = format!(
            "INSERT INTO ownership (workstream_key, worker_id, claimed_at, last_activity_at, lease_expires_at)
             VALUES ($1, $2, now(), now(), now() + make_interval(secs => $3))
             ON CONFLICT (workstream_key) DO UPDATE
                SET worker_id = EXCLUDED.worker_id,
                    claimed_at = EXCLUDED.claimed_at,
                    last_activity_at = EXCLUDED.last_activity_at,
                    lease_expires_at = EXCLUDED.lease_expires_at
                WHERE ownership.lease_expires_at < now()
             {RETURNING}"
        );
        let row: Option<OwnershipRow> = sqlx::query_as(&sql)
            .bind(key.to_string())
            .bind(worker_id.as_str())
            .bind(lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(ClaimOutcome::Claimed(row.try_into_record()?)),
            None => Ok(ClaimOutcome::AlreadyOwned),
        }
    }

    async fn renew_once(
        &self,
        key: &WorkstreamKey,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<Option<OwnershipRecord>> {
        let sql = format!(
            "UPDATE ownership
             SET last_activity_at = now(),
                 lease_expires_at = now() + make_interval(secs => $3)
             WHERE workstream_key = $1 AND worker_id = $2 AND lease_expires_at >= now()
             {RETURNING}"
        );
        let row: Option<OwnershipRow> = sqlx::query_as(&sql)
            .bind(key.to_string())
            .bind(worker_id.as_str())
            .bind(lease.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;
        row.map(OwnershipRow::try_into_record).transpose()
    }

    async fn release_once(&self, key: &WorkstreamKey, worker_id: &WorkerId) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM ownership WHERE workstream_key = $1 AND worker_id = $2")
            .bind(key.to_string())
            .bind(worker_id.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    async fn reap_once(&self, limit: usize) -> Result<Vec<WorkstreamKey>> {
        let keys: Vec<String> = sqlx::query_scalar(
            "DELETE FROM ownership
             WHERE workstream_key IN (
                 SELECT workstream_key FROM ownership
                 WHERE lease_expires_at < now()
                 ORDER BY lease_expires_at
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
             )
             AND lease_expires_at < now()
             RETURNING workstream_key",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        keys.iter().map(|key| key.parse::<WorkstreamKey>()).collect()
    }

    async fn get_once(&self, key: &WorkstreamKey) -> Result<Option<OwnershipRecord>> {
        let row: Option<OwnershipRow> = sqlx::query_as(
            "SELECT workstream_key, worker_id, claimed_at, last_activity_at, lease_expires_at
             FROM ownership WHERE workstream_key = $1",
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(OwnershipRow::try_into_record).transpose()
    }
}

#[async_trait]
impl OwnershipStore for Db {
    async fn try_claim(
        &self,
        key: &WorkstreamKey,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<ClaimOutcome> {
        self.retry
            .run("ownership.claim", || self.claim_once(key, worker_id, lease))
            .await
    }

    async fn renew(
        &self,
        key: &WorkstreamKey,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> Result<Option<OwnershipRecord>> {
        self.retry
            .run("ownership.renew", || self.renew_once(key, worker_id, lease))
            .await
    }

    async fn release(&self, key: &WorkstreamKey, worker_id: &WorkerId) -> Result<bool> {
        self.retry
            .run("ownership.release", || self.release_once(key, worker_id))
            .await
    }

    async fn get(&self, key: &WorkstreamKey) -> Result<Option<OwnershipRecord>> {
        self.retry.run("ownership.get", || self.get_once(key)).await
    }

    // Not retried: a retry after a lost response would find the rows gone.
    async fn reap_expired(&self, limit: usize) -> Result<Vec<WorkstreamKey>> {
        self.reap_once(limit).await
    }
}
