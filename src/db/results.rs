//! Recorded dispatch results.

use async_trait::async_trait;

use super::Db;
use crate::error::Result;
use crate::model::{WorkerId, WorkstreamKey};
use crate::store::{ResultRecord, ResultSink};

type ResultRow = (
    String,
    String,
    String,
    String,
    bool,
    String,
    bool,
    Option<String>,
    i64,
    chrono::DateTime<chrono::Utc>,
);

impl Db {
    async fn deliver_once(&self, record: &ResultRecord) -> Result<()> {
        // A message redelivered after a lease loss may be handled twice;
        // the later outcome wins.
        sqlx::query(
            "INSERT INTO workstream_results
                (workstream_key, message_id, thread_id, worker_id, success, result_summary,
                 committed, continuation_token, duration_ms, recorded_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (workstream_key, message_id) DO UPDATE
                SET thread_id = EXCLUDED.thread_id,
                    worker_id = EXCLUDED.worker_id,
                    success = EXCLUDED.success,
                    result_summary = EXCLUDED.result_summary,
                    committed = EXCLUDED.committed,
                    continuation_token = EXCLUDED.continuation_token,
                    duration_ms = EXCLUDED.duration_ms,
                    recorded_at = EXCLUDED.recorded_at",
        )
        .bind(record.workstream_key.to_string())
        .bind(&record.message_id)
        .bind(&record.thread_id)
        .bind(record.worker_id.as_str())
        .bind(record.success)
        .bind(&record.result_summary)
        .bind(record.committed)
        .bind(&record.continuation_token)
        .bind(i64::try_from(record.duration_ms).unwrap_or(i64::MAX))
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent results for a workstream, newest first.
    pub async fn recent_results(&self, key: &WorkstreamKey, limit: i64) -> Result<Vec<ResultRecord>> {
        let rows: Vec<ResultRow> = sqlx::query_as(
            "SELECT workstream_key, message_id, thread_id, worker_id, success, result_summary,
                    committed, continuation_token, duration_ms, recorded_at
             FROM workstream_results WHERE workstream_key = $1
             ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(key.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(
                |(key, message_id, thread_id, worker_id, success, summary, committed, token, ms, at)| {
                    Ok(ResultRecord {
                        message_id,
                        workstream_key: key.parse()?,
                        thread_id,
                        worker_id: WorkerId(worker_id),
                        success,
                        result_summary: summary,
                        committed,
                        continuation_token: token,
                        duration_ms: u64::try_from(ms).unwrap_or(0),
                        recorded_at: at,
                    })
                },
            )
            .collect()
    }
}

#[async_trait]
impl ResultSink for Db {
    async fn deliver(&self, record: &ResultRecord) -> Result<()> {
        self.retry
            .run("results.deliver", || self.deliver_once(record))
            .await
    }
}
