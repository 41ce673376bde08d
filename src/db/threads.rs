//! Thread contexts and the active thread per workstream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Db;
use crate::error::Result;
use crate::model::{ThreadContext, WorkstreamKey};
use crate::store::ThreadStore;

#[derive(sqlx::FromRow)]
struct ThreadRow {
    workstream_key: String,
    thread_id: String,
    context_id: String,
    last_message_id: Option<String>,
    last_switched_at: DateTime<Utc>,
}

impl ThreadRow {
    fn try_into_context(self) -> Result<ThreadContext> {
        Ok(ThreadContext {
            thread_id: self.thread_id,
            workstream_key: self.workstream_key.parse()?,
            context_id: self.context_id,
            last_message_id: self.last_message_id,
            last_switched_at: self.last_switched_at,
        })
    }
}

impl Db {
    async fn get_thread_once(
        &self,
        key: &WorkstreamKey,
        thread_id: &str,
    ) -> Result<Option<ThreadContext>> {
        let row: Option<ThreadRow> = sqlx::query_as(
            "SELECT workstream_key, thread_id, context_id, last_message_id, last_switched_at
             FROM thread_contexts WHERE workstream_key = $1 AND thread_id = $2",
        )
        .bind(key.to_string())
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ThreadRow::try_into_context).transpose()
    }

    async fn active_thread_once(&self, key: &WorkstreamKey) -> Result<Option<ThreadContext>> {
        let row: Option<ThreadRow> = sqlx::query_as(
            "SELECT t.workstream_key, t.thread_id, t.context_id, t.last_message_id, t.last_switched_at
             FROM workstream_activity a
             JOIN thread_contexts t
               ON t.workstream_key = a.workstream_key AND t.thread_id = a.active_thread_id
             WHERE a.workstream_key = $1",
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(ThreadRow::try_into_context).transpose()
    }

    async fn record_switch_once(&self, context: &ThreadContext) -> Result<()> {
        let key = context.workstream_key.to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO thread_contexts (workstream_key, thread_id, context_id, last_message_id, last_switched_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (workstream_key, thread_id) DO UPDATE
                SET context_id = EXCLUDED.context_id,
                    last_message_id = COALESCE(EXCLUDED.last_message_id, thread_contexts.last_message_id),
                    last_switched_at = EXCLUDED.last_switched_at",
        )
        .bind(&key)
        .bind(&context.thread_id)
        .bind(&context.context_id)
        .bind(&context.last_message_id)
        .bind(context.last_switched_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO workstream_activity (workstream_key, active_thread_id, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (workstream_key) DO UPDATE
                SET active_thread_id = EXCLUDED.active_thread_id, updated_at = now()",
        )
        .bind(&key)
        .bind(&context.thread_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn touch_once(&self, key: &WorkstreamKey, thread_id: &str, message_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE thread_contexts SET last_message_id = $3
             WHERE workstream_key = $1 AND thread_id = $2",
        )
        .bind(key.to_string())
        .bind(thread_id)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ThreadStore for Db {
    async fn get_thread(
        &self,
        key: &WorkstreamKey,
        thread_id: &str,
    ) -> Result<Option<ThreadContext>> {
        self.retry
            .run("threads.get", || self.get_thread_once(key, thread_id))
            .await
    }

    async fn active_thread(&self, key: &WorkstreamKey) -> Result<Option<ThreadContext>> {
        self.retry
            .run("threads.active", || self.active_thread_once(key))
            .await
    }

    async fn record_switch(&self, context: &ThreadContext) -> Result<()> {
        self.retry
            .run("threads.record_switch", || self.record_switch_once(context))
            .await
    }

    async fn touch(&self, key: &WorkstreamKey, thread_id: &str, message_id: &str) -> Result<()> {
        self.retry
            .run("threads.touch", || self.touch_once(key, thread_id, message_id))
            .await
    }
}
