//! Job queue contract and its durable SQLite implementation.
//!
//! Delivery is at-least-once: a received job becomes invisible for the
//! visibility timeout and reappears if it is not acked, with the delivery
//! attempt count incremented. Jobs past the attempt cap are moved to the
//! dead-letter set by the executor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::db::DbPool;
use crate::error::{Error, Result};
use crate::policy::Tier;

/// Who asked for a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggeredBy {
    Scheduler,
    Manual,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Scheduler => "scheduler",
            TriggeredBy::Manual => "manual",
        }
    }
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggeredBy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduler" => Ok(TriggeredBy::Scheduler),
            "manual" => Ok(TriggeredBy::Manual),
            other => Err(Error::Queue(format!("unknown trigger source: {}", other))),
        }
    }
}

/// One unit of backup work, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub database_id: String,
    pub tier: Tier,
    pub bucket_key: String,
    pub triggered_by: TriggeredBy,
    pub dispatch_time: DateTime<Utc>,
}

/// A claimed delivery: the request plus queue bookkeeping.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub attempt: u32,
    pub request: DispatchRequest,
}

/// At-least-once delivery channel between the scheduler and the workers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Make a request available for delivery.
    async fn enqueue(&self, request: &DispatchRequest) -> Result<()>;

    /// Claim the next visible job, if any. The claim holds for the
    /// visibility timeout; an unacked job is redelivered afterwards.
    async fn receive(&self, now: DateTime<Utc>) -> Result<Option<Delivery>>;

    /// Remove a delivered job from the queue.
    async fn ack(&self, delivery_id: i64) -> Result<()>;

    /// Park a job in the dead-letter set; it will not be redelivered.
    async fn dead_letter(&self, delivery_id: i64) -> Result<()>;
}

/// Durable queue backed by the state database.
pub struct SqliteQueue {
    pool: DbPool,
    visibility_timeout: Duration,
}

impl SqliteQueue {
    pub fn new(pool: DbPool, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    /// Number of dead-lettered jobs, for reporting.
    pub async fn dead_letter_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue_jobs WHERE dead = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[async_trait]
impl JobQueue for SqliteQueue {
    async fn enqueue(&self, request: &DispatchRequest) -> Result<()> {
        let payload = serde_json::to_string(request)?;
        sqlx::query(
            r#"
            INSERT INTO queue_jobs (payload, attempts, visible_at, dead, enqueued_at)
            VALUES (?, 0, ?, 0, ?)
            "#,
        )
        .bind(payload)
        .bind(request.dispatch_time)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receive(&self, now: DateTime<Utc>) -> Result<Option<Delivery>> {
        let invisible_until = now
            + chrono::Duration::from_std(self.visibility_timeout)
                .map_err(|e| Error::Queue(format!("visibility timeout out of range: {}", e)))?;

        // Claim and hide the oldest visible job in one statement, so
        // concurrent workers never claim the same delivery.
        let row = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET attempts = attempts + 1, visible_at = ?
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE dead = 0 AND visible_at <= ?
                ORDER BY id
                LIMIT 1
            )
            RETURNING id, payload, attempts
            "#,
        )
        .bind(invisible_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                let request: DispatchRequest = serde_json::from_str(&payload)?;
                Ok(Some(Delivery {
                    id: row.try_get("id")?,
                    attempt: row.try_get::<i64, _>("attempts")? as u32,
                    request,
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, delivery_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = ?")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, delivery_id: i64) -> Result<()> {
        sqlx::query("UPDATE queue_jobs SET dead = 1 WHERE id = ?")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
