//! Backup result lifecycle and the last-success projection.
//!
//! A result is created `pending` when a dispatch request starts executing,
//! moves to `in_progress`, and ends in exactly one of the terminal states
//! `completed` or `failed`. Terminal rows are never mutated afterwards.
//!
//! Rather than scanning history, "last successful backup per (database,
//! tier)" is a projection table updated in the same transaction that marks
//! a result completed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use crate::db::DbPool;
use crate::error::{Error, Result};
use crate::policy::Tier;
use crate::queue::TriggeredBy;

/// Stored error messages are truncated to this many bytes.
pub const MAX_ERROR_LEN: usize = 2048;

/// Lifecycle state of a backup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::InProgress => "in_progress",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "in_progress" => Ok(BackupStatus::InProgress),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(Error::Db(sqlx::Error::Decode(
                format!("unknown backup status: {}", other).into(),
            ))),
        }
    }
}

/// One backup attempt's audit record.
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub id: String,
    pub database_id: String,
    pub tier: Tier,
    pub bucket_key: String,
    pub status: BackupStatus,
    pub artifact_key: Option<String>,
    pub size_bytes: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub triggered_by: TriggeredBy,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

fn result_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<BackupResult> {
    Ok(BackupResult {
        id: row.try_get("id")?,
        database_id: row.try_get("database_id")?,
        tier: row.try_get::<String, _>("tier")?.parse()?,
        bucket_key: row.try_get("bucket_key")?,
        status: BackupStatus::parse(&row.try_get::<String, _>("status")?)?,
        artifact_key: row.try_get("artifact_key")?,
        size_bytes: row.try_get("size_bytes")?,
        duration_ms: row.try_get("duration_ms")?,
        error_message: row.try_get("error_message")?,
        triggered_by: row.try_get::<String, _>("triggered_by")?.parse()?,
        created_at: row.try_get("created_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

const SELECT_COLUMNS: &str = "id, database_id, tier, bucket_key, status, artifact_key, \
     size_bytes, duration_ms, error_message, triggered_by, created_at, finished_at";

/// Open a `pending` result for (database, tier, bucket).
///
/// Returns false when a non-failed result already exists for that key: the
/// at-least-once queue redelivered work that is already done or underway.
/// The check is a conditional insert against the partial unique index, so
/// racing workers cannot both win.
pub async fn begin_result(
    pool: &DbPool,
    id: &str,
    database_id: &str,
    tier: Tier,
    bucket_key: &str,
    triggered_by: TriggeredBy,
    now: DateTime<Utc>,
) -> Result<bool> {
    let outcome = sqlx::query(
        r#"
        INSERT INTO backup_results (id, database_id, tier, bucket_key, status, triggered_by, created_at)
        VALUES (?, ?, ?, ?, 'pending', ?, ?)
        ON CONFLICT (database_id, tier, bucket_key) WHERE status <> 'failed'
        DO NOTHING
        "#,
    )
    .bind(id)
    .bind(database_id)
    .bind(tier.as_str())
    .bind(bucket_key)
    .bind(triggered_by.as_str())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(outcome.rows_affected() == 1)
}

pub async fn mark_in_progress(pool: &DbPool, id: &str) -> Result<()> {
    sqlx::query("UPDATE backup_results SET status = 'in_progress' WHERE id = ? AND status = 'pending'")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Mark a result completed and advance the last-success projection, in one
/// transaction.
pub async fn mark_completed(
    pool: &DbPool,
    id: &str,
    artifact_key: &str,
    size_bytes: i64,
    duration_ms: i64,
    finished_at: DateTime<Utc>,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        UPDATE backup_results
        SET status = 'completed', artifact_key = ?, size_bytes = ?, duration_ms = ?, finished_at = ?
        WHERE id = ? AND status IN ('pending', 'in_progress')
        RETURNING database_id, tier
        "#,
    )
    .bind(artifact_key)
    .bind(size_bytes)
    .bind(duration_ms)
    .bind(finished_at)
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        // Terminal rows are immutable; a completed/failed row stays as is.
        tx.rollback().await?;
        return Err(Error::NotFound(format!("open backup result {}", id)));
    };

    let database_id: String = row.try_get("database_id")?;
    let tier: String = row.try_get("tier")?;

    sqlx::query(
        r#"
        INSERT INTO last_success (database_id, tier, completed_at)
        VALUES (?, ?, ?)
        ON CONFLICT (database_id, tier)
        DO UPDATE SET completed_at = excluded.completed_at
        WHERE excluded.completed_at > last_success.completed_at
        "#,
    )
    .bind(&database_id)
    .bind(&tier)
    .bind(finished_at)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Mark a result failed with a truncated error message. No-op for rows
/// already in a terminal state.
pub async fn mark_failed(
    pool: &DbPool,
    id: &str,
    error: &str,
    finished_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE backup_results
        SET status = 'failed', error_message = ?, finished_at = ?
        WHERE id = ? AND status IN ('pending', 'in_progress')
        "#,
    )
    .bind(truncate_error(error))
    .bind(finished_at)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Guarantee a terminal row exists for (database, tier, bucket) before a
/// job is abandoned to the dead-letter set.
///
/// An open row is failed in place; a completed row is left alone; with no
/// row at all, a terminal failed row is inserted so the audit trail never
/// silently drops a dispatch.
pub async fn ensure_terminal_failed(
    pool: &DbPool,
    id: &str,
    database_id: &str,
    tier: Tier,
    bucket_key: &str,
    triggered_by: TriggeredBy,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let updated = sqlx::query(
        r#"
        UPDATE backup_results
        SET status = 'failed', error_message = ?, finished_at = ?
        WHERE database_id = ? AND tier = ? AND bucket_key = ?
          AND status IN ('pending', 'in_progress')
        "#,
    )
    .bind(truncate_error(error))
    .bind(now)
    .bind(database_id)
    .bind(tier.as_str())
    .bind(bucket_key)
    .execute(pool)
    .await?
    .rows_affected();

    if updated > 0 {
        return Ok(());
    }

    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS n FROM backup_results
        WHERE database_id = ? AND tier = ? AND bucket_key = ? AND status = 'completed'
        "#,
    )
    .bind(database_id)
    .bind(tier.as_str())
    .bind(bucket_key)
    .fetch_one(pool)
    .await?;
    let completed: i64 = row.try_get("n")?;
    if completed > 0 {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO backup_results
            (id, database_id, tier, bucket_key, status, error_message, triggered_by, created_at, finished_at)
        VALUES (?, ?, ?, ?, 'failed', ?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(database_id)
    .bind(tier.as_str())
    .bind(bucket_key)
    .bind(truncate_error(error))
    .bind(triggered_by.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

/// Timestamp of the last completed backup for (database, tier), from the
/// projection table.
pub async fn last_success(
    pool: &DbPool,
    database_id: &str,
    tier: Tier,
) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query(
        "SELECT completed_at FROM last_success WHERE database_id = ? AND tier = ?",
    )
    .bind(database_id)
    .bind(tier.as_str())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(row.try_get("completed_at")?)),
        None => Ok(None),
    }
}

pub async fn get_result(pool: &DbPool, id: &str) -> Result<Option<BackupResult>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM backup_results WHERE id = ?",
        SELECT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(result_from_row).transpose()
}

/// Completed results for (database, tier), newest first. Input to pruning.
pub async fn list_completed(
    pool: &DbPool,
    database_id: &str,
    tier: Tier,
) -> Result<Vec<BackupResult>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM backup_results
        WHERE database_id = ? AND tier = ? AND status = 'completed'
        ORDER BY created_at DESC, id DESC
        "#,
        SELECT_COLUMNS
    ))
    .bind(database_id)
    .bind(tier.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(result_from_row).collect()
}

pub async fn delete_result(pool: &DbPool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM backup_results WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Fail any pending/in_progress rows older than `cutoff`. The watchdog
/// sweep that keeps abandoned jobs from dangling forever.
pub async fn sweep_stuck(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<u64> {
    let outcome = sqlx::query(
        r#"
        UPDATE backup_results
        SET status = 'failed', error_message = 'abandoned: exceeded execution deadline', finished_at = ?
        WHERE status IN ('pending', 'in_progress') AND created_at < ?
        "#,
    )
    .bind(now)
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(outcome.rows_affected())
}

/// Filter for the reporting surface.
#[derive(Debug, Default, Clone)]
pub struct ResultFilter {
    pub database_id: Option<String>,
    pub tier: Option<Tier>,
    pub status: Option<BackupStatus>,
    pub limit: i64,
    pub offset: i64,
}

/// Paginated, filterable listing of results, newest first. Read-only.
pub async fn list_results(pool: &DbPool, filter: &ResultFilter) -> Result<Vec<BackupResult>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {} FROM backup_results
        WHERE (?1 IS NULL OR database_id = ?1)
          AND (?2 IS NULL OR tier = ?2)
          AND (?3 IS NULL OR status = ?3)
        ORDER BY created_at DESC, id DESC
        LIMIT ?4 OFFSET ?5
        "#,
        SELECT_COLUMNS
    ))
    .bind(&filter.database_id)
    .bind(filter.tier.map(|t| t.as_str()))
    .bind(filter.status.map(|s| s.as_str()))
    .bind(filter.limit)
    .bind(filter.offset)
    .fetch_all(pool)
    .await?;

    rows.iter().map(result_from_row).collect()
}

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, h, 0, 0).unwrap()
    }

    async fn open_result(pool: &DbPool, id: &str, bucket: &str, created: DateTime<Utc>) {
        let fresh = begin_result(
            pool,
            id,
            "db-1",
            Tier::Daily,
            bucket,
            TriggeredBy::Scheduler,
            created,
        )
        .await
        .unwrap();
        assert!(fresh);
    }

    #[tokio::test]
    async fn test_lifecycle_and_projection() {
        let pool = test_pool().await;
        open_result(&pool, "r1", "2025-06-10", at(2)).await;
        mark_in_progress(&pool, "r1").await.unwrap();
        mark_completed(&pool, "r1", "db/db-1/daily/x.sql.gz", 1024, 1500, at(3))
            .await
            .unwrap();

        let result = get_result(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(result.status, BackupStatus::Completed);
        assert_eq!(result.size_bytes, Some(1024));
        assert_eq!(result.artifact_key.as_deref(), Some("db/db-1/daily/x.sql.gz"));

        let last = last_success(&pool, "db-1", Tier::Daily).await.unwrap();
        assert_eq!(last, Some(at(3)));

        // The projection is per tier: no bleed into other tiers.
        assert!(last_success(&pool, "db-1", Tier::Monthly).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_begin_result_dedupes_non_failed_buckets() {
        let pool = test_pool().await;
        open_result(&pool, "r1", "2025-06-10", at(2)).await;

        // Same bucket, redelivered: rejected while the first row is open.
        let dup = begin_result(
            &pool,
            "r2",
            "db-1",
            Tier::Daily,
            "2025-06-10",
            TriggeredBy::Scheduler,
            at(2),
        )
        .await
        .unwrap();
        assert!(!dup);

        // A different bucket is unaffected.
        let next = begin_result(
            &pool,
            "r3",
            "db-1",
            Tier::Daily,
            "2025-06-11",
            TriggeredBy::Scheduler,
            at(4),
        )
        .await
        .unwrap();
        assert!(next);
    }

    #[tokio::test]
    async fn test_failed_bucket_can_be_retried() {
        let pool = test_pool().await;
        open_result(&pool, "r1", "2025-06-10", at(2)).await;
        mark_failed(&pool, "r1", "connection refused", at(2)).await.unwrap();

        let retry = begin_result(
            &pool,
            "r2",
            "db-1",
            Tier::Daily,
            "2025-06-10",
            TriggeredBy::Scheduler,
            at(3),
        )
        .await
        .unwrap();
        assert!(retry, "failed rows must not block a retry of the bucket");
    }

    #[tokio::test]
    async fn test_terminal_states_are_immutable() {
        let pool = test_pool().await;
        open_result(&pool, "r1", "2025-06-10", at(2)).await;
        mark_failed(&pool, "r1", "boom", at(2)).await.unwrap();

        // A second terminal transition must not rewrite the row.
        assert!(mark_completed(&pool, "r1", "k", 1, 1, at(3)).await.is_err());
        mark_failed(&pool, "r1", "other", at(4)).await.unwrap();

        let result = get_result(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(result.status, BackupStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("boom"));
        assert_eq!(result.finished_at, Some(at(2)));
    }

    #[tokio::test]
    async fn test_error_message_is_truncated() {
        let pool = test_pool().await;
        open_result(&pool, "r1", "2025-06-10", at(2)).await;

        let huge = "x".repeat(10 * MAX_ERROR_LEN);
        mark_failed(&pool, "r1", &huge, at(2)).await.unwrap();

        let result = get_result(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(result.error_message.unwrap().len(), MAX_ERROR_LEN);
    }

    #[tokio::test]
    async fn test_ensure_terminal_failed_inserts_when_missing() {
        let pool = test_pool().await;
        ensure_terminal_failed(
            &pool,
            "r9",
            "db-1",
            Tier::Hourly,
            "2025-06-10T04",
            TriggeredBy::Scheduler,
            "delivery attempts exhausted",
            at(5),
        )
        .await
        .unwrap();

        let result = get_result(&pool, "r9").await.unwrap().unwrap();
        assert_eq!(result.status, BackupStatus::Failed);
    }

    #[tokio::test]
    async fn test_ensure_terminal_failed_leaves_completed_alone() {
        let pool = test_pool().await;
        open_result(&pool, "r1", "2025-06-10", at(2)).await;
        mark_completed(&pool, "r1", "k", 10, 10, at(2)).await.unwrap();

        ensure_terminal_failed(
            &pool,
            "r2",
            "db-1",
            Tier::Daily,
            "2025-06-10",
            TriggeredBy::Scheduler,
            "late failure",
            at(5),
        )
        .await
        .unwrap();

        let result = get_result(&pool, "r1").await.unwrap().unwrap();
        assert_eq!(result.status, BackupStatus::Completed);
        assert!(get_result(&pool, "r2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_stuck_fails_old_open_rows() {
        let pool = test_pool().await;
        open_result(&pool, "r-old", "2025-06-09", at(1)).await;
        mark_in_progress(&pool, "r-old").await.unwrap();
        open_result(&pool, "r-new", "2025-06-10", at(11)).await;

        let swept = sweep_stuck(&pool, at(10), at(12)).await.unwrap();
        assert_eq!(swept, 1);

        assert_eq!(
            get_result(&pool, "r-old").await.unwrap().unwrap().status,
            BackupStatus::Failed
        );
        assert_eq!(
            get_result(&pool, "r-new").await.unwrap().unwrap().status,
            BackupStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_list_results_filters_and_pages() {
        let pool = test_pool().await;
        for (i, hour) in [2u32, 3, 4].iter().enumerate() {
            let id = format!("r{}", i);
            let bucket = format!("2025-06-1{}", i);
            open_result(&pool, &id, &bucket, at(*hour)).await;
        }
        mark_completed(&pool, "r0", "k0", 1, 1, at(5)).await.unwrap();

        let completed = list_results(
            &pool,
            &ResultFilter {
                database_id: Some("db-1".to_string()),
                status: Some(BackupStatus::Completed),
                limit: 10,
                offset: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, "r0");

        let page = list_results(
            &pool,
            &ResultFilter {
                limit: 2,
                offset: 0,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(page.len(), 2);
        // Newest first.
        assert_eq!(page[0].id, "r2");
    }
}
