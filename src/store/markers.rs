//! Dispatch markers: the last bucket dispatched per (database, tier).
//!
//! The scheduler may tick far more often than a tier's granularity, and
//! overlapping ticks can race. The marker advance is a conditional write,
//! so exactly one evaluation window wins a given bucket.

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::db::DbPool;
use crate::error::Result;
use crate::policy::Tier;

/// Advance the marker to `bucket_key` if it is not already there.
///
/// Returns true when this call won the bucket and the caller should
/// dispatch; false when another evaluation already did.
pub async fn try_advance(
    pool: &DbPool,
    database_id: &str,
    tier: Tier,
    bucket_key: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let outcome = sqlx::query(
        r#"
        INSERT INTO dispatch_markers (database_id, tier, bucket_key, marked_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT (database_id, tier)
        DO UPDATE SET bucket_key = excluded.bucket_key, marked_at = excluded.marked_at
        WHERE dispatch_markers.bucket_key <> excluded.bucket_key
        "#,
    )
    .bind(database_id)
    .bind(tier.as_str())
    .bind(bucket_key)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(outcome.rows_affected() == 1)
}

/// Roll the marker back after a dispatch that could not be enqueued, so the
/// next tick re-evaluates the bucket. Conditional on the marker still
/// holding the bucket this evaluation wrote.
pub async fn retract(
    pool: &DbPool,
    database_id: &str,
    tier: Tier,
    bucket_key: &str,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM dispatch_markers WHERE database_id = ? AND tier = ? AND bucket_key = ?",
    )
    .bind(database_id)
    .bind(tier.as_str())
    .bind(bucket_key)
    .execute(pool)
    .await?;
    Ok(())
}

/// Current marker bucket for (database, tier), if any.
pub async fn current(pool: &DbPool, database_id: &str, tier: Tier) -> Result<Option<String>> {
    let row = sqlx::query(
        "SELECT bucket_key FROM dispatch_markers WHERE database_id = ? AND tier = ?",
    )
    .bind(database_id)
    .bind(tier.as_str())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => Ok(Some(row.try_get("bucket_key")?)),
        None => Ok(None),
    }
}
