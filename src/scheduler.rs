//! Scheduler loop: evaluates every enabled database's tiers on a fixed
//! cadence and dispatches due work through the queue.
//!
//! The loop is a single logical evaluator per tick, but overlapping ticks
//! (redeploys, retries) are tolerated: the dispatch-marker conditional
//! write, not mutual exclusion, prevents duplicate dispatch.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn};

use crate::db::DbPool;
use crate::due;
use crate::error::Result;
use crate::policy::Tier;
use crate::queue::{DispatchRequest, JobQueue, TriggeredBy};
use crate::store::{catalog, markers, results};

const PAGE_SIZE: i64 = 100;

/// What one tick did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Enabled databases evaluated.
    pub databases: usize,
    /// Dispatch requests emitted.
    pub dispatched: usize,
    /// Due tiers skipped because their bucket was already marked.
    pub already_marked: usize,
    /// Databases or tiers that errored; retried on the next tick.
    pub errors: usize,
}

pub struct Scheduler {
    pool: DbPool,
    queue: Arc<dyn JobQueue>,
    enqueue_retries: u32,
}

impl Scheduler {
    pub fn new(pool: DbPool, queue: Arc<dyn JobQueue>, enqueue_retries: u32) -> Self {
        Self {
            pool,
            queue,
            enqueue_retries,
        }
    }

    /// Run one evaluation pass at `now`.
    ///
    /// Per-database failures are recorded and skipped; one broken policy
    /// never stops the rest of the fleet from being evaluated.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();
        let mut offset = 0;

        loop {
            let batch = match catalog::list_enabled_databases(&self.pool, PAGE_SIZE, offset).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("failed to list databases at offset {}: {}", offset, e);
                    summary.errors += 1;
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            offset += batch.len() as i64;

            for db in &batch {
                summary.databases += 1;
                if let Err(e) = self.evaluate_database(db, now, &mut summary).await {
                    summary.errors += 1;
                    warn!("skipping database {} this tick: {}", db.id, e);
                }
            }

            if (batch.len() as i64) < PAGE_SIZE {
                break;
            }
        }

        summary
    }

    async fn evaluate_database(
        &self,
        db: &catalog::DatabaseConfig,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let policy = catalog::resolve_policy(&self.pool, db).await?;

        for tier in Tier::ALL {
            let cfg = policy.tiers.get(tier);
            let last = results::last_success(&self.pool, &db.id, tier).await?;
            if !due::is_due(cfg, now, last) {
                continue;
            }

            let bucket = due::bucket_key(tier, now);
            if !markers::try_advance(&self.pool, &db.id, tier, &bucket, now).await? {
                // Another evaluation window already dispatched this bucket.
                summary.already_marked += 1;
                continue;
            }

            let request = DispatchRequest {
                database_id: db.id.clone(),
                tier,
                bucket_key: bucket.clone(),
                triggered_by: TriggeredBy::Scheduler,
                dispatch_time: now,
            };

            match self.enqueue_with_retry(&request).await {
                Ok(()) => {
                    info!("dispatched {} {} backup for bucket {}", db.id, tier, bucket);
                    summary.dispatched += 1;
                }
                Err(e) => {
                    // Give the bucket back so the next tick retries dispatch.
                    warn!(
                        "failed to enqueue {} {} backup for bucket {}: {}",
                        db.id, tier, bucket, e
                    );
                    if let Err(e) = markers::retract(&self.pool, &db.id, tier, &bucket).await {
                        warn!("failed to retract marker for {} {}: {}", db.id, tier, e);
                    }
                    summary.errors += 1;
                }
            }
        }

        Ok(())
    }

    /// Bounded retry for transient queue failures within a single tick.
    async fn enqueue_with_retry(&self, request: &DispatchRequest) -> Result<()> {
        let mut backoff = Duration::from_millis(100);
        let mut attempt = 0;
        loop {
            match self.queue.enqueue(request).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.enqueue_retries => {
                    attempt += 1;
                    warn!(
                        "enqueue attempt {} for {} {} failed: {}",
                        attempt, request.database_id, request.tier, e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Run the scheduler on a fixed cadence until the process exits.
pub async fn run(scheduler: Arc<Scheduler>, tick_interval: Duration) {
    let mut ticker = interval(tick_interval);
    loop {
        ticker.tick().await;
        let summary = scheduler.tick(Utc::now()).await;
        info!(
            "scheduler tick: {} databases, {} dispatched, {} already marked, {} errors",
            summary.databases, summary.dispatched, summary.already_marked, summary.errors
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::policy::{BackupPolicy, ScheduleRule, TierConfig, TierSet, TimeOfDay};
    use crate::queue::{MockJobQueue, SqliteQueue};
    use crate::store::catalog::test_fixtures::*;
    use chrono::TimeZone;

    fn daily_policy(id: &str, keep_count: u32) -> BackupPolicy {
        let mut tiers = TierSet::all_disabled();
        tiers.daily = TierConfig {
            enabled: true,
            keep_count,
            rule: ScheduleRule::Daily {
                time: TimeOfDay { hour: 2, minute: 0 },
            },
        };
        BackupPolicy {
            id: id.to_string(),
            name: "daily".to_string(),
            tiers,
        }
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, d, h, 0, 0).unwrap()
    }

    async fn scheduler_with_real_queue(pool: &DbPool) -> (Scheduler, Arc<SqliteQueue>) {
        let queue = Arc::new(SqliteQueue::new(pool.clone(), Duration::from_secs(60)));
        (Scheduler::new(pool.clone(), queue.clone(), 0), queue)
    }

    #[tokio::test]
    async fn test_due_tier_dispatches_exactly_once_per_bucket() {
        let pool = test_pool().await;
        insert_policy(&pool, &daily_policy("pol-1", 7)).await;
        insert_database(&pool, &simple_database("db-1", "pol-1")).await;

        let (scheduler, queue) = scheduler_with_real_queue(&pool).await;

        let summary = scheduler.tick(at(10, 2)).await;
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.errors, 0);

        // Second tick in the same bucket: marker makes it a no-op.
        let summary = scheduler.tick(at(10, 2)).await;
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.already_marked, 1);

        let delivery = queue.receive(Utc::now()).await.unwrap().unwrap();
        assert_eq!(delivery.request.database_id, "db-1");
        assert_eq!(delivery.request.tier, Tier::Daily);
        assert_eq!(delivery.request.bucket_key, "2025-06-10");
        assert_eq!(delivery.request.triggered_by, TriggeredBy::Scheduler);
        assert!(queue.receive(Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_bucket_fires_again() {
        let pool = test_pool().await;
        insert_policy(&pool, &daily_policy("pol-1", 7)).await;
        insert_database(&pool, &simple_database("db-1", "pol-1")).await;

        let (scheduler, _queue) = scheduler_with_real_queue(&pool).await;

        assert_eq!(scheduler.tick(at(10, 2)).await.dispatched, 1);
        assert_eq!(scheduler.tick(at(11, 2)).await.dispatched, 1);
    }

    #[tokio::test]
    async fn test_not_due_before_scheduled_time() {
        let pool = test_pool().await;
        insert_policy(&pool, &daily_policy("pol-1", 7)).await;
        insert_database(&pool, &simple_database("db-1", "pol-1")).await;

        let (scheduler, _queue) = scheduler_with_real_queue(&pool).await;

        let summary = scheduler.tick(at(10, 1)).await;
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.databases, 1);
    }

    #[tokio::test]
    async fn test_satisfied_bucket_is_not_redispatched_after_success() {
        let pool = test_pool().await;
        insert_policy(&pool, &daily_policy("pol-1", 7)).await;
        insert_database(&pool, &simple_database("db-1", "pol-1")).await;

        let (scheduler, _queue) = scheduler_with_real_queue(&pool).await;
        assert_eq!(scheduler.tick(at(10, 2)).await.dispatched, 1);

        // A success lands in the bucket; later ticks the same day stay quiet
        // without even touching the marker.
        assert!(
            results::begin_result(
                &pool, "r1", "db-1", Tier::Daily, "2025-06-10",
                TriggeredBy::Scheduler, at(10, 2)
            )
            .await
            .unwrap()
        );
        results::mark_completed(&pool, "r1", "k", 10, 10, at(10, 2)).await.unwrap();

        let summary = scheduler.tick(at(10, 14)).await;
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.already_marked, 0);
    }

    #[tokio::test]
    async fn test_broken_policy_does_not_abort_the_loop() {
        let pool = test_pool().await;
        insert_policy(&pool, &daily_policy("pol-1", 7)).await;

        // db-a references a policy that does not exist.
        let mut broken = simple_database("db-a", "pol-missing");
        broken.policy_id = Some("pol-missing".to_string());
        insert_database(&pool, &broken).await;
        insert_database(&pool, &simple_database("db-b", "pol-1")).await;

        let (scheduler, _queue) = scheduler_with_real_queue(&pool).await;

        let summary = scheduler.tick(at(10, 2)).await;
        assert_eq!(summary.databases, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.dispatched, 1);
    }

    #[tokio::test]
    async fn test_enqueue_failure_retracts_marker_for_next_tick() {
        let pool = test_pool().await;
        insert_policy(&pool, &daily_policy("pol-1", 7)).await;
        insert_database(&pool, &simple_database("db-1", "pol-1")).await;

        let mut queue = MockJobQueue::new();
        queue
            .expect_enqueue()
            .times(1)
            .returning(|_| Err(crate::error::Error::Queue("queue unavailable".to_string())));
        let scheduler = Scheduler::new(pool.clone(), Arc::new(queue), 0);

        let summary = scheduler.tick(at(10, 2)).await;
        assert_eq!(summary.dispatched, 0);
        assert_eq!(summary.errors, 1);

        // Marker was retracted, so the next tick dispatches successfully.
        let (scheduler, queue) = scheduler_with_real_queue(&pool).await;
        let summary = scheduler.tick(at(10, 3)).await;
        assert_eq!(summary.dispatched, 1);
        assert!(queue.receive(Utc::now()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_transient_enqueue_failure_is_retried_within_tick() {
        let pool = test_pool().await;
        insert_policy(&pool, &daily_policy("pol-1", 7)).await;
        insert_database(&pool, &simple_database("db-1", "pol-1")).await;

        let mut queue = MockJobQueue::new();
        let mut calls = 0;
        queue.expect_enqueue().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(crate::error::Error::Queue("blip".to_string()))
            } else {
                Ok(())
            }
        });
        let scheduler = Scheduler::new(pool.clone(), Arc::new(queue), 2);

        let summary = scheduler.tick(at(10, 2)).await;
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.errors, 0);
    }

    #[tokio::test]
    async fn test_all_tiers_disabled_produces_nothing() {
        let pool = test_pool().await;
        let policy = BackupPolicy {
            id: "pol-off".to_string(),
            name: "off".to_string(),
            tiers: TierSet::all_disabled(),
        };
        insert_policy(&pool, &policy).await;
        insert_database(&pool, &simple_database("db-1", "pol-off")).await;

        let (scheduler, queue) = scheduler_with_real_queue(&pool).await;
        let summary = scheduler.tick(at(10, 2)).await;
        assert_eq!(summary.dispatched, 0);
        assert!(queue.receive(Utc::now()).await.unwrap().is_none());
    }
}
