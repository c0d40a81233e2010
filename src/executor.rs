//! Backup executor: the worker pool that turns dispatch requests into
//! stored artifacts and audit records.
//!
//! Workers consume the queue concurrently, one request at a time each.
//! At-least-once delivery is reconciled by the idempotent result insert:
//! a redelivered request whose bucket already has a non-failed result is
//! acked and discarded. Dumps are staged on disk and streamed to object
//! storage, never buffered whole in memory.

use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::DbPool;
use crate::engine::EngineAdapter;
use crate::error::{Error, Result};
use crate::naming;
use crate::prune;
use crate::queue::{Delivery, DispatchRequest, JobQueue};
use crate::storage::ArtifactStore;
use crate::store::{catalog, results};

/// How long an idle worker sleeps before polling the queue again.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Executor settings, a slice of the application config.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Deliveries beyond this count are dead-lettered.
    pub max_delivery_attempts: u32,
    /// Hard wall-clock cap per job; a hung dump frees the worker.
    pub job_timeout: Duration,
    /// Whether staged dumps are gzip-compressed before upload.
    pub compress: bool,
}

struct BackupArtifact {
    key: String,
    size_bytes: u64,
}

pub struct Executor {
    pool: DbPool,
    queue: Arc<dyn JobQueue>,
    storage: Arc<dyn ArtifactStore>,
    engine: Arc<dyn EngineAdapter>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        pool: DbPool,
        queue: Arc<dyn JobQueue>,
        storage: Arc<dyn ArtifactStore>,
        engine: Arc<dyn EngineAdapter>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            storage,
            engine,
            config,
        }
    }

    /// Poll-and-process loop for one worker.
    pub async fn run_worker(&self, worker: usize) {
        loop {
            match self.queue.receive(Utc::now()).await {
                Ok(Some(delivery)) => {
                    debug!(
                        "worker {} processing {} {} (attempt {})",
                        worker, delivery.request.database_id, delivery.request.tier, delivery.attempt
                    );
                    if let Err(e) = self.process(&delivery).await {
                        error!("worker {} failed processing delivery {}: {}", worker, delivery.id, e);
                    }
                }
                Ok(None) => tokio::time::sleep(IDLE_POLL_INTERVAL).await,
                Err(e) => {
                    warn!("worker {} failed to poll queue: {}", worker, e);
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Handle one delivery end to end.
    ///
    /// Every accepted delivery ends in exactly one of: ack after a duplicate
    /// check, ack after a terminal result, or redelivery (no ack) after a
    /// failure so the queue drives the retry.
    pub async fn process(&self, delivery: &Delivery) -> Result<()> {
        let request = &delivery.request;
        let now = Utc::now();

        if delivery.attempt > self.config.max_delivery_attempts {
            // Out of attempts: guarantee a terminal audit row, then park the
            // job where an operator can inspect it.
            results::ensure_terminal_failed(
                &self.pool,
                &naming::result_id(now),
                &request.database_id,
                request.tier,
                &request.bucket_key,
                request.triggered_by,
                &format!("abandoned after {} delivery attempts", delivery.attempt - 1),
                now,
            )
            .await?;
            warn!(
                "dead-lettering {} {} bucket {} after {} attempts",
                request.database_id, request.tier, request.bucket_key, delivery.attempt
            );
            return self.queue.dead_letter(delivery.id).await;
        }

        let result_id = naming::result_id(now);
        let fresh = results::begin_result(
            &self.pool,
            &result_id,
            &request.database_id,
            request.tier,
            &request.bucket_key,
            request.triggered_by,
            now,
        )
        .await?;

        if !fresh {
            // Redelivery of work that is already done or underway.
            debug!(
                "duplicate dispatch for {} {} bucket {}, discarding",
                request.database_id, request.tier, request.bucket_key
            );
            return self.queue.ack(delivery.id).await;
        }

        results::mark_in_progress(&self.pool, &result_id).await?;

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.config.job_timeout, self.run_backup(request)).await;

        match outcome {
            Ok(Ok(artifact)) => {
                let duration_ms = started.elapsed().as_millis() as i64;
                results::mark_completed(
                    &self.pool,
                    &result_id,
                    &artifact.key,
                    artifact.size_bytes as i64,
                    duration_ms,
                    Utc::now(),
                )
                .await?;
                info!(
                    "backup {} {} bucket {} completed: {} bytes in {} ms",
                    request.database_id, request.tier, request.bucket_key,
                    artifact.size_bytes, duration_ms
                );

                self.prune_tier(request, &result_id).await;
                self.queue.ack(delivery.id).await
            }
            Ok(Err(e)) => {
                results::mark_failed(&self.pool, &result_id, &e.to_string(), Utc::now()).await?;
                warn!(
                    "backup {} {} bucket {} failed: {}",
                    request.database_id, request.tier, request.bucket_key, e
                );
                // No ack: the visibility timeout redelivers this job.
                Ok(())
            }
            Err(_) => {
                let e = Error::Timeout(self.config.job_timeout.as_secs());
                results::mark_failed(&self.pool, &result_id, &e.to_string(), Utc::now()).await?;
                warn!(
                    "backup {} {} bucket {} timed out",
                    request.database_id, request.tier, request.bucket_key
                );
                Ok(())
            }
        }
    }

    /// Dump, stage, optionally compress, and upload.
    async fn run_backup(&self, request: &DispatchRequest) -> Result<BackupArtifact> {
        let db = catalog::get_database(&self.pool, &request.database_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("database {}", request.database_id)))?;
        let target = catalog::resolve_target(&self.pool, &db).await?;

        let staging = tempfile::tempdir()?;
        let raw_path = staging.path().join("dump.sql");

        self.engine.dump(&target, &raw_path).await?;

        let (upload_path, key) = if self.config.compress {
            let gz_path = staging.path().join("dump.sql.gz");
            compress_file(&raw_path, &gz_path).await?;
            (
                gz_path,
                naming::artifact_key(&request.database_id, request.tier, &request.bucket_key, true),
            )
        } else {
            (
                raw_path,
                naming::artifact_key(&request.database_id, request.tier, &request.bucket_key, false),
            )
        };

        let size_bytes = self.storage.put(&upload_path, &key).await?;
        Ok(BackupArtifact { key, size_bytes })
    }

    /// Retention pruning after a success. Never fails the backup: errors
    /// are logged and retried after the next success for this tier.
    async fn prune_tier(&self, request: &DispatchRequest, protect_id: &str) {
        let keep_count = match self.resolve_keep_count(request).await {
            Ok(count) => count,
            Err(e) => {
                warn!(
                    "skipping prune for {} {}: could not resolve policy: {}",
                    request.database_id, request.tier, e
                );
                return;
            }
        };

        if let Err(e) = prune::prune(
            &self.pool,
            self.storage.as_ref(),
            &request.database_id,
            request.tier,
            keep_count,
            protect_id,
        )
        .await
        {
            warn!(
                "prune for {} {} failed: {}; will retry after next success",
                request.database_id, request.tier, e
            );
        }
    }

    async fn resolve_keep_count(&self, request: &DispatchRequest) -> Result<u32> {
        let db = catalog::get_database(&self.pool, &request.database_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("database {}", request.database_id)))?;
        let policy = catalog::resolve_policy(&self.pool, &db).await?;
        Ok(policy.tiers.get(request.tier).keep_count)
    }
}

/// Gzip `source` into `dest` through bounded buffers.
async fn compress_file(source: &Path, dest: &Path) -> Result<()> {
    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        use flate2::Compression;
        use flate2::write::GzEncoder;
        use std::io::{BufReader, BufWriter};

        let mut input = BufReader::new(std::fs::File::open(&source)?);
        let output = BufWriter::new(std::fs::File::create(&dest)?);
        let mut encoder = GzEncoder::new(output, Compression::default());
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Engine(format!("compression task panicked: {}", e)))?
}

/// Spawn the worker pool.
pub fn spawn_workers(executor: Arc<Executor>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run_worker(worker).await })
        })
        .collect()
}

/// Periodic sweep that fails pending/in_progress results older than
/// `stuck_after`, so abandoned jobs never dangle in the audit trail.
pub async fn run_watchdog(pool: DbPool, sweep_interval: Duration, stuck_after: Duration) {
    let mut ticker = tokio::time::interval(sweep_interval);
    let stuck_after = match chrono::Duration::from_std(stuck_after) {
        Ok(d) => d,
        Err(e) => {
            error!("invalid watchdog cutoff: {}", e);
            return;
        }
    };

    loop {
        ticker.tick().await;
        let now = Utc::now();
        match results::sweep_stuck(&pool, now - stuck_after, now).await {
            Ok(0) => {}
            Ok(swept) => warn!("watchdog failed {} stuck backup results", swept),
            Err(e) => warn!("watchdog sweep failed: {}", e),
        }
    }
}
