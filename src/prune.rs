//! Retention pruning: cap completed artifacts per (database, tier) at the
//! tier's keep_count.
//!
//! Runs after each successful backup. The artifact is deleted before its
//! record so a crash in between leaves an orphaned record that the next
//! pass re-prunes, never an untracked artifact leaking storage. Failures
//! here are always non-fatal to the backup that triggered them.

use tracing::{debug, warn};

use crate::db::DbPool;
use crate::error::Result;
use crate::policy::Tier;
use crate::storage::ArtifactStore;
use crate::store::results;

/// What a prune pass did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub kept: usize,
    pub deleted: usize,
    /// Artifact deletions that failed; their records remain for the next pass.
    pub failed: usize,
}

/// Prune completed results for (database, tier) down to `keep_count`.
///
/// `protect_id` is the result that triggered this pass; it is never deleted,
/// even with `keep_count` 0.
pub async fn prune(
    pool: &DbPool,
    storage: &dyn ArtifactStore,
    database_id: &str,
    tier: Tier,
    keep_count: u32,
    protect_id: &str,
) -> Result<PruneOutcome> {
    let completed = results::list_completed(pool, database_id, tier).await?;
    let mut outcome = PruneOutcome::default();

    for (index, result) in completed.iter().enumerate() {
        if index < keep_count as usize || result.id == protect_id {
            outcome.kept += 1;
            continue;
        }

        // Artifact first, record second. Missing artifacts count as deleted:
        // an interrupted earlier pass got that far.
        if let Some(key) = &result.artifact_key {
            if let Err(e) = storage.delete(key).await {
                warn!(
                    "failed to delete artifact {} for result {}: {}; will retry on next prune",
                    key, result.id, e
                );
                outcome.failed += 1;
                continue;
            }
        }

        results::delete_result(pool, &result.id).await?;
        outcome.deleted += 1;
    }

    debug!(
        "pruned {}/{}: kept {}, deleted {}, failed {}",
        database_id, tier, outcome.kept, outcome.deleted, outcome.failed
    );
    Ok(outcome)
}
