//! Identifier and artifact-key generation.
//!
//! Result IDs are timestamp-prefixed so they sort by creation time, with a
//! short random suffix for uniqueness. Artifact keys are namespaced by
//! database and tier so storage paths group naturally, and each job gets a
//! unique key so storage writes never contend.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};

use crate::policy::Tier;

/// Generate a backup result ID for a job starting at `now`.
///
/// Format: `bkp_{YYYYMMDD}T{HHMMSS}_{RANDOM}`
pub fn result_id(now: DateTime<Utc>) -> String {
    format!("bkp_{}_{}", now.format("%Y%m%dT%H%M%S"), random_suffix(6))
}

/// Generate the object-storage key for a backup artifact.
///
/// Format: `db/{database_id}/{tier}/{bucket}-{RANDOM}.sql[.gz]`
pub fn artifact_key(database_id: &str, tier: Tier, bucket_key: &str, compressed: bool) -> String {
    let ext = if compressed { ".sql.gz" } else { ".sql" };
    format!(
        "db/{}/{}/{}-{}{}",
        database_id,
        tier,
        bucket_key,
        random_suffix(8),
        ext
    )
}

fn random_suffix(len: usize) -> String {
    let mut rng = thread_rng();
    (0..len).map(|_| rng.sample(Alphanumeric) as char).collect()
}
