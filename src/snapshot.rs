//! Snapshot task (C3): create a fresh snapshot for a dataset, then prune
//! expired ones sharing its prefix.

use chrono::Utc;

use crate::error::ReplicationError;
use crate::name::{Lifetime, SnapshotName};
use crate::retention::expired;
use crate::zfs::{self, ZfsError};

const MAX_SEQ: u32 = 99;

pub struct SnapshotTaskOptions {
    pub dataset: String,
    pub recursive: bool,
    pub lifetime: Lifetime,
    pub prefix: String,
    pub replicable: bool,
}

pub struct SnapshotTaskOutcome {
    pub created: SnapshotName,
    /// Non-fatal: prune step failed or left residual expired snapshots.
    pub prune_warning: Option<String>,
}

/// `snapshot(pool, dataset, recursive, lifetime, prefix, replicable) -> ()`.
///
/// Step 2 (create) is fatal on failure; step 3 (prune) surfaces as a
/// warning only, since residual expired snapshots are tolerable.
pub async fn run(opts: &SnapshotTaskOptions) -> Result<SnapshotTaskOutcome, ReplicationError> {
    let now = Utc::now();
    let created = create_with_retry(&opts.dataset, &opts.prefix, now, opts.lifetime, opts.recursive).await?;

    if opts.replicable {
        let full = format!("{}@{}", opts.dataset, created);
        zfs::set_property(&full, zfs::REPLICATE_PROPERTY, "yes")
            .await
            .map_err(|e| ReplicationError::StreamFailed(e.to_string()))?;
    }

    let prune_warning = match prune_expired(&opts.dataset, &opts.prefix, now).await {
        Ok(()) => None,
        Err(e) => Some(e.to_string()),
    };

    Ok(SnapshotTaskOutcome {
        created,
        prune_warning,
    })
}

async fn create_with_retry(
    dataset: &str,
    prefix: &str,
    now: chrono::DateTime<Utc>,
    lifetime: Lifetime,
    recursive: bool,
) -> Result<SnapshotName, ReplicationError> {
    let base = SnapshotName::new(prefix, now, lifetime);
    if try_create(dataset, &base, recursive).await? {
        return Ok(base);
    }

    for seq in 1..=MAX_SEQ {
        let candidate = base.clone().with_seq(seq);
        if try_create(dataset, &candidate, recursive).await? {
            return Ok(candidate);
        }
    }

    Err(ReplicationError::NameExhausted(format!(
        "{dataset}@{prefix}-{}",
        now.format("%Y%m%d.%H%M")
    )))
}

/// Attempts to create `dataset@name`; returns `Ok(true)` on success,
/// `Ok(false)` if it already exists (so the caller retries with a seq).
async fn try_create(dataset: &str, name: &SnapshotName, recursive: bool) -> Result<bool, ReplicationError> {
    let full = format!("{dataset}@{name}");
    if zfs::snapshot_exists(&full)
        .await
        .map_err(|e| ReplicationError::StreamFailed(e.to_string()))?
    {
        return Ok(false);
    }
    match zfs::create_snapshot(&full, recursive).await {
        Ok(()) => Ok(true),
        Err(ZfsError::NonZeroExit { stderr, .. }) if stderr.contains("already exists") => Ok(false),
        Err(e) => Err(ReplicationError::StreamFailed(e.to_string())),
    }
}

async fn prune_expired(
    dataset: &str,
    prefix: &str,
    observed_at: chrono::DateTime<Utc>,
) -> Result<(), ZfsError> {
    let snaps = zfs::list_snapshots(dataset, false).await?;
    let doomed: Vec<String> = snaps
        .into_iter()
        .filter(|s| s.snapname.prefix == prefix)
        .filter(|s| expired(&s.snapname, s.holds, observed_at))
        .map(|s| s.snapname.to_string())
        .collect();
    zfs::destroy_snapshots(dataset, &doomed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::LifetimeUnit;

    #[test]
    fn name_exhausted_message_is_descriptive() {
        let now = Utc::now();
        let err = ReplicationError::NameExhausted(format!(
            "tank/data@repl-{}",
            now.format("%Y%m%d.%H%M")
        ));
        assert!(err.to_string().contains("name exhausted"));
    }

    #[test]
    fn default_lifetime_matches_replicator_contract() {
        let lifetime = Lifetime {
            amount: 1,
            unit: LifetimeUnit::Year,
        };
        assert_eq!(lifetime.to_string(), "1y");
    }
}
