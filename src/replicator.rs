//! Replicator (C6): orchestrates a single run of snapshot -> plan -> send
//! for one dataset pair, reporting progress and honoring cancellation.

use tokio_util::sync::CancellationToken;

use crate::dataset::Dataset;
use crate::error::ReplicationError;
use crate::name::{Lifetime, LifetimeUnit};
use crate::planner::{self, PlanOptions, ReplicationAction};
use crate::progress::{ProgressSender, ProgressUpdate};
use crate::rpc::PeerConnection;
use crate::snapshot::{self, SnapshotTaskOptions};
use crate::transport::{self, TransportOptions};
use crate::zfs;

/// Default prefix/lifetime the replicator stamps onto the snapshot it
/// takes before every run (spec §4.6 step 1).
pub const DEFAULT_PREFIX: &str = "repl";
pub const DEFAULT_LIFETIME: Lifetime = Lifetime {
    amount: 1,
    unit: LifetimeUnit::Year,
};

pub struct RunOptions {
    pub localds: String,
    pub remoteds: String,
    pub recursive: bool,
    pub followdelete: bool,
    pub dry_run: bool,
    pub transport: TransportOptions,
}

pub struct RunOutcome {
    pub plan: Vec<ReplicationAction>,
    pub prune_warning: Option<String>,
}

/// Top-level run procedure. Dry-run short-circuits after planning and
/// never touches C5. A single action's failure aborts the remainder;
/// previously executed actions are not rolled back.
pub async fn run(
    opts: &RunOptions,
    peer: &PeerConnection,
    progress: ProgressSender,
    cancel: CancellationToken,
) -> Result<RunOutcome, ReplicationError> {
    let snap_outcome = snapshot::run(&SnapshotTaskOptions {
        dataset: opts.localds.clone(),
        recursive: opts.recursive,
        lifetime: DEFAULT_LIFETIME,
        prefix: DEFAULT_PREFIX.to_string(),
        replicable: true,
    })
    .await?;

    if cancel.is_cancelled() {
        return Err(ReplicationError::InvariantViolated("cancelled before planning".into()));
    }

    let local_datasets = discover_local_datasets(&opts.localds, opts.recursive).await?;
    let remote_datasets: Vec<Dataset> = peer
        .call_sync("dataset.list", &opts.remoteds)
        .await
        .unwrap_or_default();

    let plan_opts = PlanOptions {
        localds: opts.localds.clone(),
        remoteds: opts.remoteds.clone(),
        recursive: opts.recursive,
        followdelete: opts.followdelete,
    };
    let plan = planner::build_plan(&plan_opts, &local_datasets, &remote_datasets)
        .await
        .map_err(|e| ReplicationError::StreamFailed(e.to_string()))?;

    if opts.dry_run {
        return Ok(RunOutcome {
            plan,
            prune_warning: snap_outcome.prune_warning,
        });
    }

    let total_est: u64 = plan
        .iter()
        .filter_map(|a| match a {
            ReplicationAction::SendStream { est_size, .. } => *est_size,
            _ => None,
        })
        .sum();

    let mut bytes_done = 0u64;
    for (i, action) in plan.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ReplicationError::InvariantViolated(format!(
                "cancelled after {i}/{} actions",
                plan.len()
            )));
        }

        execute_action(action, &opts.transport, peer).await?;

        if let ReplicationAction::SendStream { est_size: Some(sz), .. } = action {
            bytes_done += sz;
        }

        let _ = progress.send(ProgressUpdate {
            actions_done: i + 1,
            actions_total: plan.len(),
            bytes_done,
            bytes_total: total_est,
            message: describe(action),
        });
    }

    Ok(RunOutcome {
        plan,
        prune_warning: snap_outcome.prune_warning,
    })
}

fn describe(action: &ReplicationAction) -> String {
    match action {
        ReplicationAction::SendStream { snapshot, incremental, .. } => {
            format!("send {snapshot} ({})", if *incremental { "incremental" } else { "full" })
        }
        ReplicationAction::DeleteSnapshots { snapshots, .. } => {
            format!("delete {} snapshots", snapshots.len())
        }
        ReplicationAction::DeleteDataset { remotefs, .. } => format!("delete dataset {remotefs}"),
    }
}

/// Execute one planned action against `peer`: stream a send over the
/// transport, or dispatch a destroy over the RPC connection. Shared by the
/// top-level run loop and the bidir manager's per-volume replication.
pub(crate) async fn execute_action(
    action: &ReplicationAction,
    transport_opts: &TransportOptions,
    peer: &PeerConnection,
) -> Result<(), ReplicationError> {
    match action {
        ReplicationAction::SendStream { localfs, snapshot, anchor, .. } => {
            transport::send_stream(
                transport_opts,
                localfs,
                &snapshot.to_string(),
                anchor.as_ref().map(|a| a.to_string()).as_deref(),
            )
            .await?;
            Ok(())
        }
        ReplicationAction::DeleteSnapshots { remotefs, snapshots, .. } => {
            let names: Vec<String> = snapshots.iter().map(|s| s.to_string()).collect();
            peer.call_sync("zfs.destroy_snapshots", &(remotefs.clone(), names))
                .await
        }
        ReplicationAction::DeleteDataset { remotefs, .. } => {
            peer.call_sync("zfs.destroy_dataset", &remotefs).await
        }
    }
}

async fn discover_local_datasets(root: &str, recursive: bool) -> Result<Vec<Dataset>, ReplicationError> {
    zfs::list_datasets(root, recursive)
        .await
        .map_err(|e| ReplicationError::NotFound(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lifetime_is_one_year() {
        assert_eq!(DEFAULT_LIFETIME.unit, LifetimeUnit::Year);
        assert_eq!(DEFAULT_LIFETIME.amount, 1);
    }

    #[test]
    fn describe_send_stream_mentions_direction() {
        use crate::dataset::SnapshotRecord;
        use crate::name::SnapshotName;
        use chrono::Utc;
        let _ = SnapshotRecord {
            dataset: "tank".into(),
            snapname: SnapshotName::new("repl", Utc::now(), DEFAULT_LIFETIME),
            creation_time: Utc::now(),
            creation_raw: 0,
            holds: false,
            replicable: true,
        };
        let action = ReplicationAction::SendStream {
            localfs: "tank".into(),
            remotefs: "backup".into(),
            incremental: false,
            anchor: None,
            snapshot: SnapshotName::new("repl", Utc::now(), DEFAULT_LIFETIME),
            est_size: None,
        };
        assert!(describe(&action).contains("full"));
    }
}
