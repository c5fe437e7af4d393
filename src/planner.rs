//! Action planner (C4): diffs a local and remote snapshot inventory for one
//! dataset pair (or, recursively, a whole subtree) into an ordered list of
//! send/delete actions.
//!
//! The per-pair diff (`plan_pair`) is kept a pure function of its inputs so
//! the end-to-end scenarios can be exercised directly as unit tests; the
//! recursive subtree walk and byte-size estimation pass that need live ZFS
//! access live in `build_plan`.

use itertools::Itertools;

use crate::dataset::{Dataset, SnapshotRecord};
use crate::name::SnapshotName;
use crate::zfs::{self, ZfsError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationAction {
    SendStream {
        localfs: String,
        remotefs: String,
        incremental: bool,
        anchor: Option<SnapshotName>,
        snapshot: SnapshotName,
        est_size: Option<u64>,
    },
    DeleteSnapshots {
        localfs: String,
        remotefs: String,
        snapshots: Vec<SnapshotName>,
    },
    DeleteDataset {
        localfs: String,
        remotefs: String,
    },
}

/// What the remote side looks like for one dataset pair before diffing.
pub enum RemoteDatasetState<'a> {
    /// `R` does not exist on the peer (ENOENT).
    Absent,
    /// `R` exists but its ZFS type differs from the local dataset's;
    /// treated as no common snapshot.
    TypeMismatch(&'a [SnapshotRecord]),
    Present(&'a [SnapshotRecord]),
}

fn replicable_sorted(snaps: &[SnapshotRecord]) -> Vec<&SnapshotRecord> {
    snaps
        .iter()
        .filter(|s| s.replicable)
        .sorted_by_key(|s| (s.creation_time, s.creation_raw))
        .collect()
}

fn full_chain(
    localfs: &str,
    remotefs: &str,
    local_repl: &[&SnapshotRecord],
) -> Vec<ReplicationAction> {
    let mut actions = Vec::new();
    let mut previous: Option<&SnapshotRecord> = None;
    for (i, snap) in local_repl.iter().enumerate() {
        actions.push(ReplicationAction::SendStream {
            localfs: localfs.to_string(),
            remotefs: remotefs.to_string(),
            incremental: i > 0,
            anchor: previous.map(|p| p.snapname.clone()),
            snapshot: snap.snapname.clone(),
            est_size: None,
        });
        previous = Some(snap);
    }
    actions
}

fn matches(local: &SnapshotRecord, remote: &SnapshotRecord) -> bool {
    local.snapname.to_string() == remote.snapname.to_string()
        && local.creation_raw == remote.creation_raw
}

/// Diff one (localfs, remotefs) pair into its slice of the plan. Does not
/// emit `DeleteDataset` — that only applies to peer datasets with no local
/// counterpart at all, decided by the caller across the whole subtree.
pub fn plan_pair(
    localfs: &str,
    remotefs: &str,
    local_snaps: &[SnapshotRecord],
    remote_state: RemoteDatasetState<'_>,
    followdelete: bool,
) -> Vec<ReplicationAction> {
    let local_repl = replicable_sorted(local_snaps);

    match remote_state {
        RemoteDatasetState::Absent => full_chain(localfs, remotefs, &local_repl),
        RemoteDatasetState::TypeMismatch(remote_snaps) => {
            let mut actions = Vec::new();
            let all_remote: Vec<SnapshotName> =
                remote_snaps.iter().map(|s| s.snapname.clone()).collect();
            if !all_remote.is_empty() {
                actions.push(ReplicationAction::DeleteSnapshots {
                    localfs: localfs.to_string(),
                    remotefs: remotefs.to_string(),
                    snapshots: all_remote,
                });
            }
            actions.extend(full_chain(localfs, remotefs, &local_repl));
            actions
        }
        RemoteDatasetState::Present(remote_snaps) => {
            let common = local_repl
                .iter()
                .filter_map(|local| {
                    remote_snaps
                        .iter()
                        .find(|remote| matches(local, remote))
                        .map(|_| *local)
                })
                .max_by_key(|s| s.creation_raw);

            let mut actions = Vec::new();

            let Some(anchor_snap) = common else {
                let all_remote: Vec<SnapshotName> =
                    remote_snaps.iter().map(|s| s.snapname.clone()).collect();
                if !all_remote.is_empty() {
                    actions.push(ReplicationAction::DeleteSnapshots {
                        localfs: localfs.to_string(),
                        remotefs: remotefs.to_string(),
                        snapshots: all_remote,
                    });
                }
                actions.extend(full_chain(localfs, remotefs, &local_repl));
                return actions;
            };

            if followdelete {
                let local_names: std::collections::HashSet<String> = local_repl
                    .iter()
                    .map(|s| s.snapname.to_string())
                    .collect();
                let orphaned: Vec<SnapshotName> = remote_snaps
                    .iter()
                    .filter(|r| !local_names.contains(&r.snapname.to_string()))
                    .map(|r| r.snapname.clone())
                    .collect();
                if !orphaned.is_empty() {
                    actions.push(ReplicationAction::DeleteSnapshots {
                        localfs: localfs.to_string(),
                        remotefs: remotefs.to_string(),
                        snapshots: orphaned,
                    });
                }
            }

            let newer: Vec<&SnapshotRecord> = local_repl
                .iter()
                .filter(|s| s.creation_raw > anchor_snap.creation_raw)
                .copied()
                .collect();

            let mut previous = anchor_snap;
            for snap in &newer {
                actions.push(ReplicationAction::SendStream {
                    localfs: localfs.to_string(),
                    remotefs: remotefs.to_string(),
                    incremental: true,
                    anchor: Some(previous.snapname.clone()),
                    snapshot: snap.snapname.clone(),
                    est_size: None,
                });
                previous = snap;
            }

            actions
        }
    }
}

fn remap_dataset(name: &str, localds: &str, remoteds: &str) -> String {
    if name == localds {
        remoteds.to_string()
    } else if let Some(rest) = name.strip_prefix(&format!("{localds}/")) {
        format!("{remoteds}/{rest}")
    } else {
        name.to_string()
    }
}

fn expand_subtree(datasets: &[Dataset], root: &str) -> Vec<String> {
    datasets
        .iter()
        .map(|d| d.name.clone())
        .filter(|n| n == root || n.starts_with(&format!("{root}/")))
        .sorted()
        .collect()
}

pub struct PlanOptions {
    pub localds: String,
    pub remoteds: String,
    pub recursive: bool,
    pub followdelete: bool,
}

/// Full planner run: expands the subtree (if `recursive`), diffs each pair
/// via `plan_pair`, appends `DeleteDataset` for unmatched peer datasets, and
/// runs the estimation pass over every `SendStream`.
pub async fn build_plan(
    opts: &PlanOptions,
    local_datasets: &[Dataset],
    remote_datasets: &[Dataset],
) -> Result<Vec<ReplicationAction>, ZfsError> {
    let local_names = if opts.recursive {
        expand_subtree(local_datasets, &opts.localds)
    } else {
        vec![opts.localds.clone()]
    };

    let mut plan = Vec::new();
    let mut covered_remote = std::collections::HashSet::new();

    for localfs in &local_names {
        let remotefs = remap_dataset(localfs, &opts.localds, &opts.remoteds);
        covered_remote.insert(remotefs.clone());

        let local_snaps = zfs::list_snapshots(localfs, false).await?;
        let remote_exists = zfs::dataset_exists(&remotefs).await?;

        let remote_snaps;
        let remote_state = if !remote_exists {
            RemoteDatasetState::Absent
        } else {
            remote_snaps = zfs::list_snapshots(&remotefs, false).await?;
            let local_kind = local_datasets
                .iter()
                .find(|d| d.name == *localfs)
                .map(|d| d.kind);
            let remote_kind = remote_datasets
                .iter()
                .find(|d| d.name == remotefs)
                .map(|d| d.kind);
            match (local_kind, remote_kind) {
                (Some(l), Some(r)) if l != r => RemoteDatasetState::TypeMismatch(&remote_snaps),
                _ => RemoteDatasetState::Present(&remote_snaps),
            }
        };

        plan.extend(plan_pair(
            localfs,
            &remotefs,
            &local_snaps,
            remote_state,
            opts.followdelete,
        ));
    }

    if opts.recursive {
        for remote in expand_subtree(remote_datasets, &opts.remoteds) {
            if !covered_remote.contains(&remote) {
                let localfs = remap_dataset(&remote, &opts.remoteds, &opts.localds);
                plan.push(ReplicationAction::DeleteDataset {
                    localfs,
                    remotefs: remote,
                });
            }
        }
    }

    for action in &mut plan {
        if let ReplicationAction::SendStream {
            localfs,
            snapshot,
            anchor,
            est_size,
            ..
        } = action
        {
            let anchor_str = anchor.as_ref().map(|a| format!("{localfs}@{a}"));
            *est_size = zfs::estimate_send_size(localfs, &snapshot.to_string(), anchor_str.as_deref())
                .await
                .ok();
        }
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::{Lifetime, LifetimeUnit};
    use chrono::{TimeZone, Utc};

    fn snap(name: &str, raw: i64, replicable: bool) -> SnapshotRecord {
        let creation = Utc.timestamp_opt(raw, 0).unwrap();
        SnapshotRecord {
            dataset: "tank/data".into(),
            snapname: SnapshotName::new(
                name,
                creation,
                Lifetime {
                    amount: 1,
                    unit: LifetimeUnit::Year,
                },
            ),
            creation_time: creation,
            creation_raw: raw,
            holds: false,
            replicable,
        }
    }

    #[test]
    fn s1_fresh_full() {
        let local = vec![
            snap("repl", 1704067200, true),
            snap("repl", 1704153600, true),
        ];
        let plan = plan_pair("tank/data", "backup/data", &local, RemoteDatasetState::Absent, false);
        assert_eq!(plan.len(), 2);
        match &plan[0] {
            ReplicationAction::SendStream { incremental, anchor, .. } => {
                assert!(!incremental);
                assert!(anchor.is_none());
            }
            _ => panic!("expected SendStream"),
        }
        match &plan[1] {
            ReplicationAction::SendStream { incremental, anchor, .. } => {
                assert!(incremental);
                assert_eq!(anchor.as_ref().unwrap().to_string(), "repl-20240101.0000-1y");
            }
            _ => panic!("expected SendStream"),
        }
    }

    #[test]
    fn s2_catch_up() {
        let local = vec![
            snap("s1", 1, true),
            snap("s2", 2, true),
            snap("s3", 3, true),
            snap("s4", 4, true),
            snap("s5", 5, true),
        ];
        let remote = vec![snap("s1", 1, true), snap("s2", 2, true), snap("s3", 3, true)];
        let plan = plan_pair(
            "tank/data",
            "backup/data",
            &local,
            RemoteDatasetState::Present(&remote),
            false,
        );
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|a| matches!(a, ReplicationAction::SendStream { incremental: true, .. })));
    }

    #[test]
    fn s3_follow_delete() {
        let local = vec![snap("s3", 3, true), snap("s4", 4, true), snap("s5", 5, true)];
        let remote = vec![
            snap("s1", 1, true),
            snap("s2", 2, true),
            snap("s3", 3, true),
            snap("s4", 4, true),
            snap("s5", 5, true),
        ];
        let plan = plan_pair(
            "tank/data",
            "backup/data",
            &local,
            RemoteDatasetState::Present(&remote),
            true,
        );
        assert_eq!(plan.len(), 1);
        match &plan[0] {
            ReplicationAction::DeleteSnapshots { snapshots, .. } => {
                assert_eq!(snapshots.len(), 2);
            }
            _ => panic!("expected DeleteSnapshots"),
        }
    }

    #[test]
    fn s4_divergence() {
        let local = vec![snap("a", 1, true), snap("b", 2, true), snap("c", 3, true)];
        let remote = vec![snap("a", 999, true), snap("x", 100, true), snap("y", 200, true)];
        let plan = plan_pair(
            "tank/data",
            "backup/data",
            &local,
            RemoteDatasetState::Present(&remote),
            false,
        );
        assert_eq!(plan.len(), 4);
        assert!(matches!(plan[0], ReplicationAction::DeleteSnapshots { .. }));
        match &plan[0] {
            ReplicationAction::DeleteSnapshots { snapshots, .. } => assert_eq!(snapshots.len(), 3),
            _ => unreachable!(),
        }
        match &plan[1] {
            ReplicationAction::SendStream { incremental, .. } => assert!(!incremental),
            _ => panic!("expected full send"),
        }
    }

    #[test]
    fn empty_local_nonempty_peer_only_deletes() {
        let local: Vec<SnapshotRecord> = vec![];
        let remote = vec![snap("s1", 1, true), snap("s2", 2, true)];
        let plan = plan_pair(
            "tank/data",
            "backup/data",
            &local,
            RemoteDatasetState::Present(&remote),
            false,
        );
        assert_eq!(plan.len(), 1);
        assert!(matches!(plan[0], ReplicationAction::DeleteSnapshots { .. }));
    }

    #[test]
    fn non_replicable_snapshots_are_ignored_for_matching() {
        let mut local = vec![snap("s1", 1, true)];
        local.push(snap("private", 2, false));
        let remote = vec![snap("s1", 1, true)];
        let plan = plan_pair(
            "tank/data",
            "backup/data",
            &local,
            RemoteDatasetState::Present(&remote),
            true,
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn type_mismatch_falls_through_to_delete_and_recreate() {
        let local = vec![snap("s1", 1, true)];
        let remote = vec![snap("old", 5, true)];
        let plan = plan_pair(
            "tank/data",
            "backup/data",
            &local,
            RemoteDatasetState::TypeMismatch(&remote),
            false,
        );
        assert_eq!(plan.len(), 2);
        assert!(matches!(plan[0], ReplicationAction::DeleteSnapshots { .. }));
        assert!(matches!(plan[1], ReplicationAction::SendStream { incremental: false, .. }));
    }

    #[test]
    fn follow_delete_orders_before_new_incremental_sends() {
        let local = vec![snap("s1", 1, true), snap("s2", 2, true)];
        let remote = vec![snap("s1", 1, true), snap("orphan", 99, true)];
        let plan = plan_pair(
            "tank/data",
            "backup/data",
            &local,
            RemoteDatasetState::Present(&remote),
            true,
        );
        assert_eq!(plan.len(), 2);
        match &plan[0] {
            ReplicationAction::DeleteSnapshots { snapshots, .. } => {
                assert_eq!(snapshots.len(), 1);
                assert!(snapshots[0].to_string().starts_with("orphan-"));
            }
            _ => panic!("expected DeleteSnapshots before the incremental send"),
        }
        match &plan[1] {
            ReplicationAction::SendStream { incremental, anchor, .. } => {
                assert!(incremental);
                assert_eq!(anchor.as_ref().unwrap().to_string(), "s1-19700101.0000-1y");
            }
            _ => panic!("expected SendStream after the delete"),
        }
    }

    #[test]
    fn remap_handles_root_and_children() {
        assert_eq!(remap_dataset("tank/data", "tank/data", "backup/data"), "backup/data");
        assert_eq!(
            remap_dataset("tank/data/child", "tank/data", "backup/data"),
            "backup/data/child"
        );
    }
}
