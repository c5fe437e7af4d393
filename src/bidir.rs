//! Bi-directional link manager (C7): maintains the two-node master/slave
//! role for a set of volumes and enforces read-only on the non-master
//! side.
//!
//! The `volumes` named lock and per-dataset `zfs:<dataset>` advisory lock
//! (spec §5) are modelled directly as `tokio::sync::Mutex` guards rather
//! than through a generic task-resource-declaration system, since this
//! crate has exactly one process and no external dispatcher to register
//! resource names with.
//!
//! `create` and `sync` are the two operations that actually cross the
//! wire: they drive the peer over a `PeerConnection` (persisting the link
//! remotely, streaming each volume, flipping the peer's role) the same way
//! `replicator::run` drives a plain replication. `delete` and `switch`
//! stay local-only, matching the calling node's own half of the state
//! transition; the peer's matching half is applied by the peer's own CLI
//! invocation (the RPC plumbing a dispatcher-based original would route
//! automatically is, here, two independent `zreplicate bidir` calls).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::dataset::Dataset;
use crate::error::ReplicationError;
use crate::planner::{self, PlanOptions};
use crate::replicator;
use crate::rpc::PeerConnection;
use crate::services::ServiceRegistry;
use crate::store::{self, BidirLink, LinkRole, LinkStore};
use crate::transport::TransportOptions;
use crate::zfs;

/// Per-dataset advisory locks, keyed by dataset name. Guards against a
/// concurrent snapshot/destroy racing the planner's view of a dataset
/// while a sync or create is streaming it.
#[derive(Default)]
pub struct DatasetLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DatasetLocks {
    pub async fn lock_for(&self, dataset: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(dataset.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct BidirManager {
    store: LinkStore,
    /// Serializes `create`, `delete(scrub)`, and `sync` volume work.
    volumes_lock: Mutex<()>,
    dataset_locks: DatasetLocks,
    local_node: String,
    services: ServiceRegistry,
}

impl BidirManager {
    pub fn new(store: LinkStore, local_node: impl Into<String>) -> Self {
        Self {
            store,
            volumes_lock: Mutex::new(()),
            dataset_locks: DatasetLocks::default(),
            local_node: local_node.into(),
            services: ServiceRegistry::default(),
        }
    }

    /// Register the share/container collaborators `set_state` should
    /// toggle on role transitions. Defaults to an empty registry (no-op)
    /// when never called.
    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.services = services;
        self
    }

    /// Reconciles the local copy against the peer's, returning whichever
    /// has the later `update_date`. Falls back to the local copy
    /// optimistically if the peer can't be reached.
    pub async fn get_latest_link(
        &self,
        name: &str,
        peer: Option<&PeerConnection>,
    ) -> Result<Option<BidirLink>, ReplicationError> {
        let local = self
            .store
            .get(name)
            .await
            .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?;

        let remote = match peer {
            Some(conn) => conn.call_sync::<Option<BidirLink>>("bidir.get", &name).await.ok().flatten(),
            None => None,
        };

        Ok(store::latest(local, remote))
    }

    /// `create(link, password?)`. This node becomes MASTER if it is the
    /// partner whose address is passed as `local_node`. A master-side
    /// create requires a live `peer` connection and transport: it verifies
    /// no colliding share/container exists on the peer, persists the link
    /// locally (per design notes §9, local insert precedes the peer
    /// insert), replicates each volume to the peer, and finally drives the
    /// peer to SLAVE.
    pub async fn create(
        &self,
        name: &str,
        partners: [String; 2],
        volumes: Vec<String>,
        peer: &PeerConnection,
        transport: &TransportOptions,
    ) -> Result<BidirLink, ReplicationError> {
        if self
            .store
            .get(name)
            .await
            .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?
            .is_some()
        {
            return Err(ReplicationError::AlreadyExists(format!(
                "bidir link {name} already exists"
            )));
        }

        if !partners.contains(&self.local_node) {
            return Err(ReplicationError::InvariantViolated(format!(
                "neither partner resolves to this node ({})",
                self.local_node
            )));
        }

        let link = BidirLink {
            id: format!("{name}-{}", Utc::now().timestamp_millis()),
            name: name.to_string(),
            partners,
            master: self.local_node.clone(),
            volumes,
            update_date: Utc::now(),
        };

        if !link.is_valid() {
            return Err(ReplicationError::InvariantViolated(
                "partners must be exactly two distinct addresses, one of them master".into(),
            ));
        }

        if link.role_of(&self.local_node) == Some(LinkRole::Master) {
            let _guard = self.volumes_lock.lock().await;

            for volume in &link.volumes {
                if !zfs::dataset_exists(volume)
                    .await
                    .map_err(|e| ReplicationError::NotFound(e.to_string()))?
                {
                    return Err(ReplicationError::NotFound(format!(
                        "volume {volume} does not exist locally"
                    )));
                }

                for related in self.services.related(volume) {
                    if peer.call_sync::<bool>("bidir.service_exists", &related).await.unwrap_or(false) {
                        return Err(ReplicationError::AlreadyExists(format!(
                            "share/container {related} already exists on the peer"
                        )));
                    }
                }

                if !peer.call_sync::<bool>("dataset.exists", &volume.clone()).await.unwrap_or(false) {
                    return Err(ReplicationError::NotFound(format!(
                        "volume {volume} does not exist on the peer; pre-provision it before creating the link"
                    )));
                }
            }

            self.store
                .put(link.clone())
                .await
                .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?;
            peer.call_task_sync::<()>("bidir.create_link", &link).await?;

            for volume in &link.volumes {
                self.replicate_volume(volume, peer, transport).await?;
            }

            self.set_state_on_peer(peer, &link.volumes, LinkRole::Slave, true).await?;
            self.emit_changed("create", &link);
            return Ok(link);
        }

        self.store
            .put(link.clone())
            .await
            .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?;
        self.emit_changed("create", &link);
        Ok(link)
    }

    /// `delete(name, scrub)`.
    pub async fn delete(&self, name: &str, scrub: bool) -> Result<(), ReplicationError> {
        let link = self
            .store
            .get(name)
            .await
            .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?
            .ok_or_else(|| ReplicationError::NotFound(format!("bidir link {name}")))?;

        if scrub && link.role_of(&self.local_node) == Some(LinkRole::Slave) {
            let _guard = self.volumes_lock.lock().await;
            for volume in &link.volumes {
                zfs::destroy_dataset(volume, true)
                    .await
                    .map_err(|e| ReplicationError::StreamFailed(e.to_string()))?;
            }
        }

        self.store
            .remove(name)
            .await
            .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?;
        self.emit_changed("delete", &link);
        Ok(())
    }

    /// `switch(name)`: swap master to the other partner.
    pub async fn switch(&self, name: &str) -> Result<BidirLink, ReplicationError> {
        let mut link = self
            .store
            .get(name)
            .await
            .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?
            .ok_or_else(|| ReplicationError::NotFound(format!("bidir link {name}")))?;

        let new_master = link
            .partners
            .iter()
            .find(|p| *p != &link.master)
            .cloned()
            .ok_or_else(|| ReplicationError::InvariantViolated("link has no alternate partner".into()))?;

        link.master = new_master;
        link.update_date = Utc::now();

        let new_role = link.role_of(&self.local_node);
        if let Some(role) = new_role {
            self.set_state(&link.volumes, role, true).await?;
        }

        self.store
            .put(link.clone())
            .await
            .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?;
        self.emit_changed("update", &link);
        Ok(link)
    }

    /// `sync(name)`: MASTER path replicates each volume to the peer,
    /// re-applying the peer's read-only/service state before and after;
    /// SLAVE forwards the request (modelled here as returning
    /// `InvariantViolated` since this process has no ambient outbound
    /// session of its own — callers on the slave side should route
    /// through their own `PeerConnection` to the master instead).
    pub async fn sync(
        &self,
        name: &str,
        peer: &PeerConnection,
        transport: &TransportOptions,
    ) -> Result<(), ReplicationError> {
        let link = self
            .store
            .get(name)
            .await
            .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?
            .ok_or_else(|| ReplicationError::NotFound(format!("bidir link {name}")))?;

        match link.role_of(&self.local_node) {
            Some(LinkRole::Master) => {
                let _guard = self.volumes_lock.lock().await;
                self.set_state_on_peer(peer, &link.volumes, LinkRole::Master, false).await?;
                for volume in &link.volumes {
                    self.replicate_volume(volume, peer, transport).await?;
                }
                self.set_state_on_peer(peer, &link.volumes, LinkRole::Slave, true).await?;
                self.emit_changed("update", &link);
                Ok(())
            }
            Some(LinkRole::Slave) => Err(ReplicationError::InvariantViolated(
                "sync on the slave side must be forwarded to the master via its PeerConnection".into(),
            )),
            None => Err(ReplicationError::InvariantViolated(format!(
                "{} is not a partner of link {name}",
                self.local_node
            ))),
        }
    }

    /// Diff `volume` against the peer's real inventory (fetched over
    /// `peer`) and execute the resulting plan against that same peer.
    async fn replicate_volume(
        &self,
        volume: &str,
        peer: &PeerConnection,
        transport: &TransportOptions,
    ) -> Result<(), ReplicationError> {
        let dataset_lock = self.dataset_locks.lock_for(volume).await;
        let _guard = dataset_lock.lock().await;

        let local_datasets = zfs::list_datasets(volume, true)
            .await
            .map_err(|e| ReplicationError::NotFound(e.to_string()))?;
        let remote_datasets: Vec<Dataset> = peer
            .call_sync("dataset.list", &volume.to_string())
            .await
            .unwrap_or_default();

        let opts = PlanOptions {
            localds: volume.to_string(),
            remoteds: volume.to_string(),
            recursive: true,
            followdelete: true,
        };
        let plan = planner::build_plan(&opts, &local_datasets, &remote_datasets)
            .await
            .map_err(|e| ReplicationError::StreamFailed(e.to_string()))?;

        let volume_transport = TransportOptions {
            remote_pool: volume.split('/').next().unwrap_or(volume).to_string(),
            ..transport.clone()
        };

        for action in &plan {
            replicator::execute_action(action, &volume_transport, peer).await?;
        }
        Ok(())
    }

    /// Apply `set_state` to this node's own volumes.
    async fn set_state(
        &self,
        volumes: &[String],
        new_role_for_this_node: LinkRole,
        touch_services: bool,
    ) -> Result<(), ReplicationError> {
        apply_state(volumes, new_role_for_this_node, touch_services, &self.services).await
    }

    /// Apply `set_state` to the peer's volumes, over RPC.
    async fn set_state_on_peer(
        &self,
        peer: &PeerConnection,
        volumes: &[String],
        new_role: LinkRole,
        touch_services: bool,
    ) -> Result<(), ReplicationError> {
        peer.call_task_sync::<()>("bidir.set_state", &(volumes.to_vec(), new_role, touch_services))
            .await
    }

    fn emit_changed(&self, operation: &str, link: &BidirLink) {
        log::info!(
            "event replication.bidir.changed operation={operation} ids={:?}",
            [&link.id]
        );
    }
}

/// `set_state(volumes, is_master, touch_services)`: readonly toggles
/// unconditionally; `MASTER -> SLAVE` and `SLAVE -> MASTER` transitions
/// always toggle services, same-state refreshes may skip it (the caller
/// decides via `touch_services`). Free function so both `BidirManager`
/// (applying to its own node) and the `rpc` subcommand (applying on behalf
/// of a calling peer) can drive it without sharing a `BidirManager`.
pub async fn apply_state(
    volumes: &[String],
    new_role: LinkRole,
    touch_services: bool,
    services: &ServiceRegistry,
) -> Result<(), ReplicationError> {
    let is_master = new_role == LinkRole::Master;
    for volume in volumes {
        zfs::set_property(volume, "readonly", if is_master { "off" } else { "on" })
            .await
            .map_err(|e| ReplicationError::StreamFailed(e.to_string()))?;
        if touch_services {
            services.toggle_for_volume(volume, is_master)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(master: &str) -> BidirLink {
        BidirLink {
            id: "1".into(),
            name: "L".into(),
            partners: ["a@A".into(), "b@B".into()],
            master: master.into(),
            volumes: vec!["tank/data".into()],
            update_date: Utc::now(),
        }
    }

    #[test]
    fn at_most_one_master_at_quiescence() {
        let l = link("a@A");
        assert_eq!(l.role_of("a@A"), Some(LinkRole::Master));
        assert_eq!(l.role_of("b@B"), Some(LinkRole::Slave));
    }

    /// Drives `BidirManager::switch` end to end: partner swap, persisted
    /// state, and bumped `update_date`. Run from an observer node (neither
    /// partner) so the role-dependent `set_state` call — which would shell
    /// out to a real `zfs` binary — is never reached; the swap itself is
    /// unconditional regardless of the caller's own role.
    #[tokio::test]
    async fn switch_flips_master_to_the_other_partner_and_bumps_update_date() {
        let dir = std::env::temp_dir().join(format!(
            "zreplicate-bidir-test-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        let store = LinkStore::new(dir.join("bidir-links.json"));
        store.put(link("a@A")).await.unwrap();

        let manager = BidirManager::new(store, "c@C".to_string());
        let before = manager.get_latest_link("L", None).await.unwrap().unwrap();
        assert_eq!(before.master, "a@A");

        let after = manager.switch("L").await.unwrap();

        assert_eq!(after.master, "b@B");
        assert!(after.update_date >= before.update_date);
        assert_eq!(after.role_of("b@B"), Some(LinkRole::Master));
        assert_eq!(after.role_of("a@A"), Some(LinkRole::Slave));
        assert_eq!(after.role_of("c@C"), None);

        let stored = manager.get_latest_link("L", None).await.unwrap().unwrap();
        assert_eq!(stored, after);

        let _ = tokio::fs::remove_dir_all(dir).await;
    }
}
