//! Share/container collaborator registry (design notes §9): dynamic
//! dispatch by plugin name onto the collaborators `bidir::apply_state`
//! calls out to when a link's master/slave role flips.
//!
//! This crate carries no concrete share or container backend of its own —
//! those remain external collaborators, the same way ZFS and SSH key
//! material are treated as external tools elsewhere in this crate — so the
//! registry ships empty by default and `related`/`toggle_for_volume` are
//! no-ops until a caller registers an implementation.

use crate::error::ReplicationError;

/// One share or container backend: can report which of its entries target
/// a volume, and toggle an entry's `enabled` flag.
pub trait ServiceCollaborator: Send + Sync {
    fn kind(&self) -> &'static str;
    fn related(&self, volume: &str) -> Vec<String>;
    fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), ReplicationError>;
}

/// Registry of share/container collaborators keyed by `kind()`, the same
/// plugin-by-name shape as the `share.{type}.*`/`container.{type}.*`
/// dispatch described in design notes §9.
#[derive(Default)]
pub struct ServiceRegistry {
    collaborators: Vec<Box<dyn ServiceCollaborator>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, collaborator: Box<dyn ServiceCollaborator>) {
        self.collaborators.push(collaborator);
    }

    /// Every share/container name, across all registered collaborators,
    /// whose target is `volume`.
    pub fn related(&self, volume: &str) -> Vec<String> {
        self.collaborators.iter().flat_map(|c| c.related(volume)).collect()
    }

    /// Toggle `enabled` on every share/container targeting `volume`.
    pub fn toggle_for_volume(&self, volume: &str, enabled: bool) -> Result<(), ReplicationError> {
        for collaborator in &self.collaborators {
            for name in collaborator.related(volume) {
                collaborator.set_enabled(&name, enabled)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct FakeShare {
        targets: Vec<(&'static str, &'static str)>,
        calls: Arc<Mutex<Vec<(String, bool)>>>,
    }

    impl ServiceCollaborator for FakeShare {
        fn kind(&self) -> &'static str {
            "share"
        }
        fn related(&self, volume: &str) -> Vec<String> {
            self.targets
                .iter()
                .filter(|(_, v)| *v == volume)
                .map(|(n, _)| n.to_string())
                .collect()
        }
        fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), ReplicationError> {
            self.calls.lock().unwrap().push((name.to_string(), enabled));
            Ok(())
        }
    }

    #[test]
    fn toggle_for_volume_only_touches_matching_entries() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let share = FakeShare {
            targets: vec![("nfs-a", "tank/data"), ("nfs-b", "tank/other")],
            calls: calls.clone(),
        };
        let mut registry = ServiceRegistry::new();
        registry.register(Box::new(share));
        registry.toggle_for_volume("tank/data", false).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![("nfs-a".to_string(), false)]);
    }

    #[test]
    fn empty_registry_is_a_no_op() {
        let registry = ServiceRegistry::default();
        assert!(registry.related("tank/data").is_empty());
        assert!(registry.toggle_for_volume("tank/data", true).is_ok());
    }
}
