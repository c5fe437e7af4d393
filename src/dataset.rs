//! Dataset identity and snapshot record types shared by the planner and the
//! ZFS transport layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::name::SnapshotName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetType {
    Filesystem,
    Volume,
}

/// A pool-qualified ZFS dataset. The planner treats `Volume` as an opaque
/// leaf: recursion never descends into one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub kind: DatasetType,
    pub pool: String,
    pub mountpoint: Option<String>,
    pub readonly: bool,
}

impl Dataset {
    pub fn new(name: impl Into<String>, kind: DatasetType) -> Self {
        let name = name.into();
        let pool = name.split('/').next().unwrap_or(&name).to_string();
        Self {
            name,
            kind,
            pool,
            mountpoint: None,
            readonly: false,
        }
    }

    /// True if `self` is `other` or a descendant of it, by path component.
    pub fn is_under(&self, other: &str) -> bool {
        self.name == other || self.name.starts_with(&format!("{other}/"))
    }
}

/// `{full_name, dataset, snapname, creation_time, creation_raw, holds, replicable}`.
///
/// `creation_raw` is kept distinct from the parsed `creation_time` because
/// it is the opaque, comparable value the planner matches on (guards
/// against same-name-different-content after a recreate) — in practice the
/// ZFS `creation` property's raw integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub dataset: String,
    pub snapname: SnapshotName,
    pub creation_time: DateTime<Utc>,
    pub creation_raw: i64,
    pub holds: bool,
    pub replicable: bool,
}

impl SnapshotRecord {
    pub fn full_name(&self) -> String {
        format!("{}@{}", self.dataset, self.snapname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_descendants() {
        let ds = Dataset::new("tank/data/a", DatasetType::Filesystem);
        assert!(ds.is_under("tank/data"));
        assert!(ds.is_under("tank/data/a"));
        assert!(!ds.is_under("tank/databoard"));
    }

    #[test]
    fn pool_is_derived_from_name() {
        let ds = Dataset::new("tank/data", DatasetType::Filesystem);
        assert_eq!(ds.pool, "tank");
    }
}
