//! Persisted state: bi-directional link records and the process-wide
//! replication key pair (design notes §9).
//!
//! Links are serialized as JSON the same way `zcrab`'s status table treats
//! its configured-dataset state as the source of truth on disk rather than
//! reaching for an embedded database — there is exactly one collection
//! here and it is small.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum LinkRole {
    Master,
    Slave,
}

/// `{id, name, partners: exactly two "user@host", master, volumes, update_date}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BidirLink {
    pub id: String,
    pub name: String,
    pub partners: [String; 2],
    pub master: String,
    pub volumes: Vec<String>,
    pub update_date: DateTime<Utc>,
}

impl BidirLink {
    pub fn role_of(&self, node: &str) -> Option<LinkRole> {
        if !self.partners.contains(&node.to_string()) {
            return None;
        }
        Some(if self.master == node {
            LinkRole::Master
        } else {
            LinkRole::Slave
        })
    }

    pub fn slave(&self) -> Option<&str> {
        self.partners
            .iter()
            .find(|p| *p != &self.master)
            .map(|s| s.as_str())
    }

    /// `|partners| == 2`, `master` is one of them, both distinct.
    pub fn is_valid(&self) -> bool {
        self.partners[0] != self.partners[1] && self.partners.contains(&self.master)
    }
}

/// Split-brain reconciliation: the copy with the later `update_date` wins.
/// Neither side holds a pointer to the other's record; they are
/// reconciled purely by comparing `update_date`.
pub fn latest(local: Option<BidirLink>, peer: Option<BidirLink>) -> Option<BidirLink> {
    match (local, peer) {
        (Some(l), Some(p)) => Some(if p.update_date > l.update_date { p } else { l }),
        (Some(l), None) => Some(l),
        (None, Some(p)) => Some(p),
        (None, None) => None,
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "link store I/O error: {e}"),
            StoreError::Serde(e) => write!(f, "link store serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e)
    }
}

/// On-disk collection of `replication.bidir.links`, keyed by link name.
pub struct LinkStore {
    path: PathBuf,
}

impl LinkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<HashMap<String, BidirLink>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, links: &HashMap<String, BidirLink>) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(links)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, text).await?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Option<BidirLink>, StoreError> {
        Ok(self.load().await?.remove(name))
    }

    pub async fn put(&self, link: BidirLink) -> Result<(), StoreError> {
        let mut links = self.load().await?;
        links.insert(link.name.clone(), link);
        self.save(&links).await
    }

    pub async fn remove(&self, name: &str) -> Result<Option<BidirLink>, StoreError> {
        let mut links = self.load().await?;
        let removed = links.remove(name);
        self.save(&links).await?;
        Ok(removed)
    }
}

/// Generate the process-wide 2048-bit RSA key pair on first run. No RSA
/// crate is part of this codebase's dependency stack; `ssh-keygen` is
/// shelled out to instead, the same way SSH key material is treated as an
/// external tool's job everywhere else in this crate.
pub async fn generate_keypair(private_path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = private_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let status = Command::new("ssh-keygen")
        .args(["-t", "rsa", "-b", "2048", "-N", "", "-f"])
        .arg(private_path)
        .status()
        .await?;
    if !status.success() {
        return Err(StoreError::Io(std::io::Error::other(format!(
            "ssh-keygen exited with {status}"
        ))));
    }
    Ok(())
}

pub async fn read_public_key(private_path: &Path) -> Result<String, StoreError> {
    let public_path = private_path.with_extension("pub");
    Ok(tokio::fs::read_to_string(public_path).await?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(master: &str, update_date: DateTime<Utc>) -> BidirLink {
        BidirLink {
            id: "1".into(),
            name: "L".into(),
            partners: ["a@A".into(), "b@B".into()],
            master: master.into(),
            volumes: vec!["tank".into()],
            update_date,
        }
    }

    #[test]
    fn role_of_identifies_master_and_slave() {
        let l = link("a@A", Utc::now());
        assert_eq!(l.role_of("a@A"), Some(LinkRole::Master));
        assert_eq!(l.role_of("b@B"), Some(LinkRole::Slave));
        assert_eq!(l.role_of("c@C"), None);
    }

    #[test]
    fn slave_is_the_other_partner() {
        let l = link("a@A", Utc::now());
        assert_eq!(l.slave(), Some("b@B"));
    }

    #[test]
    fn validity_requires_master_among_distinct_partners() {
        assert!(link("a@A", Utc::now()).is_valid());
        let mut bad = link("a@A", Utc::now());
        bad.partners = ["a@A".into(), "a@A".into()];
        assert!(!bad.is_valid());
    }

    #[test]
    fn latest_picks_later_update_date() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(5);
        let old = link("a@A", t0);
        let new = link("b@B", t1);
        let winner = latest(Some(old), Some(new.clone())).unwrap();
        assert_eq!(winner, new);
    }

    #[test]
    fn latest_falls_back_to_whichever_side_is_present() {
        let only_local = link("a@A", Utc::now());
        assert_eq!(latest(Some(only_local.clone()), None), Some(only_local));
        let only_peer = link("b@B", Utc::now());
        assert_eq!(latest(None, Some(only_peer.clone())), Some(only_peer));
        assert_eq!(latest(None, None), None);
    }
}
