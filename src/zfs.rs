//! Async ZFS command wrapper.
//!
//! Local invocation of `zfs` subprocesses for snapshot lifecycle, inventory
//! listing, and the two command forms the stream transport pipes together
//! (`zfs send`, `zfs receive`). Uses `tokio::process::Command` rather than a
//! blocking process runner since the rest of the crate is async end to end.

use std::fmt;
use std::process::Stdio;

use byte_unit::Byte;
use chrono::{TimeZone, Utc};
use itertools::Itertools;
use tokio::process::{Child, Command};

use crate::dataset::{DatasetType, SnapshotRecord};
use crate::name::SnapshotName;

pub const REPLICATE_PROPERTY: &str = "org.freenas:replicate";

#[derive(Debug)]
pub enum ZfsError {
    Spawn(std::io::Error),
    NonZeroExit { command: String, stderr: String },
    UnexpectedOutput { command: String, detail: String },
}

impl fmt::Display for ZfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZfsError::Spawn(e) => write!(f, "failed to spawn zfs: {e}"),
            ZfsError::NonZeroExit { command, stderr } => {
                write!(f, "`{command}` failed: {stderr}")
            }
            ZfsError::UnexpectedOutput { command, detail } => {
                write!(f, "unexpected output from `{command}`: {detail}")
            }
        }
    }
}

impl std::error::Error for ZfsError {}

impl From<std::io::Error> for ZfsError {
    fn from(e: std::io::Error) -> Self {
        ZfsError::Spawn(e)
    }
}

async fn run(args: &[&str]) -> Result<String, ZfsError> {
    let output = Command::new("zfs").args(args).output().await?;
    if !output.status.success() {
        return Err(ZfsError::NonZeroExit {
            command: format!("zfs {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// List replicable-or-not snapshots of `dataset` (and children, if
/// `recursive`), newest first is not guaranteed here; callers sort.
pub async fn list_snapshots(
    dataset: &str,
    recursive: bool,
) -> Result<Vec<SnapshotRecord>, ZfsError> {
    let mut args = vec!["list", "-H", "-p", "-t", "snapshot"];
    if recursive {
        args.push("-r");
    }
    args.extend(["-o", "name,creation", dataset]);
    let out = run(&args).await?;
    let mut records = parse_snapshot_lines(&out)?;

    for record in &mut records {
        let prop = get_property(&record.full_name(), REPLICATE_PROPERTY).await?;
        record.replicable = prop.as_deref() == Some("yes");
        let held = get_property(&record.full_name(), "userrefs").await?;
        record.holds = held.map(|v| v != "0").unwrap_or(false);
    }
    Ok(records)
}

fn parse_snapshot_lines(out: &str) -> Result<Vec<SnapshotRecord>, ZfsError> {
    out.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let (full_name, creation_raw) = line
                .split('\t')
                .collect_tuple()
                .ok_or_else(|| ZfsError::UnexpectedOutput {
                    command: "zfs list".into(),
                    detail: line.to_string(),
                })?;
            let (dataset, snap) =
                full_name
                    .split_once('@')
                    .ok_or_else(|| ZfsError::UnexpectedOutput {
                        command: "zfs list".into(),
                        detail: full_name.to_string(),
                    })?;
            let creation_raw: i64 = creation_raw
                .trim()
                .parse()
                .map_err(|_| ZfsError::UnexpectedOutput {
                    command: "zfs list".into(),
                    detail: creation_raw.to_string(),
                })?;
            let creation_time = Utc
                .timestamp_opt(creation_raw, 0)
                .single()
                .ok_or_else(|| ZfsError::UnexpectedOutput {
                    command: "zfs list".into(),
                    detail: format!("bad timestamp {creation_raw}"),
                })?;
            let snapname = SnapshotName::parse(snap).unwrap_or_else(|_| {
                SnapshotName::new(snap, creation_time, crate::name::Lifetime {
                    amount: 0,
                    unit: crate::name::LifetimeUnit::Hour,
                })
            });
            Ok(SnapshotRecord {
                dataset: dataset.to_string(),
                snapname,
                creation_time,
                creation_raw,
                holds: false,
                replicable: false,
            })
        })
        .collect()
}

pub async fn get_property(object: &str, property: &str) -> Result<Option<String>, ZfsError> {
    let out = run(&["get", "-H", "-o", "value", property, object]).await?;
    let value = out.trim();
    if value.is_empty() || value == "-" {
        Ok(None)
    } else {
        Ok(Some(value.to_string()))
    }
}

pub async fn set_property(object: &str, property: &str, value: &str) -> Result<(), ZfsError> {
    run(&["set", &format!("{property}={value}"), object]).await?;
    Ok(())
}

pub async fn create_snapshot(full_name: &str, recursive: bool) -> Result<(), ZfsError> {
    let mut args = vec!["snapshot"];
    if recursive {
        args.push("-r");
    }
    args.push(full_name);
    run(&args).await?;
    Ok(())
}

pub async fn snapshot_exists(full_name: &str) -> Result<bool, ZfsError> {
    let dataset = full_name
        .split_once('@')
        .map(|(d, _)| d)
        .unwrap_or(full_name);
    match list_snapshots(dataset, false).await {
        Ok(snaps) => Ok(snaps.iter().any(|s| s.full_name() == full_name)),
        Err(ZfsError::NonZeroExit { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Bulk-destroy a batch of fully qualified snapshot names sharing one
/// dataset, as `zfs destroy dataset@s1,s2,s3`.
pub async fn destroy_snapshots(dataset: &str, snapnames: &[String]) -> Result<(), ZfsError> {
    if snapnames.is_empty() {
        return Ok(());
    }
    let target = format!("{dataset}@{}", snapnames.join(","));
    run(&["destroy", &target]).await?;
    Ok(())
}

pub async fn destroy_dataset(dataset: &str, recursive: bool) -> Result<(), ZfsError> {
    let mut args = vec!["destroy"];
    if recursive {
        args.push("-r");
    }
    args.push(dataset);
    run(&args).await?;
    Ok(())
}

pub async fn dataset_exists(dataset: &str) -> Result<bool, ZfsError> {
    match run(&["list", "-H", "-o", "name", dataset]).await {
        Ok(_) => Ok(true),
        Err(ZfsError::NonZeroExit { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// List `dataset` and, if `recursive`, every descendant filesystem or
/// volume beneath it.
pub async fn list_datasets(
    dataset: &str,
    recursive: bool,
) -> Result<Vec<crate::dataset::Dataset>, ZfsError> {
    let mut args = vec!["list", "-H", "-p", "-t", "filesystem,volume", "-o", "name,type"];
    if recursive {
        args.push("-r");
    }
    args.push(dataset);
    let out = run(&args).await?;
    out.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let (name, kind) = line.split('\t').collect_tuple().ok_or_else(|| {
                ZfsError::UnexpectedOutput {
                    command: "zfs list".into(),
                    detail: line.to_string(),
                }
            })?;
            let kind = match kind.trim() {
                "volume" => DatasetType::Volume,
                _ => DatasetType::Filesystem,
            };
            Ok(crate::dataset::Dataset::new(name, kind))
        })
        .collect()
}

pub async fn dataset_type(dataset: &str) -> Result<DatasetType, ZfsError> {
    let out = run(&["get", "-H", "-o", "value", "type", dataset]).await?;
    match out.trim() {
        "volume" => Ok(DatasetType::Volume),
        _ => Ok(DatasetType::Filesystem),
    }
}

/// Estimated byte size of a `zfs send -n -P` dry run, parsed from the
/// `size\t<bytes>` line ZFS prints with `-P`.
pub async fn estimate_send_size(
    dataset: &str,
    snapshot: &str,
    anchor: Option<&str>,
) -> Result<u64, ZfsError> {
    let full = format!("{dataset}@{snapshot}");
    let mut args = vec!["send", "-n", "-P"];
    if let Some(anchor) = anchor {
        args.push("-i");
        args.push(anchor);
    }
    args.push(&full);
    let out = run(&args).await?;
    out.lines()
        .find_map(|l| l.strip_prefix("size\t"))
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| ZfsError::UnexpectedOutput {
            command: "zfs send -n -P".into(),
            detail: out,
        })
}

/// Spawn `zfs send [-i anchor] dataset@snapshot`, stdout piped for the
/// transport to forward over the peer connection.
pub fn spawn_send(dataset: &str, snapshot: &str, anchor: Option<&str>) -> std::io::Result<Child> {
    let full = format!("{dataset}@{snapshot}");
    let mut cmd = Command::new("zfs");
    cmd.arg("send");
    if let Some(anchor) = anchor {
        cmd.arg("-i").arg(anchor);
    }
    cmd.arg(&full).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.spawn()
}

/// Spawn `zfs receive -F -d pool`, stdin piped for the transport to feed.
pub fn spawn_receive(pool: &str) -> std::io::Result<Child> {
    Command::new("zfs")
        .args(["receive", "-F", "-d", pool])
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

/// Renders a byte count the way ZFS's own `used` column prints it, for
/// progress and status output.
pub fn format_bytes(bytes: u64) -> String {
    Byte::from_bytes(bytes as u128)
        .get_appropriate_unit(false)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snapshot_listing_lines() {
        let out = "tank/data@auto-20240101.0000-7d\t1704067200\n";
        let records = parse_snapshot_lines(out).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].dataset, "tank/data");
        assert_eq!(records[0].creation_raw, 1704067200);
    }

    #[test]
    fn ignores_blank_lines() {
        let out = "tank/data@auto-20240101.0000-7d\t1704067200\n\n";
        let records = parse_snapshot_lines(out).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn rejects_malformed_line() {
        let out = "garbage-with-no-tab\n";
        assert!(parse_snapshot_lines(out).is_err());
    }
}
