//! Typed error kinds for the replication engine (spec §7).
//!
//! These carry the eight named error kinds across component boundaries.
//! Call sites that don't need to match on a specific kind just propagate
//! through `color_eyre::Report` via `wrap_err`, the way the rest of this
//! crate handles errors.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// Snapshot-name parse failure.
    InvalidName(String),
    /// No free `-<seq>` suffix within a minute (after 99 collisions).
    NameExhausted(String),
    /// Dataset, link, or peer not present.
    NotFound(String),
    /// Link name or peer-side share/container collision.
    AlreadyExists(String),
    /// Network or authentication failure talking to the other node.
    PeerUnreachable(String),
    /// Host-key mismatch or missing pin.
    PeerUntrusted(String),
    /// Non-zero exit of `zfs send` or `zfs receive`.
    StreamFailed(String),
    /// Partners count != 2, master not in partners, etc.
    InvariantViolated(String),
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationError::InvalidName(s) => write!(f, "invalid snapshot name: {s}"),
            ReplicationError::NameExhausted(s) => write!(f, "name exhausted: {s}"),
            ReplicationError::NotFound(s) => write!(f, "not found: {s}"),
            ReplicationError::AlreadyExists(s) => write!(f, "already exists: {s}"),
            ReplicationError::PeerUnreachable(s) => write!(f, "peer unreachable: {s}"),
            ReplicationError::PeerUntrusted(s) => write!(f, "peer untrusted: {s}"),
            ReplicationError::StreamFailed(s) => write!(f, "stream failed: {s}"),
            ReplicationError::InvariantViolated(s) => write!(f, "invariant violated: {s}"),
        }
    }
}

impl std::error::Error for ReplicationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = ReplicationError::PeerUntrusted("fingerprint mismatch for host b".into());
        assert!(err.to_string().contains("fingerprint mismatch"));
    }
}
