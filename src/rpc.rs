//! Peer RPC capability (design notes §9): `call_sync`, `call_task_sync`,
//! `call_task_sync_with_progress`, `disconnect`.
//!
//! Built on an `openssh::Session`, the same way the connection wrapper this
//! is grounded on drives a remote binary over SSH: it execs this same
//! binary's `rpc` subcommand on the peer with a JSON argument blob and
//! parses a JSON result off stdout. Two connections to the same peer are
//! independent; there is no shared pool.

use std::time::Duration;

use openssh::{KnownHosts, Session};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::ReplicationError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(7);

/// One connection to a peer, authenticated as the `replicator` service
/// identity over SSH.
pub struct PeerConnection {
    session: Session,
    host: String,
}

impl PeerConnection {
    pub async fn connect(user_host: &str, pinned_hostkey: Option<&str>) -> Result<Self, ReplicationError> {
        let known_hosts = if pinned_hostkey.is_some() {
            KnownHosts::Strict
        } else {
            KnownHosts::Add
        };

        let session = tokio::time::timeout(
            CONNECT_TIMEOUT,
            Session::connect(user_host, known_hosts),
        )
        .await
        .map_err(|_| ReplicationError::PeerUnreachable(format!("{user_host}: connect timed out")))?
        .map_err(|e| ReplicationError::PeerUnreachable(format!("{user_host}: {e}")))?;

        Ok(Self {
            session,
            host: user_host.to_string(),
        })
    }

    /// Invoke a stateless RPC method, returning its JSON result.
    pub async fn call_sync<T: DeserializeOwned>(
        &self,
        method: &str,
        args: &impl Serialize,
    ) -> Result<T, ReplicationError> {
        let payload = serde_json::to_string(args)
            .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?;
        let output = self
            .session
            .command("zreplicate")
            .arg("rpc")
            .arg(method)
            .arg(&payload)
            .output()
            .await
            .map_err(|e| ReplicationError::PeerUnreachable(format!("{}: {e}", self.host)))?;

        if !output.status.success() {
            return Err(ReplicationError::PeerUnreachable(format!(
                "{}: rpc {method} exited with {}: {}",
                self.host,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            ReplicationError::InvariantViolated(format!("malformed rpc response for {method}: {e}"))
        })
    }

    /// Invoke a long-running task and wait for its terminal result, without
    /// an intermediate progress stream.
    pub async fn call_task_sync<T: DeserializeOwned>(
        &self,
        task: &str,
        args: &impl Serialize,
    ) -> Result<T, ReplicationError> {
        self.call_sync(task, args).await
    }

    /// Invoke a long-running task, forwarding each progress line (JSON,
    /// one object per line on stdout, terminal result on the last line) to
    /// `on_progress`.
    pub async fn call_task_sync_with_progress<T: DeserializeOwned>(
        &self,
        task: &str,
        args: &impl Serialize,
        mut on_progress: impl FnMut(Value),
    ) -> Result<T, ReplicationError> {
        let payload = serde_json::to_string(args)
            .map_err(|e| ReplicationError::InvariantViolated(e.to_string()))?;
        let output = self
            .session
            .command("zreplicate")
            .arg("rpc")
            .arg(task)
            .arg(&payload)
            .arg("--progress")
            .output()
            .await
            .map_err(|e| ReplicationError::PeerUnreachable(format!("{}: {e}", self.host)))?;

        if !output.status.success() {
            return Err(ReplicationError::PeerUnreachable(format!(
                "{}: rpc {task} exited with {}: {}",
                self.host,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut lines = text.lines().peekable();
        let mut last = None;
        while let Some(line) = lines.next() {
            let value: Value = serde_json::from_str(line).map_err(|e| {
                ReplicationError::InvariantViolated(format!("malformed progress line: {e}"))
            })?;
            if lines.peek().is_some() {
                on_progress(value);
            } else {
                last = Some(value);
            }
        }

        let last = last.ok_or_else(|| {
            ReplicationError::InvariantViolated(format!("rpc {task} produced no output"))
        })?;
        serde_json::from_value(last).map_err(|e| {
            ReplicationError::InvariantViolated(format!("malformed terminal result for {task}: {e}"))
        })
    }

    pub async fn disconnect(self) -> Result<(), ReplicationError> {
        self.session
            .close()
            .await
            .map_err(|e| ReplicationError::PeerUnreachable(format!("{}: {e}", self.host)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_timeout_matches_transport_contract() {
        assert_eq!(CONNECT_TIMEOUT, Duration::from_secs(7));
    }
}
