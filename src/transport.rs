//! Stream transport (C5): pipes a `zfs send` into an SSH-framed connection
//! to the peer's `zfs receive`, optionally through a compression filter and
//! a bandwidth limiter.
//!
//! SSH is invoked as a raw subprocess with the exact cipher-profile flag
//! sets rather than through `openssh::Session`, since the transport needs a
//! long-lived piped stdin/stdout it fully controls — the same shell-out
//! idiom the connection wrapper this crate is built on uses for copying
//! raw bytes over a session. No RSA/SSH key crate is pulled in for the
//! host-key check; `ssh-keyscan` is shelled out to instead, matching how
//! this codebase treats SSH key material as an external tool's job.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::error::ReplicationError;
use crate::zfs;

const BUFFER_SIZE: usize = 1024 * 1024;
const CONNECT_TIMEOUT_SECS: u64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherProfile {
    Normal,
    Fast,
    None,
}

impl CipherProfile {
    pub fn ssh_args(self) -> Vec<&'static str> {
        match self {
            CipherProfile::Normal => vec!["-o", "BatchMode=yes", "-o", "ConnectTimeout=7"],
            CipherProfile::Fast => vec![
                "-c",
                "arcfour256,arcfour128,blowfish-cbc,aes128-ctr,aes192-ctr,aes256-ctr",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=7",
            ],
            CipherProfile::None => vec![
                "-ononeenabled=yes",
                "-ononeswitch=yes",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=7",
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Pigz,
    Plzip,
    Lz4,
    Xz,
}

impl Compression {
    fn encode_command(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Pigz => Some("pigz"),
            Compression::Plzip => Some("plzip"),
            Compression::Lz4 => Some("lz4"),
            Compression::Xz => Some("xz"),
        }
    }

    fn decode_args(self) -> Option<(&'static str, &'static [&'static str])> {
        match self {
            Compression::None => None,
            Compression::Pigz => Some(("pigz", &["-d"])),
            Compression::Plzip => Some(("plzip", &["-d"])),
            Compression::Lz4 => Some(("lz4", &["-d"])),
            Compression::Xz => Some(("xz", &["-d"])),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub remote: String,
    pub remote_port: String,
    pub remote_hostkey: String,
    pub remote_pool: String,
    pub cipher: CipherProfile,
    pub compression: Compression,
    /// Bytes per second; `0` means unlimited.
    pub bandwidth_limit: u64,
}

/// Hand-rolled token bucket. No rate-limiter crate is part of this
/// codebase's dependency stack, so bandwidth throttling is implemented
/// directly rather than reached for.
struct TokenBucket {
    capacity: u64,
    tokens: u64,
    last_refill: Instant,
    rate_per_sec: u64,
}

impl TokenBucket {
    fn new(rate_per_sec: u64) -> Self {
        Self {
            capacity: rate_per_sec.max(1),
            tokens: rate_per_sec.max(1),
            last_refill: Instant::now(),
            rate_per_sec,
        }
    }

    async fn take(&mut self, mut amount: u64) {
        if self.rate_per_sec == 0 {
            return;
        }
        while amount > 0 {
            let elapsed = self.last_refill.elapsed();
            let refill = (elapsed.as_secs_f64() * self.rate_per_sec as f64) as u64;
            if refill > 0 {
                self.tokens = (self.tokens + refill).min(self.capacity);
                self.last_refill = Instant::now();
            }
            if self.tokens == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            let take = amount.min(self.tokens);
            self.tokens -= take;
            amount -= take;
        }
    }
}

/// Verify the peer's published host key against the pinned fingerprint.
/// Fails with `PeerUntrusted` if `ssh-keyscan` can't reach the host or the
/// key doesn't match.
pub async fn verify_host_key(opts: &TransportOptions) -> Result<(), ReplicationError> {
    let output = Command::new("ssh-keyscan")
        .args(["-p", &opts.remote_port, &opts.remote])
        .output()
        .await
        .map_err(|e| ReplicationError::PeerUntrusted(format!("ssh-keyscan failed: {e}")))?;

    if !output.status.success() {
        return Err(ReplicationError::PeerUntrusted(format!(
            "ssh-keyscan exited with {}",
            output.status
        )));
    }

    let scanned = String::from_utf8_lossy(&output.stdout);
    let found = scanned
        .lines()
        .any(|line| line.contains(opts.remote_hostkey.trim()));

    if opts.remote_hostkey.is_empty() || !found {
        return Err(ReplicationError::PeerUntrusted(format!(
            "no matching host key for {}",
            opts.remote
        )));
    }
    Ok(())
}

fn spawn_ssh_pipeline(opts: &TransportOptions, remote_command: &str) -> std::io::Result<Child> {
    let mut cmd = Command::new("ssh");
    cmd.args(opts.cipher.ssh_args())
        .arg("-p")
        .arg(&opts.remote_port)
        .arg(&opts.remote)
        .arg(remote_command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd.spawn()
}

/// Execute one planned `SendStream`: source-side `zfs send` piped (via an
/// optional local compression filter and a bandwidth limiter) into an SSH
/// connection running the peer's `zfs receive -F -d <pool>` (through a
/// matching decompression filter, if any). Returns bytes actually sent.
pub async fn send_stream(
    opts: &TransportOptions,
    localfs: &str,
    snapshot: &str,
    anchor: Option<&str>,
) -> Result<u64, ReplicationError> {
    verify_host_key(opts).await?;

    let full_anchor = anchor.map(|a| format!("{localfs}@{a}"));
    let mut send = zfs::spawn_send(localfs, snapshot, full_anchor.as_deref())
        .map_err(|e| ReplicationError::StreamFailed(format!("zfs send: {e}")))?;

    let remote_command = match opts.compression.decode_args() {
        Some((bin, args)) => format!(
            "{bin} {} | zfs receive -F -d {}",
            args.join(" "),
            opts.remote_pool
        ),
        None => format!("zfs receive -F -d {}", opts.remote_pool),
    };

    let mut ssh = spawn_ssh_pipeline(opts, &remote_command)
        .map_err(|e| ReplicationError::PeerUnreachable(format!("ssh: {e}")))?;

    let mut send_stdout = send
        .stdout
        .take()
        .ok_or_else(|| ReplicationError::StreamFailed("zfs send: no stdout".into()))?;
    let mut ssh_stdin = ssh
        .stdin
        .take()
        .ok_or_else(|| ReplicationError::PeerUnreachable("ssh: no stdin".into()))?;

    let mut encoder = match opts.compression.encode_command() {
        Some(bin) => Some(
            Command::new(bin)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| ReplicationError::StreamFailed(format!("{bin}: {e}")))?,
        ),
        None => None,
    };

    let mut bucket = TokenBucket::new(opts.bandwidth_limit);
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total_sent: u64 = 0;

    let copy_result: Result<(), ReplicationError> = async {
        if let Some(encoder) = encoder.as_mut() {
            let mut encoder_stdin = encoder
                .stdin
                .take()
                .ok_or_else(|| ReplicationError::StreamFailed("compressor: no stdin".into()))?;
            let mut encoder_stdout = encoder
                .stdout
                .take()
                .ok_or_else(|| ReplicationError::StreamFailed("compressor: no stdout".into()))?;

            let feed = async {
                tokio::io::copy(&mut send_stdout, &mut encoder_stdin)
                    .await
                    .map_err(|e| ReplicationError::StreamFailed(format!("feeding compressor: {e}")))?;
                encoder_stdin
                    .shutdown()
                    .await
                    .map_err(|e| ReplicationError::StreamFailed(format!("compressor stdin shutdown: {e}")))
            };

            let drain = async {
                loop {
                    let n = encoder_stdout
                        .read(&mut buf)
                        .await
                        .map_err(|e| ReplicationError::StreamFailed(format!("read from compressor: {e}")))?;
                    if n == 0 {
                        break;
                    }
                    bucket.take(n as u64).await;
                    ssh_stdin
                        .write_all(&buf[..n])
                        .await
                        .map_err(|e| ReplicationError::PeerUnreachable(format!("write to ssh: {e}")))?;
                    total_sent += n as u64;
                }
                ssh_stdin
                    .shutdown()
                    .await
                    .map_err(|e| ReplicationError::PeerUnreachable(format!("ssh stdin shutdown: {e}")))
            };

            let (feed_result, drain_result) = tokio::join!(feed, drain);
            feed_result?;
            drain_result?;
        } else {
            loop {
                let n = send_stdout
                    .read(&mut buf)
                    .await
                    .map_err(|e| ReplicationError::StreamFailed(format!("read from zfs send: {e}")))?;
                if n == 0 {
                    break;
                }
                bucket.take(n as u64).await;
                ssh_stdin
                    .write_all(&buf[..n])
                    .await
                    .map_err(|e| ReplicationError::PeerUnreachable(format!("write to ssh: {e}")))?;
                total_sent += n as u64;
            }
            ssh_stdin
                .shutdown()
                .await
                .map_err(|e| ReplicationError::PeerUnreachable(format!("ssh stdin shutdown: {e}")))?;
        }
        Ok(())
    }
    .await;

    let send_status = send
        .wait()
        .await
        .map_err(|e| ReplicationError::StreamFailed(format!("zfs send wait: {e}")))?;
    let encoder_status = match encoder.as_mut() {
        Some(enc) => Some(
            enc.wait()
                .await
                .map_err(|e| ReplicationError::StreamFailed(format!("compressor wait: {e}")))?,
        ),
        None => None,
    };
    let ssh_output = ssh
        .wait_with_output()
        .await
        .map_err(|e| ReplicationError::PeerUnreachable(format!("ssh wait: {e}")))?;

    copy_result?;

    if !send_status.success() {
        let mut stderr = String::new();
        if let Some(mut s) = send.stderr.take() {
            let _ = s.read_to_string(&mut stderr).await;
        }
        return Err(ReplicationError::StreamFailed(format!(
            "zfs send exited with {send_status}: {stderr}"
        )));
    }

    if let Some(status) = encoder_status {
        if !status.success() {
            return Err(ReplicationError::StreamFailed(format!(
                "compressor exited with {status}"
            )));
        }
    }

    if !ssh_output.status.success() {
        return Err(ReplicationError::StreamFailed(format!(
            "peer zfs receive exited with {}: {}",
            ssh_output.status,
            String::from_utf8_lossy(&ssh_output.stderr)
        )));
    }

    Ok(total_sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_profile_matches_flag_set() {
        assert_eq!(
            CipherProfile::Normal.ssh_args(),
            vec!["-o", "BatchMode=yes", "-o", "ConnectTimeout=7"]
        );
    }

    #[test]
    fn fast_profile_matches_flag_set() {
        let args = CipherProfile::Fast.ssh_args();
        assert_eq!(args[0], "-c");
        assert!(args[1].contains("arcfour256"));
    }

    #[test]
    fn none_profile_matches_flag_set() {
        let args = CipherProfile::None.ssh_args();
        assert_eq!(args[0], "-ononeenabled=yes");
        assert_eq!(args[1], "-ononeswitch=yes");
    }

    #[test]
    fn buffer_size_is_one_mebibyte() {
        assert_eq!(BUFFER_SIZE, 1024 * 1024);
    }

    #[test]
    fn connect_timeout_is_seven_seconds() {
        assert_eq!(CONNECT_TIMEOUT_SECS, 7);
    }

    #[tokio::test]
    async fn unlimited_bucket_never_blocks() {
        let mut bucket = TokenBucket::new(0);
        bucket.take(10_000_000).await;
    }

    #[test]
    fn encoder_and_decoder_agree_on_the_binary() {
        for c in [Compression::Pigz, Compression::Plzip, Compression::Lz4, Compression::Xz] {
            let encoder = c.encode_command().unwrap();
            let (decoder, _) = c.decode_args().unwrap();
            assert_eq!(encoder, decoder);
        }
        assert!(Compression::None.encode_command().is_none());
    }
}
