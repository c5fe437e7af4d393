//! TOML configuration, parsed the way the async ZFS backup tool's config
//! module does: `serde`-derived structs plus an eager `validate()` pass so
//! bad config fails before any ZFS or network call is attempted.

use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::transport::{CipherProfile, Compression};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub peer: PeerConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    pub state_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PeerConfig {
    pub remote: String,
    #[serde(default = "default_port")]
    pub remote_port: String,
    pub remote_hostkey: String,
}

fn default_port() -> String {
    "22".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub cipher: CipherName,
    #[serde(default)]
    pub compression: CompressionName,
    #[serde(default)]
    pub bandwidth_limit: String,
    #[serde(default)]
    pub followdelete: bool,
    #[serde(default)]
    pub recursive: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            cipher: CipherName::Normal,
            compression: CompressionName::None,
            bandwidth_limit: "0".to_string(),
            followdelete: false,
            recursive: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CipherName {
    #[default]
    Normal,
    Fast,
    Disabled,
}

impl From<CipherName> for CipherProfile {
    fn from(name: CipherName) -> Self {
        match name {
            CipherName::Normal => CipherProfile::Normal,
            CipherName::Fast => CipherProfile::Fast,
            CipherName::Disabled => CipherProfile::None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionName {
    #[default]
    None,
    Pigz,
    Plzip,
    Lz4,
    Xz,
}

impl From<CompressionName> for Compression {
    fn from(name: CompressionName) -> Self {
        match name {
            CompressionName::None => Compression::None,
            CompressionName::Pigz => Compression::Pigz,
            CompressionName::Plzip => Compression::Plzip,
            CompressionName::Lz4 => Compression::Lz4,
            CompressionName::Xz => Compression::Xz,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Parse(toml::de::Error),
    InvalidBandwidthLimit(String),
    Io(std::io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "failed to parse config: {e}"),
            ConfigError::InvalidBandwidthLimit(s) => write!(f, "invalid bandwidth_limit {s:?}"),
            ConfigError::Io(e) => write!(f, "failed to read config: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn try_from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(ConfigError::Io)?;
        Self::try_from_toml(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.bandwidth_limit_bytes()?;
        Ok(())
    }

    /// Eagerly parse `bandwidth_limit` (`0` or a byte-unit string like
    /// `10MiB`) so a malformed value fails at load time, not mid-run.
    pub fn bandwidth_limit_bytes(&self) -> Result<u64, ConfigError> {
        let raw = self.replication.bandwidth_limit.trim();
        if raw.is_empty() || raw == "0" {
            return Ok(0);
        }
        byte_unit::Byte::from_str(raw)
            .map(|b| b.get_bytes() as u64)
            .map_err(|_| ConfigError::InvalidBandwidthLimit(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        state_dir = "/var/lib/zreplicate"

        [peer]
        remote = "backup-host"
        remote_hostkey = "SHA256:abc123"

        [replication]
        cipher = "FAST"
        compression = "lz4"
        bandwidth_limit = "10MiB"
        followdelete = true
        recursive = true
    "#;

    #[test]
    fn parses_full_config() {
        let config = Config::try_from_toml(SAMPLE).unwrap();
        assert_eq!(config.peer.remote, "backup-host");
        assert_eq!(config.peer.remote_port, "22");
        assert_eq!(config.replication.cipher, CipherName::Fast);
        assert!(config.replication.followdelete);
    }

    #[test]
    fn default_replication_block_is_normal_uncompressed() {
        let minimal = r#"
            state_dir = "/var/lib/zreplicate"
            [peer]
            remote = "backup-host"
            remote_hostkey = "SHA256:abc123"
        "#;
        let config = Config::try_from_toml(minimal).unwrap();
        assert_eq!(config.replication.cipher, CipherName::Normal);
        assert_eq!(config.replication.compression, CompressionName::None);
    }

    #[test]
    fn rejects_unparseable_bandwidth_limit() {
        let bad = SAMPLE.replace("10MiB", "not-a-size");
        let err = Config::try_from_toml(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBandwidthLimit(_)));
    }
}
