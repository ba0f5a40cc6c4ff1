//! Node configuration.
//!
//! A single YAML file selected on the command line. Every section has
//! defaults so a bare file (or none of a section) yields a runnable regtest
//! node.

use opnet_types::Network;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// The protocol version this build speaks.
pub const CURRENT_PROTOCOL_VERSION: &str = "1.0.0";

/// Errors loading or interpreting the node configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid hex value for {field}: {value}")]
    InvalidHex { field: &'static str, value: String },
}

/// Top-level node configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub network: Network,
    pub chain_id: u32,
    pub data_dir: PathBuf,
    pub p2p: P2pConfig,
    pub workers: WorkerCounts,
    pub plugins: PluginSettings,
    pub rpc: RpcSettings,
    /// Operator instruction to rewind plugins to a prior height and resync.
    pub reindex: Option<ReindexSettings>,
}

/// Peer networking policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub listen_addr: String,
    /// When enabled, peers must present the local network and chain id.
    pub verify_network: bool,
    /// Per-protocol-version trusted checksums, hex encoded.
    pub trusted_checksums: BTreeMap<String, String>,
    /// Seconds a session may remain unauthenticated.
    pub auth_timeout_secs: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9800".to_string(),
            verify_network: true,
            trusted_checksums: BTreeMap::new(),
            auth_timeout_secs: 30,
        }
    }
}

/// Worker population per role.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCounts {
    pub rpc: usize,
    pub indexer: usize,
    pub mempool: usize,
    pub p2p: usize,
    pub api: usize,
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self { rpc: 1, indexer: 1, mempool: 1, p2p: 1, api: 1 }
    }
}

/// Plugin runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    pub dir: PathBuf,
    pub worker_count: usize,
    pub default_timeout_ms: u64,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self { dir: PathBuf::from("plugins"), worker_count: 2, default_timeout_ms: 30_000 }
    }
}

/// Wrapped Bitcoin node RPC settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// JSON-RPC endpoint of the wrapped Bitcoin node. Absent means the RPC
    /// fan-out worker is not started.
    pub bitcoin_rpc_url: Option<String>,
    pub bitcoin_rpc_user: Option<String>,
    pub bitcoin_rpc_password: Option<String>,
    pub poll_interval_ms: u64,
    /// Bound of the sub-pool serving heavy `Call` requests.
    pub call_pool_size: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            bitcoin_rpc_url: None,
            bitcoin_rpc_user: None,
            bitcoin_rpc_password: None,
            poll_interval_ms: 1_000,
            call_pool_size: 4,
        }
    }
}

/// Reindex directive supplied by the operator.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ReindexSettings {
    pub enabled: bool,
    pub from_block: u64,
}

impl NodeConfig {
    /// Load the configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_yaml::from_str(&raw)?;
        tracing::info!(target: "opnet::config", network = %config.network, path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// The trusted checksum registered for a protocol version, decoded.
    pub fn trusted_checksum(&self, version: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        match self.p2p.trusted_checksums.get(version) {
            None => Ok(None),
            Some(value) => hex::decode(value)
                .map(Some)
                .map_err(|_| ConfigError::InvalidHex { field: "trusted_checksums", value: value.clone() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn defaults_are_runnable() {
        let config = NodeConfig::default();
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.workers.rpc, 1);
        assert_eq!(config.plugins.worker_count, 2);
        assert_eq!(config.rpc.poll_interval_ms, 1_000);
        assert!(config.reindex.is_none());
    }

    #[test]
    fn loads_partial_yaml() -> eyre::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            "network: regtest\np2p:\n  trusted_checksums:\n    \"1.0.0\": \"aabbcc\"\nreindex:\n  enabled: true\n  from_block: 50\n"
        )?;
        let config = NodeConfig::load(file.path())?;
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.trusted_checksum("1.0.0")?, Some(vec![0xaa, 0xbb, 0xcc]));
        assert_eq!(config.trusted_checksum("9.9.9")?, None);
        let reindex = config.reindex.unwrap();
        assert!(reindex.enabled);
        assert_eq!(reindex.from_block, 50);
        Ok(())
    }

    #[test]
    fn bad_checksum_hex_is_an_error() {
        let mut config = NodeConfig::default();
        config.p2p.trusted_checksums.insert("1.0.0".into(), "not-hex".into());
        assert!(config.trusted_checksum("1.0.0").is_err());
    }
}
