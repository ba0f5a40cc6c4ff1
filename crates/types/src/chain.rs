//! Chain identity and protocol versioning.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// The Bitcoin network the node is bound to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Stable tag used for digests and config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    /// Wire byte used in handshake packets.
    pub fn wire_id(&self) -> u8 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet => 1,
            Network::Regtest => 2,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ChainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(ChainParseError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Fixed 32-byte protocol id: SHA-256("OP_NET").
pub fn protocol_id() -> [u8; 32] {
    static ID: Lazy<[u8; 32]> = Lazy::new(|| Sha256::digest(b"OP_NET").into());
    *ID
}

/// Network-specific 32-byte chain identifier stamped onto the contract
/// execution environment.
pub fn chain_identifier(network: Network) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"OP_NET:");
    hasher.update(network.as_str().as_bytes());
    hasher.finalize().into()
}

/// Network identity handed to plugin workers on load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub network: Network,
    pub chain_id: u32,
    /// The 32-byte chain identifier, hex encoded.
    pub chain_identifier: String,
}

impl NetworkInfo {
    pub fn new(network: Network, chain_id: u32) -> Self {
        Self { network, chain_id, chain_identifier: hex::encode(chain_identifier(network)) }
    }
}

/// Protocol version advertised during the p2p handshake.
///
/// Compatibility: major must match, minor must be at least ours, patch is
/// ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ProtocolVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self { major, minor, patch }
    }

    /// Whether a peer advertising `other` may talk to a node running `self`.
    pub fn accepts(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major && other.minor >= self.minor
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ChainParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|p| p.parse::<u16>().ok())
                .ok_or_else(|| ChainParseError::InvalidVersion(s.to_string()))
        };
        let version = ProtocolVersion { major: next()?, minor: next()?, patch: next()? };
        if parts.next().is_some() {
            return Err(ChainParseError::InvalidVersion(s.to_string()));
        }
        Ok(version)
    }
}

/// Errors parsing chain identity values from config or the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainParseError {
    #[error("unknown network: {0}")]
    UnknownNetwork(String),
    #[error("invalid protocol version: {0}")]
    InvalidVersion(String),
}
