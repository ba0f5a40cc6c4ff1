//! Payload types carried by `RpcMethod` envelopes.

use crate::transaction::Txid;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

/// A 256-bit word as used by contract storage slots and values.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct U256(pub [u8; 32]);

impl U256 {
    /// Parse a hex string (with or without `0x`), left-padding to 32 bytes.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() > 64 || s.is_empty() {
            return None;
        }
        let padded = format!("{s:0>64}");
        let raw = hex::decode(padded).ok()?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&raw);
        Some(Self(out))
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U256(0x{})", hex::encode(self.0))
    }
}

/// Requests served by the RPC fan-out worker.
#[derive(Clone, Debug)]
pub enum RpcCall {
    /// Current cached block height.
    GetCurrentBlock,
    /// Raw transaction lookup.
    GetTx { txid: Txid },
    /// Checksum proof verification plus stored header lookup.
    ValidateBlockHeaders { header: PartialBlockHeader },
    /// Contract call executed in the bounded sub-pool.
    Call { request: CallRequest },
    /// Broadcast a raw transaction through the wrapped Bitcoin node.
    BroadcastTransaction { raw: Bytes },
}

/// A contract call request as received from the API surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallRequest {
    pub contract: String,
    pub calldata: Bytes,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub block_height: Option<u64>,
}

/// Contract call response as produced by the execution engine, before
/// normalization. Hex strings and decimal counters exactly as the engine
/// serializes them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCallResult {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub gas_used: String,
    #[serde(default)]
    pub changed_storage: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub events: HashMap<String, Vec<RawNetEvent>>,
    #[serde(default)]
    pub revert: Option<String>,
}

/// A raw contract event before normalization.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNetEvent {
    pub event_type: String,
    pub data: String,
}

/// Normalized contract call response.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallResult {
    pub result: Bytes,
    pub gas_used: u128,
    pub changed_storage: HashMap<String, HashMap<U256, U256>>,
    pub events: HashMap<String, Vec<NetEvent>>,
    pub revert: Option<String>,
}

/// A normalized contract event.
#[derive(Clone, Debug, PartialEq)]
pub struct NetEvent {
    pub event_type: String,
    pub data: Bytes,
}

/// Result of `ValidateBlockHeaders`.
///
/// Each branch may fail independently; failures surface as `None`, never as
/// errors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaderValidation {
    pub has_valid_proofs: Option<bool>,
    pub stored_block_header: Option<StoredBlockHeader>,
}

/// Result of `BroadcastTransaction`.
#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastResult {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Digest identifying the broadcast attempt, hex encoded.
    pub identifier: String,
}

/// A known peer advertised through `DiscoveryResponse`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub address: String,
}

/// A block header as persisted by the header repository.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredBlockHeader {
    pub height: u64,
    pub block_hash: [u8; 32],
    pub checksum_root: [u8; 32],
    pub checksum_proofs: Vec<[u8; 32]>,
}

/// The header fields a peer presents for checksum validation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartialBlockHeader {
    pub height: u64,
    pub block_hash: [u8; 32],
    pub checksum_root: [u8; 32],
    pub checksum_proofs: Vec<[u8; 32]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u256_parses_short_hex() {
        let one = U256::from_hex("0x1").unwrap();
        assert_eq!(one.0[31], 1);
        assert!(one.0[..31].iter().all(|b| *b == 0));
    }

    #[test]
    fn u256_rejects_oversized_hex() {
        let long = "f".repeat(65);
        assert!(U256::from_hex(&long).is_none());
        assert!(U256::from_hex("").is_none());
        assert!(U256::from_hex("zz").is_none());
    }
}
