//! Shared types for the OP_NET node core.
//!
//! Everything that crosses a crate boundary lives here: the inter-worker
//! message envelope, chain identity constants, the global consensus height,
//! the sort view of transactions, and the payload types carried by RPC
//! envelopes.

pub mod chain;
pub mod consensus;
pub mod envelope;
pub mod rpc;
pub mod task;
pub mod transaction;

pub use chain::{chain_identifier, protocol_id, Network, NetworkInfo, ProtocolVersion};
pub use consensus::OpnetConsensus;
pub use envelope::{
    duplex_port, LinkDirection, MessageEnvelope, MessagePort, PluginNotification, ThreadData,
    ThreadMessage, WorkerRole, ENVELOPE_CHANNEL_CAPACITY,
};
pub use rpc::{
    BroadcastResult, CallRequest, CallResult, HeaderValidation, NetEvent, PartialBlockHeader,
    PeerRecord, RawCallResult, RawNetEvent, RpcCall, StoredBlockHeader, U256,
};
pub use task::TaskId;
pub use transaction::{SortableTransaction, Txid, Wtxid};

/// Milliseconds since the unix epoch.
///
/// The node stamps sync-state updates and ping frames with this clock.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
