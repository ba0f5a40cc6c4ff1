//! The typed inter-worker message envelope.
//!
//! Workers exchange [MessageEnvelope]s over owned duplex [MessagePort]s. The
//! payload is a closed sum type dispatched by `match`; there is no
//! stringly-typed discriminator. Channel endpoints travel inside the
//! `LinkThread` and `SetMessagePort` variants and are transferred exactly once
//! to the worker that will own them.

use crate::{rpc::RpcCall, task::TaskId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

pub use crate::rpc::{BroadcastResult, CallResult, HeaderValidation, PeerRecord};

/// Default bound of every worker sub-channel. Producers block (cooperative
/// yield) when the queue is saturated.
pub const ENVELOPE_CHANNEL_CAPACITY: usize = 1_024;

/// The role a worker population serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Rpc,
    Indexer,
    Mempool,
    P2p,
    Api,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerRole::Rpc => "rpc",
            WorkerRole::Indexer => "indexer",
            WorkerRole::Mempool => "mempool",
            WorkerRole::P2p => "p2p",
            WorkerRole::Api => "api",
        };
        f.write_str(name)
    }
}

/// One endpoint of a bidirectional worker channel.
#[derive(Debug)]
pub struct MessagePort {
    pub tx: mpsc::Sender<MessageEnvelope>,
    pub rx: mpsc::Receiver<MessageEnvelope>,
}

/// Build a connected pair of duplex ports.
pub fn duplex_port(capacity: usize) -> (MessagePort, MessagePort) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);
    (MessagePort { tx: a_tx, rx: a_rx }, MessagePort { tx: b_tx, rx: b_rx })
}

/// Which half of a thread link an endpoint serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkDirection {
    Rx,
    Tx,
}

/// An envelope routed between the fabric and its workers.
#[derive(Debug)]
pub struct MessageEnvelope {
    /// Correlation id; present on requests expecting a response.
    pub task_id: Option<TaskId>,
    /// Whether the envelope targets the parent process rather than a worker.
    pub to_server: bool,
    pub message: ThreadMessage,
}

impl MessageEnvelope {
    /// A request expecting a matching `ThreadResponse`.
    pub fn request(task_id: TaskId, message: ThreadMessage) -> Self {
        Self { task_id: Some(task_id), to_server: false, message }
    }

    /// A fire-and-forget notification.
    pub fn notify(message: ThreadMessage) -> Self {
        Self { task_id: None, to_server: false, message }
    }

    /// The response to a request carrying `task_id`.
    pub fn response(task_id: TaskId, data: ThreadData) -> Self {
        Self {
            task_id: Some(task_id),
            to_server: true,
            message: ThreadMessage::ThreadResponse { data },
        }
    }
}

/// Closed set of inter-worker message kinds.
#[derive(Debug)]
pub enum ThreadMessage {
    /// Response to a prior request; `data` resolves the caller's future.
    ThreadResponse { data: ThreadData },
    /// One endpoint of a freshly built worker-to-worker link.
    LinkThread { role: WorkerRole, direction: LinkDirection, port: MessagePort },
    /// Hands a worker its dedicated sub-channel endpoint.
    SetMessagePort { port: MessagePort },
    /// A worker asks the fabric for a direct link to a worker of `target`.
    LinkThreadRequest { target: WorkerRole },
    /// Cross-cutting request served by the RPC fan-out worker.
    RpcMethod(RpcCall),
    /// The indexer finished a block.
    BlockProcessed { height: u64 },
    /// Current indexer progress.
    CurrentIndexerBlock { height: u64 },
    /// Start indexing.
    StartIndexer,
    /// Graceful worker shutdown.
    ExitThread,
    /// Deserialize a raw block off the worker's thread.
    DeserializeBlock { raw: Bytes },
    /// The chain reorganized between the two heights.
    ChainReorg { from_height: u64, to_height: u64 },
    /// Request the current peer list.
    GetPeers,
    /// Plugin runtime traffic.
    Plugin(PluginNotification),
}

/// Plugin-observable events and plugin-originated traffic.
#[derive(Clone, Debug)]
pub enum PluginNotification {
    Ready { plugin_id: String },
    AllThreadsReady,
    BlockPreProcess { height: u64 },
    BlockPostProcess { height: u64 },
    BlockChange { height: u64 },
    EpochChange { epoch: u64 },
    EpochFinalized { epoch: u64 },
    Reorg { from_height: u64, to_height: u64 },
    RegisterRoutes { plugin_id: String, routes: Vec<String> },
    UnregisterRoutes { plugin_id: String },
    ExecuteRoute { route: String, payload: serde_json::Value },
    RouteResult { route: String, result: serde_json::Value },
    RegisterOpcodes { plugin_id: String, opcodes: Vec<u8> },
    UnregisterOpcodes { plugin_id: String },
    ExecuteWsHandler { handler: String, payload: serde_json::Value, client_id: String },
    WsResult { result: serde_json::Value },
}

/// The `data` field of a `ThreadResponse`.
#[derive(Clone, Debug, PartialEq)]
pub enum ThreadData {
    None,
    /// Transient failure encoded in the result envelope, never thrown.
    Error(String),
    Height(u64),
    RawTransaction(Option<Bytes>),
    HeaderValidation(HeaderValidation),
    Call(Box<CallResult>),
    Broadcast(BroadcastResult),
    Peers(Vec<PeerRecord>),
    Json(serde_json::Value),
}

impl ThreadData {
    pub fn is_error(&self) -> bool {
        matches!(self, ThreadData::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplex_ports_are_connected_both_ways() {
        let (mut a, mut b) = duplex_port(4);
        a.tx.send(MessageEnvelope::notify(ThreadMessage::StartIndexer)).await.unwrap();
        let received = b.rx.recv().await.unwrap();
        assert!(matches!(received.message, ThreadMessage::StartIndexer));

        b.tx.send(MessageEnvelope::notify(ThreadMessage::GetPeers)).await.unwrap();
        let received = a.rx.recv().await.unwrap();
        assert!(matches!(received.message, ThreadMessage::GetPeers));
    }
}
