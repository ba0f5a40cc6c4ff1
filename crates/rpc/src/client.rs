//! External collaborator seams: the wrapped Bitcoin node and the contract
//! execution engine.

use async_trait::async_trait;
use bytes::Bytes;
use opnet_types::{CallRequest, RawCallResult, Txid};
use thiserror::Error;

/// Errors from the wrapped Bitcoin node.
#[derive(Debug, Error, Clone)]
pub enum RpcClientError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("node: {0}")]
    Node(String),
}

/// The wrapped Bitcoin node RPC client.
#[async_trait]
pub trait BitcoinRpcClient: Send + Sync + 'static {
    async fn block_count(&self) -> Result<u64, RpcClientError>;

    async fn raw_transaction(&self, txid: &Txid) -> Result<Option<Bytes>, RpcClientError>;

    /// Broadcast a raw transaction, returning the node's result string.
    async fn broadcast_transaction(&self, raw: &[u8]) -> Result<String, RpcClientError>;
}

/// The WASM contract execution engine, consumed as a capability.
#[async_trait]
pub trait ContractExecutor: Send + Sync + 'static {
    async fn call(&self, request: &CallRequest) -> Result<RawCallResult, String>;
}
