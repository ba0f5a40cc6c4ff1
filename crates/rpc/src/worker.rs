//! The RPC fan-out worker.

use crate::{
    client::{BitcoinRpcClient, ContractExecutor},
    headers::BlockHeaderValidator,
    normalize::normalize_call_result,
};
use async_trait::async_trait;
use opnet_fabric::{Worker, WorkerChannel};
use opnet_types::{
    BroadcastResult, CallRequest, HeaderValidation, OpnetConsensus, RpcCall, ThreadData,
    ThreadMessage,
};
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Tunables for the RPC worker.
#[derive(Clone, Copy, Debug)]
pub struct RpcWorkerConfig {
    /// Height poll cadence; the cached value is the source of truth for the
    /// global consensus height.
    pub poll_interval: Duration,
    /// Bound of the sub-pool running `Call` requests.
    pub call_pool_size: usize,
}

impl Default for RpcWorkerConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(1), call_pool_size: 4 }
    }
}

/// Holds the Bitcoin node client, the contract executor and the header
/// validator; serves `RpcMethod` envelopes from every other role.
pub struct RpcWorker {
    client: Arc<dyn BitcoinRpcClient>,
    executor: Arc<dyn ContractExecutor>,
    validator: Arc<BlockHeaderValidator>,
    config: RpcWorkerConfig,
}

impl RpcWorker {
    pub fn new(
        client: Arc<dyn BitcoinRpcClient>,
        executor: Arc<dyn ContractExecutor>,
        validator: Arc<BlockHeaderValidator>,
        config: RpcWorkerConfig,
    ) -> Self {
        Self { client, executor, validator, config }
    }
}

#[async_trait]
impl Worker for RpcWorker {
    async fn run(self: Box<Self>, channel: WorkerChannel) {
        let Some(mut conn) = channel.attach().await else { return };

        // sole writer of the global consensus height
        let poll_client = self.client.clone();
        let poll_interval = self.config.poll_interval;
        let poll = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match poll_client.block_count().await {
                    Ok(height) => OpnetConsensus::set_block_height(height),
                    Err(e) => {
                        debug!(target: "opnet::rpc", error = %e, "height poll failed");
                    }
                }
            }
        });

        let call_permits = Arc::new(Semaphore::new(self.config.call_pool_size.max(1)));

        while let Some(envelope) = conn.next().await {
            match envelope.message {
                ThreadMessage::RpcMethod(call) => {
                    let Some(task_id) = envelope.task_id else {
                        warn!(target: "opnet::rpc", "rpc request without task id dropped");
                        continue;
                    };
                    match call {
                        // heavy calls run in the bounded sub-pool so they
                        // never block the serving loop
                        RpcCall::Call { request } => {
                            let permits = call_permits.clone();
                            let executor = self.executor.clone();
                            let reply = conn.reply_handle();
                            tokio::spawn(async move {
                                let _permit = permits.acquire_owned().await.ok();
                                let data = execute_call(executor.as_ref(), &request).await;
                                let _ = reply.respond(task_id, data).await;
                            });
                        }
                        call => {
                            let data = self.handle_inline(call).await;
                            let _ = conn.respond(task_id, data).await;
                        }
                    }
                }
                ThreadMessage::ExitThread => break,
                other => {
                    warn!(target: "opnet::rpc", message = ?other, "unhandled envelope dropped");
                }
            }
        }
        poll.abort();
    }
}

impl RpcWorker {
    async fn handle_inline(&self, call: RpcCall) -> ThreadData {
        match call {
            RpcCall::GetCurrentBlock => ThreadData::Height(OpnetConsensus::block_height()),
            RpcCall::GetTx { txid } => match self.client.raw_transaction(&txid).await {
                Ok(raw) => ThreadData::RawTransaction(raw),
                Err(e) => ThreadData::Error(e.to_string()),
            },
            RpcCall::ValidateBlockHeaders { header } => {
                // both branches run concurrently; each may fail on its own
                // and surfaces as None, never as an error
                let (checksum, stored) = tokio::join!(
                    self.validator.validate_block_checksum(&header),
                    self.validator.get_block_header(header.height),
                );
                ThreadData::HeaderValidation(HeaderValidation {
                    has_valid_proofs: checksum.ok().flatten(),
                    stored_block_header: stored.ok().flatten(),
                })
            }
            RpcCall::BroadcastTransaction { raw } => {
                let identifier = hex::encode(Sha256::digest(&raw));
                match self.client.broadcast_transaction(&raw).await {
                    Ok(result) => ThreadData::Broadcast(BroadcastResult {
                        success: true,
                        result: Some(result),
                        error: None,
                        identifier,
                    }),
                    Err(e) => ThreadData::Broadcast(BroadcastResult {
                        success: false,
                        result: None,
                        error: Some(e.to_string()),
                        identifier,
                    }),
                }
            }
            RpcCall::Call { .. } => unreachable!("Call is dispatched to the sub-pool"),
        }
    }
}

async fn execute_call(executor: &dyn ContractExecutor, request: &CallRequest) -> ThreadData {
    match executor.call(request).await {
        Ok(raw) => match normalize_call_result(raw) {
            Ok(result) => ThreadData::Call(Box::new(result)),
            Err(e) => ThreadData::Error(e),
        },
        Err(e) => ThreadData::Error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RpcClientError;
    use bytes::Bytes;
    use opnet_fabric::{FabricOptions, WorkerFabric};
    use opnet_storage::MemHeaderStore;
    use opnet_types::{PartialBlockHeader, RawCallResult, Txid, WorkerRole};
    use std::collections::HashMap;

    struct FakeNode {
        height: u64,
        fail_broadcast: bool,
    }

    #[async_trait]
    impl BitcoinRpcClient for FakeNode {
        async fn block_count(&self) -> Result<u64, RpcClientError> {
            Ok(self.height)
        }

        async fn raw_transaction(&self, txid: &Txid) -> Result<Option<Bytes>, RpcClientError> {
            if txid.0 == [7u8; 32] {
                Ok(Some(Bytes::from_static(b"rawtx")))
            } else {
                Ok(None)
            }
        }

        async fn broadcast_transaction(&self, _raw: &[u8]) -> Result<String, RpcClientError> {
            if self.fail_broadcast {
                Err(RpcClientError::Node("rejected".into()))
            } else {
                Ok("txid-hex".into())
            }
        }
    }

    struct FakeExecutor;

    #[async_trait]
    impl ContractExecutor for FakeExecutor {
        async fn call(&self, request: &CallRequest) -> Result<RawCallResult, String> {
            if request.contract == "broken" {
                return Err("vm fault".into());
            }
            Ok(RawCallResult {
                result: "0x01".into(),
                gas_used: "42".into(),
                changed_storage: HashMap::new(),
                events: HashMap::new(),
                revert: None,
            })
        }
    }

    fn rpc_fabric(height: u64, fail_broadcast: bool) -> WorkerFabric {
        let store = Arc::new(MemHeaderStore::new());
        store.insert(opnet_types::StoredBlockHeader {
            height: 5,
            block_hash: [0xaa; 32],
            checksum_root: crate::headers::compute_checksum_root(&[[1u8; 32]], &[0xaa; 32]),
            checksum_proofs: vec![[1u8; 32]],
        });
        let builder = move |_index: usize| {
            let worker = RpcWorker::new(
                Arc::new(FakeNode { height, fail_broadcast }),
                Arc::new(FakeExecutor),
                Arc::new(BlockHeaderValidator::new(store.clone())),
                RpcWorkerConfig { poll_interval: Duration::from_millis(50), call_pool_size: 2 },
            );
            Box::new(worker) as Box<dyn Worker>
        };
        WorkerFabric::new(WorkerRole::Rpc, builder, FabricOptions::default())
    }

    #[tokio::test]
    async fn poll_loop_updates_the_global_height() -> eyre::Result<()> {
        let fabric = rpc_fabric(4_321, false);
        fabric.spawn(1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(OpnetConsensus::block_height() >= 4_321);
        let data = fabric.execute(ThreadMessage::RpcMethod(RpcCall::GetCurrentBlock)).await?;
        match data {
            ThreadData::Height(h) => assert!(h >= 4_321),
            other => panic!("unexpected response {other:?}"),
        }
        fabric.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn get_tx_round_trip() -> eyre::Result<()> {
        let fabric = rpc_fabric(1, false);
        fabric.spawn(1).await;

        let data = fabric
            .execute(ThreadMessage::RpcMethod(RpcCall::GetTx { txid: Txid([7u8; 32]) }))
            .await?;
        assert_eq!(data, ThreadData::RawTransaction(Some(Bytes::from_static(b"rawtx"))));

        let data = fabric
            .execute(ThreadMessage::RpcMethod(RpcCall::GetTx { txid: Txid([9u8; 32]) }))
            .await?;
        assert_eq!(data, ThreadData::RawTransaction(None));
        fabric.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn header_validation_joins_both_branches() -> eyre::Result<()> {
        let fabric = rpc_fabric(1, false);
        fabric.spawn(1).await;

        let header = PartialBlockHeader {
            height: 5,
            block_hash: [0xaa; 32],
            checksum_root: crate::headers::compute_checksum_root(&[[1u8; 32]], &[0xaa; 32]),
            checksum_proofs: vec![[1u8; 32]],
        };
        let data = fabric
            .execute(ThreadMessage::RpcMethod(RpcCall::ValidateBlockHeaders { header }))
            .await?;
        match data {
            ThreadData::HeaderValidation(validation) => {
                assert_eq!(validation.has_valid_proofs, Some(true));
                assert_eq!(validation.stored_block_header.unwrap().height, 5);
            }
            other => panic!("unexpected response {other:?}"),
        }

        // unknown height: both branches come back None, no error
        let header = PartialBlockHeader {
            height: 99,
            block_hash: [0u8; 32],
            checksum_root: [0u8; 32],
            checksum_proofs: Vec::new(),
        };
        let data = fabric
            .execute(ThreadMessage::RpcMethod(RpcCall::ValidateBlockHeaders { header }))
            .await?;
        assert_eq!(
            data,
            ThreadData::HeaderValidation(HeaderValidation {
                has_valid_proofs: None,
                stored_block_header: None,
            })
        );
        fabric.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn contract_calls_run_in_the_sub_pool() -> eyre::Result<()> {
        let fabric = rpc_fabric(1, false);
        fabric.spawn(1).await;

        let request = CallRequest {
            contract: "c1".into(),
            calldata: Bytes::from_static(&[0x00]),
            from: None,
            block_height: None,
        };
        let data =
            fabric.execute(ThreadMessage::RpcMethod(RpcCall::Call { request })).await?;
        match data {
            ThreadData::Call(result) => {
                assert_eq!(result.gas_used, 42);
                assert_eq!(result.result.as_ref(), &[0x01]);
            }
            other => panic!("unexpected response {other:?}"),
        }

        // executor failure surfaces as an error payload, not a crash
        let request = CallRequest {
            contract: "broken".into(),
            calldata: Bytes::new(),
            from: None,
            block_height: None,
        };
        let data =
            fabric.execute(ThreadMessage::RpcMethod(RpcCall::Call { request })).await?;
        assert_eq!(data, ThreadData::Error("vm fault".to_string()));
        fabric.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn broadcast_failures_are_caught() -> eyre::Result<()> {
        let fabric = rpc_fabric(1, true);
        fabric.spawn(1).await;

        let raw = Bytes::from_static(b"rawtx");
        let expected_id = hex::encode(Sha256::digest(&raw));
        let data = fabric
            .execute(ThreadMessage::RpcMethod(RpcCall::BroadcastTransaction { raw }))
            .await?;
        match data {
            ThreadData::Broadcast(result) => {
                assert!(!result.success);
                assert!(result.error.unwrap().contains("rejected"));
                assert_eq!(result.identifier, expected_id);
            }
            other => panic!("unexpected response {other:?}"),
        }
        fabric.shutdown().await;
        Ok(())
    }
}
