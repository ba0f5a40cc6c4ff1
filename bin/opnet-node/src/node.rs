//! Node assembly: fabrics per role, plugin manager, p2p service.

use crate::adapters::{BitcoindClient, DetachedExecutor, DetachedRuntime};
use eyre::WrapErr;
use opnet_config::{NodeConfig, CURRENT_PROTOCOL_VERSION};
use opnet_fabric::{FabricOptions, ThreadManager, Worker, WorkerFabric};
use opnet_p2p::{P2pEvent, P2pService, SessionPolicy};
use opnet_plugin::{PluginManager, PluginManagerConfig, ReindexDirective};
use opnet_rpc::{BlockHeaderValidator, RpcWorker, RpcWorkerConfig};
use opnet_storage::{MemHeaderStore, MemStore};
use opnet_types::{PartialBlockHeader, RpcCall, ThreadMessage, WorkerRole};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The assembled node.
pub struct Node {
    manager: ThreadManager,
    plugins: Arc<PluginManager>,
    p2p: P2pService,
}

impl Node {
    pub async fn launch(config: NodeConfig) -> eyre::Result<Self> {
        let manager = ThreadManager::new();

        // RPC fan-out, when a wrapped Bitcoin node is configured
        if let Some(url) = config.rpc.bitcoin_rpc_url.clone() {
            let client = Arc::new(BitcoindClient::new(
                url,
                config.rpc.bitcoin_rpc_user.clone(),
                config.rpc.bitcoin_rpc_password.clone(),
            ));
            let validator = Arc::new(BlockHeaderValidator::new(Arc::new(MemHeaderStore::new())));
            let executor = Arc::new(DetachedExecutor);
            let rpc_config = RpcWorkerConfig {
                poll_interval: Duration::from_millis(config.rpc.poll_interval_ms.max(100)),
                call_pool_size: config.rpc.call_pool_size,
            };
            let builder = move |_index: usize| {
                Box::new(RpcWorker::new(
                    client.clone(),
                    executor.clone(),
                    validator.clone(),
                    rpc_config,
                )) as Box<dyn Worker>
            };
            let fabric = WorkerFabric::new(WorkerRole::Rpc, builder, FabricOptions::default());
            manager.register(fabric.clone());
            fabric.spawn(config.workers.rpc.max(1)).await;
        } else {
            warn!(target: "opnet::node", "no bitcoin rpc endpoint configured; rpc fan-out disabled");
        }

        // plugin runtime
        let plugins = Arc::new(PluginManager::new(
            PluginManagerConfig {
                data_dir: config.data_dir.join("plugins"),
                worker_count: config.plugins.worker_count,
                default_timeout: Duration::from_millis(config.plugins.default_timeout_ms),
                network: config.network,
                chain_id: config.chain_id,
            },
            Arc::new(DetachedRuntime),
            Arc::new(MemStore::new()),
        ));
        if config.plugins.dir.is_dir() {
            let loaded = plugins
                .load_from_dir(&config.plugins.dir)
                .await
                .wrap_err("plugin directory scan failed")?;
            for id in &loaded {
                if let Err(e) = plugins.enable_plugin(id).await {
                    warn!(target: "opnet::node", plugin = %id, error = %e, "enable failed");
                }
            }
            info!(target: "opnet::node", count = loaded.len(), "plugins loaded");
        }

        // operator reindex directive
        if let Some(reindex) = config.reindex {
            if reindex.enabled {
                let directive = ReindexDirective {
                    enabled: true,
                    from_block: reindex.from_block,
                    in_progress: false,
                };
                let decisions = plugins
                    .run_reindex(&directive)
                    .await
                    .wrap_err("reindex coordination failed")?;
                info!(target: "opnet::node", plugins = decisions.len(), from_block = reindex.from_block, "reindex directive applied");
            }
        }

        // p2p service
        let mut policy = SessionPolicy::new(config.network, config.chain_id);
        policy.current_version = CURRENT_PROTOCOL_VERSION
            .parse()
            .expect("current protocol version parses");
        policy.verify_network = config.p2p.verify_network;
        policy.auth_timeout = Duration::from_secs(config.p2p.auth_timeout_secs);
        for version in config.p2p.trusted_checksums.keys() {
            if let Some(checksum) = config.trusted_checksum(version)? {
                policy.trusted_checksums.insert(version.clone(), checksum);
            }
        }

        let (events_tx, events_rx) = mpsc::channel(256);
        let p2p = P2pService::bind(&config.p2p.listen_addr, policy, events_tx)
            .await
            .wrap_err("p2p bind failed")?;
        spawn_p2p_event_loop(events_rx, manager.clone());

        Ok(Self { manager, plugins, p2p })
    }

    pub async fn shutdown(&self) {
        self.p2p.shutdown();
        self.plugins.shutdown().await;
        self.manager.shutdown().await;
    }
}

/// Surface authenticated-session traffic to the rest of the node.
fn spawn_p2p_event_loop(mut events: mpsc::Receiver<P2pEvent>, manager: ThreadManager) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                P2pEvent::PeerAuthenticated { peer_id, identity } => {
                    info!(target: "opnet::node", peer = %peer_id, identity = %identity, "peer authenticated");
                }
                P2pEvent::PeerDisconnected { peer_id, code, reason } => {
                    info!(target: "opnet::node", peer = %peer_id, code = ?code, reason = %reason, "peer disconnected");
                }
                P2pEvent::BlockHeaderWitness { peer_id, witness } => {
                    let (Ok(block_hash), Ok(checksum_root)) = (
                        <[u8; 32]>::try_from(witness.block_hash.as_slice()),
                        <[u8; 32]>::try_from(witness.checksum_root.as_slice()),
                    ) else {
                        warn!(target: "opnet::node", peer = %peer_id, "malformed header witness dropped");
                        continue;
                    };
                    let header = PartialBlockHeader {
                        height: witness.height,
                        block_hash,
                        checksum_root,
                        checksum_proofs: Vec::new(),
                    };
                    match manager
                        .execute(
                            WorkerRole::Rpc,
                            ThreadMessage::RpcMethod(RpcCall::ValidateBlockHeaders { header }),
                        )
                        .await
                    {
                        Ok(data) => {
                            info!(target: "opnet::node", peer = %peer_id, height = witness.height, result = ?data, "header witness validated");
                        }
                        Err(e) => {
                            warn!(target: "opnet::node", peer = %peer_id, error = %e, "header witness validation unavailable");
                        }
                    }
                }
            }
        }
    });
}
