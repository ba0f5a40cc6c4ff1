//! The plugin manager: file loading, lifecycle, event fan-out, and
//! reorg/reindex coordination.

use crate::{
    codec::{discover_plugins, PluginFile, PLUGIN_SUFFIX},
    error::PluginError,
    hooks::{HookDispatcher, HookKind},
    pool::{HookOutcome, PluginRuntime, PluginWorkerPool, PoolObserver},
    registry::{PluginRecord, PluginRegistry, PluginState},
    sync::{reindex_check, PluginSyncState, ReindexAction, ReindexCheck, ReindexDirective, SyncStateTracker},
};
use async_trait::async_trait;
use opnet_storage::KeyValueStore;
use opnet_types::{now_millis, Network, NetworkInfo, OpnetConsensus};
use parking_lot::RwLock;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{info, warn};

/// Host-side plugin settings.
#[derive(Clone, Debug)]
pub struct PluginManagerConfig {
    /// Per-plugin data directories are created under here on first load.
    pub data_dir: PathBuf,
    pub worker_count: usize,
    pub default_timeout: Duration,
    pub network: Network,
    pub chain_id: u32,
}

struct ManagerObserver {
    registry: Arc<RwLock<PluginRegistry>>,
    sync: Arc<SyncStateTracker>,
}

#[async_trait]
impl PoolObserver for ManagerObserver {
    async fn on_plugin_crash(&self, plugin_id: &str, reason: &str) {
        warn!(target: "opnet::plugin", plugin = %plugin_id, %reason, "plugin crashed");
        if let Err(e) = self.registry.write().mark_crashed(plugin_id, reason) {
            warn!(target: "opnet::plugin", plugin = %plugin_id, error = %e, "failed to record crash");
        }
    }

    async fn on_sync_state_update(&self, plugin_id: &str, last_synced_block: u64, sync_completed: bool) {
        if let Err(e) =
            self.sync.update_last_synced_block(plugin_id, last_synced_block, sync_completed).await
        {
            warn!(target: "opnet::plugin", plugin = %plugin_id, error = %e, "failed to persist sync state");
        }
    }
}

/// Owns the registry, the worker pool, the dispatcher and the sync tracker.
pub struct PluginManager {
    config: PluginManagerConfig,
    registry: Arc<RwLock<PluginRegistry>>,
    pool: PluginWorkerPool,
    dispatcher: HookDispatcher,
    sync: Arc<SyncStateTracker>,
}

impl PluginManager {
    pub fn new(
        config: PluginManagerConfig,
        runtime: Arc<dyn PluginRuntime>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let registry = Arc::new(RwLock::new(PluginRegistry::new()));
        let sync = Arc::new(SyncStateTracker::new(store));
        let observer =
            Arc::new(ManagerObserver { registry: registry.clone(), sync: sync.clone() });
        let pool = PluginWorkerPool::new(
            config.worker_count,
            runtime,
            observer,
            config.default_timeout,
        );
        let dispatcher = HookDispatcher::new(registry.clone(), pool.clone());
        Self { config, registry, pool, dispatcher, sync }
    }

    pub fn dispatcher(&self) -> &HookDispatcher {
        &self.dispatcher
    }

    pub fn sync_tracker(&self) -> &Arc<SyncStateTracker> {
        &self.sync
    }

    pub fn plugin_state(&self, id: &str) -> Option<PluginState> {
        self.registry.read().get(id).map(|r| r.state)
    }

    /// Load every enabled container in a directory. Files failing integrity
    /// checks are rejected and skipped; the rest keep loading.
    pub async fn load_from_dir(&self, dir: &Path) -> Result<Vec<String>, PluginError> {
        let mut loaded = Vec::new();
        for discovered in discover_plugins(dir)? {
            if !discovered.enabled {
                info!(target: "opnet::plugin", plugin = %discovered.id, "disabled plugin skipped");
                continue;
            }
            match self.load_plugin_file(&discovered.path).await {
                Ok(id) => loaded.push(id),
                Err(e) => {
                    warn!(target: "opnet::plugin", plugin = %discovered.id, error = %e, "plugin rejected");
                }
            }
        }
        Ok(loaded)
    }

    /// Parse, verify, register and load a single container.
    pub async fn load_plugin_file(&self, path: &Path) -> Result<String, PluginError> {
        let bytes = tokio::fs::read(path).await.map_err(crate::error::PluginFileError::Io)?;
        let file = PluginFile::parse(&bytes)?;

        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .and_then(|n| n.strip_suffix(PLUGIN_SUFFIX).map(str::to_string))
            .unwrap_or_else(|| file.metadata.name.clone());

        // per-plugin data directory, created on first load
        let data_dir = self.config.data_dir.join(&id);
        tokio::fs::create_dir_all(&data_dir).await.map_err(crate::error::PluginFileError::Io)?;

        self.registry
            .write()
            .register(PluginRecord::new(id.clone(), path.to_path_buf(), file.metadata.clone()))?;

        let network = NetworkInfo::new(self.config.network, self.config.chain_id);
        let plugin_config = serde_json::json!({
            "dataDir": data_dir,
            "network": network,
        });
        let worker_index =
            match self.pool.load_plugin(&id, file.bytecode.clone(), plugin_config, network).await {
                Ok(worker_index) => worker_index,
                Err(e) => {
                    // stays Registered; the operator can retry after fixing it
                    warn!(target: "opnet::plugin", plugin = %id, error = %e, "load failed");
                    return Err(e);
                }
            };
        self.registry.write().mark_loaded(&id, worker_index)?;

        let outcome = self.dispatcher.dispatch_to(&id, HookKind::Load, serde_json::json!({})).await;
        if !outcome.success {
            warn!(target: "opnet::plugin", plugin = %id, error = ?outcome.error, "load hook failed");
        }
        Ok(id)
    }

    /// Enable a loaded plugin and install its initial sync state.
    pub async fn enable_plugin(&self, id: &str) -> Result<(), PluginError> {
        if !self.registry.read().contains(id) {
            return Err(PluginError::PluginNotRegistered(id.to_string()));
        }
        if !self.pool.is_loaded(id) {
            return Err(PluginError::PluginNotLoaded(id.to_string()));
        }

        let height = OpnetConsensus::block_height();
        if self.sync.get_state(id).await?.is_none() {
            let installed_version =
                self.registry.read().get(id).map(|r| r.metadata.version.to_string()).unwrap_or_default();
            self.sync
                .init_state(PluginSyncState {
                    plugin_id: id.to_string(),
                    installed_version,
                    chain_id: self.config.chain_id,
                    network: self.config.network,
                    enabled_at_block: height,
                    last_synced_block: height,
                    sync_completed: false,
                    collections: Vec::new(),
                    updated_at: now_millis(),
                })
                .await?;
        }

        self.registry.write().set_state(id, PluginState::Enabled)?;
        let outcome =
            self.dispatcher.dispatch_to(id, HookKind::Enable, serde_json::json!({})).await;
        if !outcome.success {
            warn!(target: "opnet::plugin", plugin = %id, error = ?outcome.error, "enable hook failed");
        }
        Ok(())
    }

    /// Disable a plugin; it stays loaded but leaves every fan-out.
    pub async fn disable_plugin(&self, id: &str) -> Result<(), PluginError> {
        if !self.pool.is_loaded(id) {
            return Err(PluginError::PluginNotLoaded(id.to_string()));
        }
        let outcome =
            self.dispatcher.dispatch_to(id, HookKind::Disable, serde_json::json!({})).await;
        if !outcome.success {
            warn!(target: "opnet::plugin", plugin = %id, error = ?outcome.error, "disable hook failed");
        }
        self.registry.write().set_state(id, PluginState::Disabled)?;
        Ok(())
    }

    /// Unload a plugin from its worker. Idempotent.
    pub async fn unload_plugin(&self, id: &str) -> Result<(), PluginError> {
        if self.pool.is_loaded(id) {
            let outcome =
                self.dispatcher.dispatch_to(id, HookKind::Unload, serde_json::json!({})).await;
            if !outcome.success {
                warn!(target: "opnet::plugin", plugin = %id, error = ?outcome.error, "unload hook failed");
            }
            self.pool.unload_plugin(id).await?;
        }
        if self.registry.read().contains(id) {
            self.registry.write().set_state(id, PluginState::Unloaded)?;
        }
        Ok(())
    }

    pub async fn on_block_pre_process(&self, height: u64) -> Vec<HookOutcome> {
        self.dispatcher
            .dispatch(HookKind::BlockPreProcess, serde_json::json!({ "height": height }))
            .await
    }

    pub async fn on_block_post_process(&self, height: u64) -> Vec<HookOutcome> {
        self.dispatcher
            .dispatch(HookKind::BlockPostProcess, serde_json::json!({ "height": height }))
            .await
    }

    pub async fn on_block_change(&self, height: u64) -> Vec<HookOutcome> {
        self.dispatcher.dispatch(HookKind::BlockChange, serde_json::json!({ "height": height })).await
    }

    pub async fn on_epoch_change(&self, epoch: u64) -> Vec<HookOutcome> {
        self.dispatcher.dispatch(HookKind::EpochChange, serde_json::json!({ "epoch": epoch })).await
    }

    pub async fn on_epoch_finalized(&self, epoch: u64) -> Vec<HookOutcome> {
        self.dispatcher
            .dispatch(HookKind::EpochFinalized, serde_json::json!({ "epoch": epoch }))
            .await
    }

    pub async fn on_mempool_transaction(&self, tx: serde_json::Value) -> Vec<HookOutcome> {
        self.dispatcher.dispatch(HookKind::MempoolTransaction, tx).await
    }

    /// Sequential reorg fan-out, then rewind sync state of plugins that had
    /// indexed past the fork point.
    pub async fn handle_reorg(&self, from_height: u64, to_height: u64) -> Vec<HookOutcome> {
        let outcomes = self
            .dispatcher
            .dispatch(
                HookKind::Reorg,
                serde_json::json!({ "fromHeight": from_height, "toHeight": to_height }),
            )
            .await;

        for id in self.registry.read().get_enabled() {
            match self.sync.get_state(&id).await {
                Ok(Some(state)) if state.last_synced_block > to_height => {
                    if let Err(e) = self.sync.reset_sync_state_to_block(&id, to_height).await {
                        warn!(target: "opnet::plugin", plugin = %id, error = %e, "failed to rewind sync state");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "opnet::plugin", plugin = %id, error = %e, "failed to read sync state");
                }
            }
        }
        outcomes
    }

    /// Evaluate the operator's reindex directive against every enabled
    /// plugin, dispatching purge and resync hooks as decided.
    ///
    /// Sequential with `continue_on_error = false` semantics: the first hook
    /// failure halts the run so the operator can reconcile.
    pub async fn run_reindex(
        &self,
        directive: &ReindexDirective,
    ) -> Result<Vec<(String, ReindexCheck)>, PluginError> {
        let mut decisions = Vec::new();
        for id in self.registry.read().get_enabled() {
            let last_synced =
                self.sync.get_state(&id).await?.map(|s| s.last_synced_block).unwrap_or(0);
            let check = reindex_check(Some(directive), last_synced);
            decisions.push((id.clone(), check));

            match check.action {
                ReindexAction::None => {}
                ReindexAction::Purge => {
                    let purge_to = check.purge_to_block.unwrap_or(directive.from_block);
                    let outcome = self
                        .dispatcher
                        .dispatch_to(
                            &id,
                            HookKind::PurgeBlocks,
                            serde_json::json!({ "purgeToBlock": purge_to }),
                        )
                        .await;
                    if !outcome.success {
                        return Err(PluginError::LoadFailed {
                            id,
                            reason: outcome.error.unwrap_or_else(|| "purge hook failed".into()),
                        });
                    }
                    self.sync.reset_sync_state_to_block(&id, purge_to).await?;
                    let outcome = self
                        .dispatcher
                        .dispatch_to(
                            &id,
                            HookKind::ReindexRequired,
                            serde_json::json!({ "fromBlock": check.sync_from_block }),
                        )
                        .await;
                    if !outcome.success {
                        return Err(PluginError::LoadFailed {
                            id,
                            reason: outcome.error.unwrap_or_else(|| "reindex hook failed".into()),
                        });
                    }
                }
                ReindexAction::Sync => {
                    let outcome = self
                        .dispatcher
                        .dispatch_to(
                            &id,
                            HookKind::ReindexRequired,
                            serde_json::json!({
                                "fromBlock": check.sync_from_block,
                                "toBlock": check.sync_to_block,
                            }),
                        )
                        .await;
                    if !outcome.success {
                        return Err(PluginError::LoadFailed {
                            id,
                            reason: outcome.error.unwrap_or_else(|| "reindex hook failed".into()),
                        });
                    }
                }
            }
        }
        Ok(decisions)
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{write_plugin_file, MldsaKeypair, MldsaLevel, PluginMetadata, PluginType},
        pool::SyncStateSender,
    };
    use bytes::Bytes;
    use opnet_storage::MemStore;
    use parking_lot::Mutex as PlMutex;

    /// Runtime whose hooks fail for plugin ids starting with "bad".
    #[derive(Default)]
    struct TestRuntime {
        hook_log: PlMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PluginRuntime for TestRuntime {
        async fn load(
            &self,
            _plugin_id: &str,
            _bytecode: Bytes,
            _config: serde_json::Value,
            _network: NetworkInfo,
            _sync: SyncStateSender,
        ) -> Result<(), String> {
            Ok(())
        }

        async fn unload(&self, _plugin_id: &str) {}

        async fn invoke_hook(
            &self,
            plugin_id: &str,
            hook: HookKind,
            _payload: serde_json::Value,
        ) -> Result<Option<serde_json::Value>, String> {
            self.hook_log.lock().push((plugin_id.to_string(), hook.as_str().to_string()));
            if plugin_id.starts_with("bad") && hook == HookKind::BlockChange {
                return Err("boom".to_string());
            }
            Ok(Some(serde_json::json!({ "ok": plugin_id })))
        }

        async fn invoke_route(
            &self,
            _plugin_id: &str,
            _handler: &str,
            _payload: serde_json::Value,
        ) -> Result<serde_json::Value, String> {
            Ok(serde_json::Value::Null)
        }

        async fn invoke_ws(
            &self,
            _plugin_id: &str,
            _handler: &str,
            _payload: serde_json::Value,
            _client_id: &str,
        ) -> Result<serde_json::Value, String> {
            Ok(serde_json::Value::Null)
        }
    }

    fn metadata(name: &str, permissions: &[&str]) -> PluginMetadata {
        PluginMetadata {
            name: name.into(),
            version: "1.0.0".parse().unwrap(),
            opnet_version: "*".parse().unwrap(),
            target: "wasm32".into(),
            plugin_type: PluginType::Standalone,
            checksum: String::new(),
            author: "tests".into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }

    struct Fixture {
        manager: PluginManager,
        runtime: Arc<TestRuntime>,
        plugin_dir: tempfile::TempDir,
        data_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(TestRuntime::default());
        let data_dir = tempfile::tempdir().unwrap();
        let manager = PluginManager::new(
            PluginManagerConfig {
                data_dir: data_dir.path().to_path_buf(),
                worker_count: 2,
                default_timeout: Duration::from_secs(5),
                network: Network::Regtest,
                chain_id: 1,
            },
            runtime.clone(),
            Arc::new(MemStore::new()),
        );
        Fixture { manager, runtime, plugin_dir: tempfile::tempdir().unwrap(), data_dir }
    }

    fn write_container(fixture: &Fixture, name: &str, permissions: &[&str]) -> PathBuf {
        let keypair = MldsaKeypair::generate(MldsaLevel::Level44).unwrap();
        let bytes =
            write_plugin_file(&metadata(name, permissions), b"bytecode", None, &keypair).unwrap();
        let path = fixture.plugin_dir.path().join(format!("{name}.opnet"));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn load_enable_and_fan_out() -> eyre::Result<()> {
        let fixture = fixture();
        write_container(&fixture, "good", &["blocks.onChange"]);
        write_container(&fixture, "bad", &["blocks.onChange"]);

        let loaded = fixture.manager.load_from_dir(fixture.plugin_dir.path()).await?;
        assert_eq!(loaded, vec!["bad".to_string(), "good".to_string()]);
        fixture.manager.enable_plugin("good").await?;
        fixture.manager.enable_plugin("bad").await?;

        // per-plugin data directories exist
        assert!(fixture.data_dir.path().join("good").is_dir());

        // parallel fan-out: one failure, one success, both collected
        let outcomes = fixture.manager.on_block_change(10).await;
        assert_eq!(outcomes.len(), 2);
        let ok = outcomes.iter().filter(|o| o.success).count();
        let failed = outcomes.iter().filter(|o| !o.success).count();
        assert_eq!((ok, failed), (1, 1));
        let failure = outcomes.iter().find(|o| !o.success).unwrap();
        assert_eq!(failure.plugin_id, "bad");
        assert_eq!(failure.error.as_deref(), Some("boom"));

        fixture.manager.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_container_is_rejected_not_registered() -> eyre::Result<()> {
        let fixture = fixture();
        let path = write_container(&fixture, "good", &[]);
        // corrupt the file body
        let mut bytes = std::fs::read(&path)?;
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        std::fs::write(fixture.plugin_dir.path().join("evil.opnet"), bytes)?;

        let loaded = fixture.manager.load_from_dir(fixture.plugin_dir.path()).await?;
        assert_eq!(loaded, vec!["good".to_string()]);
        assert_eq!(fixture.manager.plugin_state("evil"), None);
        fixture.manager.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn enable_requires_load() {
        let fixture = fixture();
        let err = fixture.manager.enable_plugin("ghost").await.unwrap_err();
        assert!(matches!(err, PluginError::PluginNotRegistered(_)));
        fixture.manager.shutdown().await;
    }

    #[tokio::test]
    async fn lifecycle_hooks_run_in_order() -> eyre::Result<()> {
        let fixture = fixture();
        let path = write_container(&fixture, "solo", &[]);
        fixture.manager.load_plugin_file(&path).await?;
        fixture.manager.enable_plugin("solo").await?;
        fixture.manager.disable_plugin("solo").await?;
        fixture.manager.unload_plugin("solo").await?;
        // unload again: idempotent
        fixture.manager.unload_plugin("solo").await?;

        let log = fixture.runtime.hook_log.lock().clone();
        let hooks: Vec<&str> = log.iter().map(|(_, h)| h.as_str()).collect();
        assert_eq!(hooks, vec!["load", "enable", "disable", "unload"]);
        assert_eq!(fixture.manager.plugin_state("solo"), Some(PluginState::Unloaded));
        fixture.manager.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn reorg_rewinds_sync_state() -> eyre::Result<()> {
        let fixture = fixture();
        let path = write_container(&fixture, "tracker", &[]);
        fixture.manager.load_plugin_file(&path).await?;
        fixture.manager.enable_plugin("tracker").await?;
        fixture.manager.sync_tracker().update_last_synced_block("tracker", 100, false).await?;

        fixture.manager.handle_reorg(100, 60).await;
        let state = fixture.manager.sync_tracker().get_state("tracker").await?.unwrap();
        assert_eq!(state.last_synced_block, 60);
        assert!(!state.sync_completed);
        fixture.manager.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn reindex_purge_decision_and_hooks() -> eyre::Result<()> {
        let fixture = fixture();
        let path = write_container(&fixture, "tracker", &[]);
        fixture.manager.load_plugin_file(&path).await?;
        fixture.manager.enable_plugin("tracker").await?;
        fixture.manager.sync_tracker().update_last_synced_block("tracker", 100, true).await?;

        let directive = ReindexDirective { enabled: true, from_block: 50, in_progress: false };
        let decisions = fixture.manager.run_reindex(&directive).await?;
        assert_eq!(decisions.len(), 1);
        let (id, check) = &decisions[0];
        assert_eq!(id, "tracker");
        assert_eq!(check.action, ReindexAction::Purge);
        assert_eq!(check.purge_to_block, Some(50));
        assert!(check.requires_sync);
        assert_eq!(check.sync_from_block, Some(50));

        // state was rewound to the purge point
        let state = fixture.manager.sync_tracker().get_state("tracker").await?.unwrap();
        assert_eq!(state.last_synced_block, 50);

        // the purge and reindex hooks both reached the plugin
        let log = fixture.runtime.hook_log.lock().clone();
        let hooks: Vec<&str> = log.iter().map(|(_, h)| h.as_str()).collect();
        assert!(hooks.contains(&"purgeBlocks"));
        assert!(hooks.contains(&"reindexRequired"));
        fixture.manager.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn crash_is_recorded_in_the_registry() -> eyre::Result<()> {
        let fixture = fixture();
        let path = write_container(&fixture, "fragile", &[]);
        fixture.manager.load_plugin_file(&path).await?;
        fixture.manager.enable_plugin("fragile").await?;

        // simulate the pool reporting a crash
        let observer = ManagerObserver {
            registry: fixture.manager.registry.clone(),
            sync: fixture.manager.sync.clone(),
        };
        observer.on_plugin_crash("fragile", "worker crashed").await;
        assert_eq!(fixture.manager.plugin_state("fragile"), Some(PluginState::Crashed));
        fixture.manager.shutdown().await;
        Ok(())
    }
}
