//! Hook kinds, the fixed dispatch table, and the dispatcher.

use crate::{
    pool::{HookOutcome, PluginWorkerPool},
    registry::{PluginPermission, PluginRegistry},
};
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tracing::warn;

/// Execution mode of a hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookMode {
    /// Every eligible plugin runs concurrently; all results are collected.
    Parallel,
    /// Plugins run in registry-insertion order.
    Sequential,
}

/// Per-hook dispatch configuration, fixed at compile time.
#[derive(Clone, Copy, Debug)]
pub struct HookSpec {
    pub mode: HookMode,
    pub timeout: Duration,
    /// Plugins must declare this permission to see the hook.
    pub permission: Option<PluginPermission>,
    /// For sequential hooks: whether later plugins still run after a failure.
    pub continue_on_error: bool,
}

/// Event points the host dispatches to plugins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    Load,
    Unload,
    Enable,
    Disable,
    BlockPreProcess,
    BlockPostProcess,
    BlockChange,
    EpochChange,
    EpochFinalized,
    MempoolTransaction,
    Reorg,
    ReindexRequired,
    PurgeBlocks,
}

impl HookKind {
    /// The fixed dispatch table.
    pub const fn spec(&self) -> HookSpec {
        const fn sequential(timeout_secs: u64) -> HookSpec {
            HookSpec {
                mode: HookMode::Sequential,
                timeout: Duration::from_secs(timeout_secs),
                permission: None,
                continue_on_error: false,
            }
        }
        const fn parallel(timeout_secs: u64, permission: PluginPermission) -> HookSpec {
            HookSpec {
                mode: HookMode::Parallel,
                timeout: Duration::from_secs(timeout_secs),
                permission: Some(permission),
                continue_on_error: true,
            }
        }
        match self {
            HookKind::Load | HookKind::Unload | HookKind::Enable | HookKind::Disable => {
                sequential(30)
            }
            HookKind::BlockPreProcess => parallel(30, PluginPermission::BlocksPreProcess),
            HookKind::BlockPostProcess => parallel(30, PluginPermission::BlocksPostProcess),
            HookKind::BlockChange => parallel(30, PluginPermission::BlocksOnChange),
            HookKind::EpochChange => parallel(30, PluginPermission::EpochsOnChange),
            HookKind::EpochFinalized => parallel(30, PluginPermission::EpochsOnFinalized),
            HookKind::MempoolTransaction => parallel(10, PluginPermission::MempoolTxFeed),
            // reorg coordination can rewrite large ranges of storage
            HookKind::Reorg => sequential(300),
            HookKind::ReindexRequired => sequential(600),
            HookKind::PurgeBlocks => sequential(600),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookKind::Load => "load",
            HookKind::Unload => "unload",
            HookKind::Enable => "enable",
            HookKind::Disable => "disable",
            HookKind::BlockPreProcess => "blockPreProcess",
            HookKind::BlockPostProcess => "blockPostProcess",
            HookKind::BlockChange => "blockChange",
            HookKind::EpochChange => "epochChange",
            HookKind::EpochFinalized => "epochFinalized",
            HookKind::MempoolTransaction => "mempoolTransaction",
            HookKind::Reorg => "reorg",
            HookKind::ReindexRequired => "reindexRequired",
            HookKind::PurgeBlocks => "purgeBlocks",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "load" => HookKind::Load,
            "unload" => HookKind::Unload,
            "enable" => HookKind::Enable,
            "disable" => HookKind::Disable,
            "blockPreProcess" => HookKind::BlockPreProcess,
            "blockPostProcess" => HookKind::BlockPostProcess,
            "blockChange" => HookKind::BlockChange,
            "epochChange" => HookKind::EpochChange,
            "epochFinalized" => HookKind::EpochFinalized,
            "mempoolTransaction" => HookKind::MempoolTransaction,
            "reorg" => HookKind::Reorg,
            "reindexRequired" => HookKind::ReindexRequired,
            "purgeBlocks" => HookKind::PurgeBlocks,
            _ => return None,
        })
    }
}

impl std::fmt::Display for HookKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fans hooks out to eligible plugins through the worker pool.
pub struct HookDispatcher {
    registry: Arc<RwLock<PluginRegistry>>,
    pool: PluginWorkerPool,
}

impl HookDispatcher {
    pub fn new(registry: Arc<RwLock<PluginRegistry>>, pool: PluginWorkerPool) -> Self {
        Self { registry, pool }
    }

    /// Dispatch a hook to every eligible plugin.
    ///
    /// Parallel hooks collect every result regardless of individual failures;
    /// no plugin failure crosses this boundary as an error. Sequential hooks
    /// halt at the first failure unless the table says otherwise.
    pub async fn dispatch(&self, hook: HookKind, payload: serde_json::Value) -> Vec<HookOutcome> {
        let spec = hook.spec();
        let eligible = {
            let registry = self.registry.read();
            match spec.permission {
                Some(permission) => registry.get_with_permission(permission),
                None => registry.get_enabled(),
            }
        };
        self.dispatch_to_plugins(hook, eligible, payload).await
    }

    /// Dispatch a hook by external name. Unknown names produce an empty
    /// result set.
    pub async fn dispatch_named(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Vec<HookOutcome> {
        match HookKind::parse(name) {
            Some(hook) => self.dispatch(hook, payload).await,
            None => {
                warn!(target: "opnet::plugin", hook = %name, "unknown hook type; nothing dispatched");
                Vec::new()
            }
        }
    }

    /// Dispatch a hook to a specific set of plugins, honoring the hook's
    /// execution mode.
    pub async fn dispatch_to_plugins(
        &self,
        hook: HookKind,
        plugin_ids: Vec<String>,
        payload: serde_json::Value,
    ) -> Vec<HookOutcome> {
        let spec = hook.spec();
        match spec.mode {
            HookMode::Parallel => {
                let calls = plugin_ids.into_iter().map(|id| {
                    let payload = payload.clone();
                    let pool = &self.pool;
                    async move {
                        pool.execute_hook_with_result(&id, hook, payload, Some(spec.timeout)).await
                    }
                });
                futures::future::join_all(calls).await
            }
            HookMode::Sequential => {
                let mut outcomes = Vec::with_capacity(plugin_ids.len());
                for id in plugin_ids {
                    let outcome = self
                        .pool
                        .execute_hook_with_result(&id, hook, payload.clone(), Some(spec.timeout))
                        .await;
                    let failed = !outcome.success;
                    outcomes.push(outcome);
                    if failed && !spec.continue_on_error {
                        break;
                    }
                }
                outcomes
            }
        }
    }

    /// Dispatch a lifecycle hook to one plugin.
    pub async fn dispatch_to(
        &self,
        plugin_id: &str,
        hook: HookKind,
        payload: serde_json::Value,
    ) -> HookOutcome {
        let spec = hook.spec();
        self.pool.execute_hook_with_result(plugin_id, hook, payload, Some(spec.timeout)).await
    }
}
