//! Per-plugin sync-state tracking and the reindex decision engine.

use crate::error::PluginError;
use opnet_storage::{KeyValueStore, StoreError};
use opnet_types::{now_millis, Network};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Collection name in the KV collaborator.
const SYNC_STATE_COLLECTION: &str = "plugin_sync_state";

/// Persisted indexing progress of one plugin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSyncState {
    pub plugin_id: String,
    pub installed_version: String,
    pub chain_id: u32,
    pub network: Network,
    pub enabled_at_block: u64,
    pub last_synced_block: u64,
    pub sync_completed: bool,
    #[serde(default)]
    pub collections: Vec<String>,
    pub updated_at: u64,
}

/// Operator instruction to rewind plugins to a prior height and resync.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReindexDirective {
    pub enabled: bool,
    pub from_block: u64,
    pub in_progress: bool,
}

/// How far a plugin is from the chain tip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    NeverSynced,
    Synced,
    Behind { blocks_behind: u64 },
}

/// What the reindex engine decided for a plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReindexAction {
    None,
    Purge,
    Sync,
}

/// Decision derived from a [ReindexDirective] and a plugin's last synced
/// block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReindexCheck {
    pub action: ReindexAction,
    pub purge_to_block: Option<u64>,
    pub requires_sync: bool,
    pub sync_from_block: Option<u64>,
    pub sync_to_block: Option<u64>,
}

impl ReindexCheck {
    const NONE: ReindexCheck = ReindexCheck {
        action: ReindexAction::None,
        purge_to_block: None,
        requires_sync: false,
        sync_from_block: None,
        sync_to_block: None,
    };
}

/// Classify a plugin's progress against the chain tip.
pub fn sync_status(state: Option<&PluginSyncState>, chain_tip: u64) -> SyncStatus {
    match state {
        None => SyncStatus::NeverSynced,
        Some(state) if state.last_synced_block >= chain_tip => SyncStatus::Synced,
        Some(state) => SyncStatus::Behind { blocks_behind: chain_tip - state.last_synced_block },
    }
}

/// The reindex decision. Pure in (directive, last synced block).
pub fn reindex_check(directive: Option<&ReindexDirective>, last_synced_block: u64) -> ReindexCheck {
    let Some(directive) = directive else { return ReindexCheck::NONE };
    if !directive.enabled {
        return ReindexCheck::NONE;
    }
    if last_synced_block > directive.from_block {
        // the plugin indexed past the rewind point: purge back, then resync
        ReindexCheck {
            action: ReindexAction::Purge,
            purge_to_block: Some(directive.from_block),
            requires_sync: true,
            sync_from_block: Some(directive.from_block),
            sync_to_block: None,
        }
    } else if last_synced_block < directive.from_block {
        ReindexCheck {
            action: ReindexAction::Sync,
            purge_to_block: None,
            requires_sync: true,
            sync_from_block: Some(last_synced_block),
            sync_to_block: Some(directive.from_block),
        }
    } else {
        ReindexCheck::NONE
    }
}

/// Persists per-plugin sync state through the KV collaborator.
///
/// Mutations are serialized per plugin and written through before the call
/// returns.
pub struct SyncStateTracker {
    store: Arc<dyn KeyValueStore>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SyncStateTracker {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store, locks: Mutex::new(HashMap::new()) }
    }

    pub async fn get_state(&self, plugin_id: &str) -> Result<Option<PluginSyncState>, PluginError> {
        let raw = self.store.get(SYNC_STATE_COLLECTION, plugin_id.as_bytes()).await?;
        raw.map(|bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|e| PluginError::Store(StoreError::Codec(e.to_string())))
        })
        .transpose()
    }

    /// Install the initial state for a freshly enabled plugin.
    pub async fn init_state(&self, state: PluginSyncState) -> Result<(), PluginError> {
        let guard = self.plugin_lock(&state.plugin_id);
        let _held = guard.lock().await;
        self.persist(&state).await
    }

    pub async fn update_last_synced_block(
        &self,
        plugin_id: &str,
        last_synced_block: u64,
        sync_completed: bool,
    ) -> Result<(), PluginError> {
        self.mutate(plugin_id, |state| {
            state.last_synced_block = last_synced_block;
            state.sync_completed = sync_completed;
        })
        .await
    }

    pub async fn mark_sync_completed(&self, plugin_id: &str) -> Result<(), PluginError> {
        self.mutate(plugin_id, |state| state.sync_completed = true).await
    }

    /// Rewind a plugin to `block`, e.g. after a reorg or purge.
    pub async fn reset_sync_state_to_block(
        &self,
        plugin_id: &str,
        block: u64,
    ) -> Result<(), PluginError> {
        self.mutate(plugin_id, |state| {
            state.last_synced_block = block;
            state.sync_completed = false;
        })
        .await
    }

    pub async fn delete_state(&self, plugin_id: &str) -> Result<(), PluginError> {
        let guard = self.plugin_lock(plugin_id);
        let _held = guard.lock().await;
        self.store.delete(SYNC_STATE_COLLECTION, plugin_id.as_bytes()).await?;
        Ok(())
    }

    async fn mutate(
        &self,
        plugin_id: &str,
        apply: impl FnOnce(&mut PluginSyncState),
    ) -> Result<(), PluginError> {
        let guard = self.plugin_lock(plugin_id);
        let _held = guard.lock().await;
        let mut state = self
            .get_state(plugin_id)
            .await?
            .ok_or_else(|| PluginError::PluginNotRegistered(plugin_id.to_string()))?;
        apply(&mut state);
        state.updated_at = now_millis();
        self.persist(&state).await
    }

    async fn persist(&self, state: &PluginSyncState) -> Result<(), PluginError> {
        let bytes = serde_json::to_vec(state)
            .map_err(|e| PluginError::Store(StoreError::Codec(e.to_string())))?;
        self.store.put(SYNC_STATE_COLLECTION, state.plugin_id.as_bytes(), bytes).await?;
        debug!(target: "opnet::plugin", plugin = %state.plugin_id, last_synced = state.last_synced_block, "sync state persisted");
        Ok(())
    }

    fn plugin_lock(&self, plugin_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(plugin_id.to_string()).or_default().clone()
    }
}
