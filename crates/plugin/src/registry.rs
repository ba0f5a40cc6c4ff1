//! Plugin lifecycle records and permission indexes.

use crate::{codec::PluginMetadata, error::PluginError};
use indexmap::IndexMap;
use std::{collections::HashMap, path::PathBuf};
use tracing::warn;

/// Hook capabilities a plugin may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PluginPermission {
    BlocksOnChange,
    BlocksPreProcess,
    BlocksPostProcess,
    EpochsOnChange,
    EpochsOnFinalized,
    MempoolTxFeed,
    Database,
    ApiAddEndpoints,
    ApiAddWebsocket,
    Threading,
}

impl PluginPermission {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "blocks.onChange" => PluginPermission::BlocksOnChange,
            "blocks.preProcess" => PluginPermission::BlocksPreProcess,
            "blocks.postProcess" => PluginPermission::BlocksPostProcess,
            "epochs.onChange" => PluginPermission::EpochsOnChange,
            "epochs.onFinalized" => PluginPermission::EpochsOnFinalized,
            "mempool.txFeed" => PluginPermission::MempoolTxFeed,
            "database" => PluginPermission::Database,
            "api.addEndpoints" => PluginPermission::ApiAddEndpoints,
            "api.addWebsocket" => PluginPermission::ApiAddWebsocket,
            "threading" => PluginPermission::Threading,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginPermission::BlocksOnChange => "blocks.onChange",
            PluginPermission::BlocksPreProcess => "blocks.preProcess",
            PluginPermission::BlocksPostProcess => "blocks.postProcess",
            PluginPermission::EpochsOnChange => "epochs.onChange",
            PluginPermission::EpochsOnFinalized => "epochs.onFinalized",
            PluginPermission::MempoolTxFeed => "mempool.txFeed",
            PluginPermission::Database => "database",
            PluginPermission::ApiAddEndpoints => "api.addEndpoints",
            PluginPermission::ApiAddWebsocket => "api.addWebsocket",
            PluginPermission::Threading => "threading",
        }
    }

    /// Parse a declared permission list, dropping unknown entries with a
    /// warning.
    pub fn parse_all(plugin_id: &str, declared: &[String]) -> Vec<PluginPermission> {
        let mut permissions = Vec::with_capacity(declared.len());
        for value in declared {
            match Self::parse(value) {
                Some(permission) => permissions.push(permission),
                None => {
                    warn!(target: "opnet::plugin", plugin = %plugin_id, permission = %value, "unknown permission ignored");
                }
            }
        }
        permissions
    }
}

/// Lifecycle state of a registered plugin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PluginState {
    Registered,
    Loaded,
    Enabled,
    Disabled,
    Crashed,
    Unloaded,
}

/// One plugin's registry entry.
#[derive(Clone, Debug)]
pub struct PluginRecord {
    pub id: String,
    pub file_path: PathBuf,
    pub state: PluginState,
    /// Set while `Loaded` or `Enabled`; cleared on unload.
    pub worker_index: Option<usize>,
    pub permissions: Vec<PluginPermission>,
    pub last_crash_reason: Option<String>,
    pub metadata: PluginMetadata,
}

impl PluginRecord {
    pub fn new(id: String, file_path: PathBuf, metadata: PluginMetadata) -> Self {
        let permissions = PluginPermission::parse_all(&id, &metadata.permissions);
        Self {
            id,
            file_path,
            state: PluginState::Registered,
            worker_index: None,
            permissions,
            last_crash_reason: None,
            metadata,
        }
    }

    pub fn has_permission(&self, permission: PluginPermission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Insertion-ordered record store with permission indexes.
///
/// Permission indexes are updated in the same critical section as state
/// transitions; a plugin missing a permission never appears in the
/// corresponding fan-out.
#[derive(Default)]
pub struct PluginRegistry {
    records: IndexMap<String, PluginRecord>,
    by_permission: HashMap<PluginPermission, Vec<String>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, record: PluginRecord) -> Result<(), PluginError> {
        if self.records.contains_key(&record.id) {
            return Err(PluginError::AlreadyRegistered(record.id));
        }
        for permission in &record.permissions {
            self.by_permission.entry(*permission).or_default().push(record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<PluginRecord> {
        let record = self.records.shift_remove(id)?;
        for permission in &record.permissions {
            if let Some(ids) = self.by_permission.get_mut(permission) {
                ids.retain(|i| i != id);
            }
        }
        Some(record)
    }

    pub fn get(&self, id: &str) -> Option<&PluginRecord> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Mark a plugin loaded onto a worker.
    pub fn mark_loaded(&mut self, id: &str, worker_index: usize) -> Result<(), PluginError> {
        let record = self.record_mut(id)?;
        record.state = PluginState::Loaded;
        record.worker_index = Some(worker_index);
        Ok(())
    }

    pub fn set_state(&mut self, id: &str, state: PluginState) -> Result<(), PluginError> {
        let record = self.record_mut(id)?;
        record.state = state;
        if state == PluginState::Unloaded {
            record.worker_index = None;
        }
        Ok(())
    }

    pub fn mark_crashed(&mut self, id: &str, reason: &str) -> Result<(), PluginError> {
        let record = self.record_mut(id)?;
        record.state = PluginState::Crashed;
        record.worker_index = None;
        record.last_crash_reason = Some(reason.to_string());
        Ok(())
    }

    /// Enabled plugin ids, registration order.
    pub fn get_enabled(&self) -> Vec<String> {
        self.records
            .values()
            .filter(|r| r.state == PluginState::Enabled)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Enabled plugins declaring `permission`, registration order.
    pub fn get_with_permission(&self, permission: PluginPermission) -> Vec<String> {
        let Some(ids) = self.by_permission.get(&permission) else { return Vec::new() };
        ids.iter()
            .filter(|id| {
                self.records.get(id.as_str()).is_some_and(|r| r.state == PluginState::Enabled)
            })
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginRecord> {
        self.records.values()
    }

    fn record_mut(&mut self, id: &str) -> Result<&mut PluginRecord, PluginError> {
        self.records.get_mut(id).ok_or_else(|| PluginError::PluginNotRegistered(id.to_string()))
    }
}
