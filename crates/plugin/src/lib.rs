//! The plugin runtime.
//!
//! Signed `.opnet` containers are parsed and verified by [codec], tracked by
//! the [registry], hosted in the [pool]'s workers, driven through [hooks],
//! and their indexing progress is tracked by [sync]. The [manager] ties the
//! pieces together for the node.

pub mod codec;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod sync;

pub use codec::{
    discover_plugins, write_plugin_file, DiscoveredPlugin, MldsaKeypair, MldsaLevel, PluginFile,
    PluginMetadata, PluginType,
};
pub use error::{PluginError, PluginFileError};
pub use hooks::{HookDispatcher, HookKind, HookMode, HookSpec};
pub use manager::{PluginManager, PluginManagerConfig};
pub use pool::{
    HookOutcome, NoopObserver, PluginRuntime, PluginWorkerPool, PoolObserver, SyncStateSender,
};
pub use registry::{PluginPermission, PluginRecord, PluginRegistry, PluginState};
pub use sync::{
    reindex_check, sync_status, PluginSyncState, ReindexAction, ReindexCheck, ReindexDirective,
    SyncStateTracker, SyncStatus,
};
