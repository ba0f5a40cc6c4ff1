//! Plugin runtime error types.

use opnet_storage::StoreError;
use thiserror::Error;

/// Integrity failures parsing a `.opnet` container. A file failing any of
/// these is rejected and never registered.
#[derive(Debug, Error)]
pub enum PluginFileError {
    #[error("plugin file too small: {0} bytes")]
    FileTooSmall(usize),
    #[error("invalid magic")]
    InvalidMagic,
    #[error("unsupported plugin format version {0}")]
    UnsupportedFormatVersion(u32),
    #[error("unsupported ML-DSA level {0}")]
    UnsupportedMldsaLevel(u8),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("bad plugin signature")]
    BadSignature,
    #[error("invalid metadata json: {0}")]
    InvalidMetadataJson(#[from] serde_json::Error),
    #[error("mldsa failure: {0}")]
    Crypto(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the registry, the worker pool, and the manager.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0} is not loaded")]
    PluginNotLoaded(String),
    #[error("plugin {0} is not registered")]
    PluginNotRegistered(String),
    #[error("plugin {0} is already registered")]
    AlreadyRegistered(String),
    #[error("plugin worker {0} is unavailable")]
    WorkerUnavailable(usize),
    #[error("plugin {id} failed to load: {reason}")]
    LoadFailed { id: String, reason: String },
    #[error("plugin worker channel closed")]
    ChannelClosed,
    #[error(transparent)]
    File(#[from] PluginFileError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
