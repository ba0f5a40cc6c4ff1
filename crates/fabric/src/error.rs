//! Error types for the worker fabric.

use opnet_types::WorkerRole;
use std::time::Duration;
use thiserror::Error;

/// Fabric error type.
#[derive(Debug, Error)]
pub enum FabricError {
    /// No worker of the role is currently accepting envelopes.
    #[error("no live workers for role {0}")]
    NoWorkers(WorkerRole),
    /// The worker channel closed before the envelope was delivered.
    #[error("worker channel closed for role {0}")]
    ChannelClosed(WorkerRole),
    /// No response arrived before the request timer fired.
    ///
    /// The worker-side computation is not cancelled; its response, if any,
    /// is discarded.
    #[error("response timed out after {0:?}")]
    ResponseTimeout(Duration),
    /// The fabric is draining and no longer accepts requests.
    #[error("fabric for role {0} is shutting down")]
    ShuttingDown(WorkerRole),
    /// A link was requested to a role no fabric serves.
    #[error("link target role {0} is not registered")]
    UnknownLinkTarget(WorkerRole),
    /// The addressed worker index does not exist.
    #[error("no worker at index {index} for role {role}")]
    UnknownWorker { role: WorkerRole, index: usize },
}
