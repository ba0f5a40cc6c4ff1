//! Worker-side types: the [Worker] trait and the channel a worker drives.

use crate::error::FabricError;
use async_trait::async_trait;
use opnet_types::{MessageEnvelope, MessagePort, TaskId, ThreadData, ThreadMessage, WorkerRole};
use tokio::sync::mpsc;

/// Lifecycle state of a worker slot.
///
/// `Dead` transitions back to `Spawning` automatically after the restart
/// backoff unless the fabric is shutting down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Spawning,
    Online,
    Draining,
    Dead,
}

/// Behavior hosted by a fabric worker slot.
///
/// The future returned by `run` is the worker: when it completes the slot is
/// considered dead and the fabric restarts it.
#[async_trait]
pub trait Worker: Send + 'static {
    async fn run(self: Box<Self>, channel: WorkerChannel);
}

/// Builds a fresh worker for a slot index, on spawn and on every restart.
pub trait WorkerBuilder: Send + Sync + 'static {
    fn build(&self, index: usize) -> Box<dyn Worker>;
}

impl<F> WorkerBuilder for F
where
    F: Fn(usize) -> Box<dyn Worker> + Send + Sync + 'static,
{
    fn build(&self, index: usize) -> Box<dyn Worker> {
        (self)(index)
    }
}

/// The bootstrap channel handed to a freshly spawned worker.
///
/// The first envelope the parent sends is `SetMessagePort` carrying the
/// dedicated sub-channel the worker uses for all subsequent traffic.
pub struct WorkerChannel {
    role: WorkerRole,
    bootstrap: MessagePort,
}

impl WorkerChannel {
    pub(crate) fn new(role: WorkerRole, bootstrap: MessagePort) -> Self {
        Self { role, bootstrap }
    }

    /// The role this worker serves.
    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// Wait for the dedicated port. Returns `None` if the parent went away
    /// before handing one over.
    pub async fn attach(mut self) -> Option<WorkerConnection> {
        while let Some(envelope) = self.bootstrap.rx.recv().await {
            match envelope.message {
                ThreadMessage::SetMessagePort { port } => {
                    return Some(WorkerConnection { role: self.role, port })
                }
                other => {
                    tracing::warn!(target: "opnet::fabric", role = %self.role, message = ?other, "envelope before SetMessagePort dropped");
                }
            }
        }
        None
    }
}

/// A worker's dedicated connection to its fabric.
pub struct WorkerConnection {
    role: WorkerRole,
    port: MessagePort,
}

impl WorkerConnection {
    /// Next inbound envelope, FIFO per channel.
    pub async fn next(&mut self) -> Option<MessageEnvelope> {
        self.port.rx.recv().await
    }

    /// Resolve a request by task id.
    pub async fn respond(&self, task_id: TaskId, data: ThreadData) -> Result<(), FabricError> {
        self.send(MessageEnvelope::response(task_id, data)).await
    }

    /// Send an envelope to the parent.
    pub async fn send(&self, envelope: MessageEnvelope) -> Result<(), FabricError> {
        self.port.tx.send(envelope).await.map_err(|_| FabricError::ChannelClosed(self.role))
    }

    /// Ask the fabric for a direct link to a worker of `target`.
    pub async fn request_link(&self, target: WorkerRole) -> Result<(), FabricError> {
        self.send(MessageEnvelope::notify(ThreadMessage::LinkThreadRequest { target })).await
    }

    /// A clonable handle for resolving requests from spawned sub-tasks.
    pub fn reply_handle(&self) -> ReplyHandle {
        ReplyHandle { role: self.role, tx: self.port.tx.clone() }
    }
}

/// Sender half of a worker connection, for responses produced off the main
/// worker loop.
#[derive(Clone)]
pub struct ReplyHandle {
    role: WorkerRole,
    tx: mpsc::Sender<MessageEnvelope>,
}

impl ReplyHandle {
    pub async fn respond(&self, task_id: TaskId, data: ThreadData) -> Result<(), FabricError> {
        self.tx
            .send(MessageEnvelope::response(task_id, data))
            .await
            .map_err(|_| FabricError::ChannelClosed(self.role))
    }
}
