//! The thread manager: one fabric per role, plus the plumbing that only
//! exists between fabrics — direct worker-to-worker links and routing of
//! parent-addressed requests.

use crate::{
    error::FabricError,
    fabric::{FabricEvent, WorkerFabric},
};
use opnet_types::{
    duplex_port, LinkDirection, MessageEnvelope, ThreadData, ThreadMessage, WorkerRole,
    ENVELOPE_CHANNEL_CAPACITY,
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

struct ManagerInner {
    fabrics: RwLock<HashMap<WorkerRole, WorkerFabric>>,
}

/// Owns every fabric in the process.
#[derive(Clone)]
pub struct ThreadManager {
    inner: Arc<ManagerInner>,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadManager {
    pub fn new() -> Self {
        Self { inner: Arc::new(ManagerInner { fabrics: RwLock::new(HashMap::new()) }) }
    }

    /// Register a fabric and start consuming its upward events.
    pub fn register(&self, fabric: WorkerFabric) {
        let role = fabric.role();
        let events = fabric.take_events();
        self.inner.fabrics.write().insert(role, fabric);

        let Some(mut events) = events else {
            warn!(target: "opnet::fabric", %role, "fabric events already consumed; links disabled for role");
            return;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                handle_event(&inner, role, event).await;
            }
        });
    }

    /// The fabric serving `role`, if registered.
    pub fn fabric(&self, role: WorkerRole) -> Option<WorkerFabric> {
        self.inner.fabrics.read().get(&role).cloned()
    }

    /// Dispatch a request to a role's fabric.
    pub async fn execute(
        &self,
        role: WorkerRole,
        message: ThreadMessage,
    ) -> Result<ThreadData, FabricError> {
        let fabric = self.fabric(role).ok_or(FabricError::NoWorkers(role))?;
        fabric.execute(message).await
    }

    /// Shut every fabric down.
    pub async fn shutdown(&self) {
        let fabrics: Vec<_> = self.inner.fabrics.read().values().cloned().collect();
        for fabric in fabrics {
            fabric.shutdown().await;
        }
    }
}

async fn handle_event(inner: &Arc<ManagerInner>, source_role: WorkerRole, event: FabricEvent) {
    match event {
        FabricEvent::LinkRequest { source_role, source_index, target } => {
            let (source, dest) = {
                let fabrics = inner.fabrics.read();
                (fabrics.get(&source_role).cloned(), fabrics.get(&target).cloned())
            };
            let (Some(source), Some(dest)) = (source, dest) else {
                warn!(target: "opnet::fabric", %source_role, %target, "link request to unregistered role dropped");
                return;
            };

            let (source_end, target_end) = duplex_port(ENVELOPE_CHANNEL_CAPACITY);
            let to_target = MessageEnvelope::notify(ThreadMessage::LinkThread {
                role: source_role,
                direction: LinkDirection::Tx,
                port: target_end,
            });
            if let Err(e) = dest.send_to_next_worker(to_target).await {
                warn!(target: "opnet::fabric", %target, error = %e, "failed to deliver link endpoint to target");
                return;
            }
            let to_source = MessageEnvelope::notify(ThreadMessage::LinkThread {
                role: target,
                direction: LinkDirection::Rx,
                port: source_end,
            });
            if let Err(e) = source.send_to_worker(source_index, to_source).await {
                warn!(target: "opnet::fabric", %source_role, source_index, error = %e, "failed to deliver link endpoint to source");
            }
        }
        FabricEvent::Envelope { source_index, envelope } => {
            route_to_server(inner, source_role, source_index, envelope).await;
        }
    }
}

/// Serve a worker-originated request addressed to the parent by forwarding it
/// to the RPC fan-out fabric and relaying the response to the source worker.
async fn route_to_server(
    inner: &Arc<ManagerInner>,
    source_role: WorkerRole,
    source_index: usize,
    envelope: MessageEnvelope,
) {
    let MessageEnvelope { task_id, to_server, message } = envelope;
    match message {
        ThreadMessage::RpcMethod(call) if to_server => {
            let (source, rpc) = {
                let fabrics = inner.fabrics.read();
                (fabrics.get(&source_role).cloned(), fabrics.get(&WorkerRole::Rpc).cloned())
            };
            let Some(source) = source else { return };
            tokio::spawn(async move {
                let data = match rpc {
                    Some(rpc) => rpc
                        .execute(ThreadMessage::RpcMethod(call))
                        .await
                        .unwrap_or_else(|e| ThreadData::Error(e.to_string())),
                    None => ThreadData::Error("rpc fabric not registered".to_string()),
                };
                let Some(task_id) = task_id else { return };
                if let Err(e) =
                    source.send_to_worker(source_index, MessageEnvelope::response(task_id, data)).await
                {
                    warn!(target: "opnet::fabric", %source_role, source_index, error = %e, "failed to relay rpc response");
                }
            });
        }
        other => {
            debug!(target: "opnet::fabric", %source_role, source_index, message = ?other, "unroutable envelope dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fabric::FabricOptions,
        worker::{Worker, WorkerChannel},
    };
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Requests a link to the mempool role on startup, then pings the link.
    struct LinkSource;

    #[async_trait]
    impl Worker for LinkSource {
        async fn run(self: Box<Self>, channel: WorkerChannel) {
            let Some(mut conn) = channel.attach().await else { return };
            let _ = conn.request_link(WorkerRole::Mempool).await;
            while let Some(envelope) = conn.next().await {
                match envelope.message {
                    ThreadMessage::LinkThread { port, .. } => {
                        let _ = port.tx.send(MessageEnvelope::notify(ThreadMessage::StartIndexer)).await;
                    }
                    ThreadMessage::ExitThread => break,
                    _ => {}
                }
            }
        }
    }

    /// Accepts a link endpoint and reports traffic on it to the test.
    struct LinkTarget {
        seen: mpsc::Sender<&'static str>,
    }

    #[async_trait]
    impl Worker for LinkTarget {
        async fn run(self: Box<Self>, channel: WorkerChannel) {
            let Some(mut conn) = channel.attach().await else { return };
            while let Some(envelope) = conn.next().await {
                match envelope.message {
                    ThreadMessage::LinkThread { mut port, .. } => {
                        let seen = self.seen.clone();
                        tokio::spawn(async move {
                            if let Some(env) = port.rx.recv().await {
                                if matches!(env.message, ThreadMessage::StartIndexer) {
                                    let _ = seen.send("linked").await;
                                }
                            }
                        });
                    }
                    ThreadMessage::ExitThread => break,
                    _ => {}
                }
            }
        }
    }

    #[tokio::test]
    async fn workers_of_two_roles_get_linked() -> eyre::Result<()> {
        let manager = ThreadManager::new();
        let (seen_tx, mut seen_rx) = mpsc::channel(1);

        let targets = WorkerFabric::new(
            WorkerRole::Mempool,
            move |_index: usize| Box::new(LinkTarget { seen: seen_tx.clone() }) as Box<dyn Worker>,
            FabricOptions::default(),
        );
        let sources = WorkerFabric::new(
            WorkerRole::Indexer,
            |_index: usize| Box::new(LinkSource) as Box<dyn Worker>,
            FabricOptions::default(),
        );

        manager.register(targets.clone());
        manager.register(sources.clone());
        targets.spawn(1).await;
        sources.spawn(1).await;

        let seen = tokio::time::timeout(std::time::Duration::from_secs(5), seen_rx.recv()).await?;
        assert_eq!(seen, Some("linked"));
        manager.shutdown().await;
        Ok(())
    }
}
