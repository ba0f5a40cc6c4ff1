//! A population of workers serving one role.

use crate::{
    error::FabricError,
    worker::{WorkerBuilder, WorkerChannel, WorkerState},
};
use opnet_types::{
    duplex_port, MessageEnvelope, TaskId, ThreadData, ThreadMessage, WorkerRole,
    ENVELOPE_CHANNEL_CAPACITY,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, timeout, Instant},
};
use tracing::{debug, error, info, warn};

/// Tunables for a fabric. Defaults match production behavior.
#[derive(Clone, Copy, Debug)]
pub struct FabricOptions {
    /// How long `execute` waits for the matching `ThreadResponse`.
    pub response_timeout: Duration,
    /// Bound of every worker sub-channel.
    pub channel_capacity: usize,
    /// Delay between consecutive spawns to reduce thundering-herd on
    /// dependencies.
    pub spawn_stagger: Duration,
    /// Backoff before a dead worker is respawned.
    pub restart_backoff: Duration,
}

impl Default for FabricOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            channel_capacity: ENVELOPE_CHANNEL_CAPACITY,
            spawn_stagger: Duration::from_millis(200),
            restart_backoff: Duration::from_secs(1),
        }
    }
}

/// Upward traffic a fabric cannot resolve on its own.
#[derive(Debug)]
pub enum FabricEvent {
    /// A worker asked for a direct link to a worker of another role.
    LinkRequest { source_role: WorkerRole, source_index: usize, target: WorkerRole },
    /// Any other worker-originated envelope, e.g. an `RpcMethod` addressed to
    /// the parent.
    Envelope { source_index: usize, envelope: MessageEnvelope },
}

struct WorkerSlot {
    state: WorkerState,
    sender: mpsc::Sender<MessageEnvelope>,
}

struct FabricInner {
    role: WorkerRole,
    builder: Box<dyn WorkerBuilder>,
    options: FabricOptions,
    slots: Mutex<Vec<WorkerSlot>>,
    next: AtomicUsize,
    tasks: Mutex<HashMap<TaskId, oneshot::Sender<ThreadData>>>,
    shutting_down: AtomicBool,
    events_tx: mpsc::Sender<FabricEvent>,
}

/// Handle to a worker population of one role.
#[derive(Clone)]
pub struct WorkerFabric {
    inner: Arc<FabricInner>,
    events_rx: Arc<Mutex<Option<mpsc::Receiver<FabricEvent>>>>,
}

impl WorkerFabric {
    /// Create a fabric. No workers exist until [WorkerFabric::spawn].
    pub fn new<B: WorkerBuilder>(role: WorkerRole, builder: B, options: FabricOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(options.channel_capacity);
        let inner = Arc::new(FabricInner {
            role,
            builder: Box::new(builder),
            options,
            slots: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            tasks: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            events_tx,
        });
        Self { inner, events_rx: Arc::new(Mutex::new(Some(events_rx))) }
    }

    pub fn role(&self) -> WorkerRole {
        self.inner.role
    }

    /// Take the upward event stream. The [crate::ThreadManager] consumes it;
    /// it can only be taken once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<FabricEvent>> {
        self.events_rx.lock().take()
    }

    /// Spawn `count` workers, staggered to avoid a thundering herd.
    pub async fn spawn(&self, count: usize) {
        for i in 0..count {
            let index = self.inner.slots.lock().len();
            spawn_worker(&self.inner, index);
            if i + 1 < count {
                sleep(self.inner.options.spawn_stagger).await;
            }
        }
    }

    /// Dispatch a request to the next worker and await the matching response.
    ///
    /// The future resolves exactly once: with the response data, or with
    /// [FabricError::ResponseTimeout] after the configured timeout. A timeout
    /// never cancels the worker-side computation.
    pub async fn execute(&self, message: ThreadMessage) -> Result<ThreadData, FabricError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(FabricError::ShuttingDown(self.inner.role));
        }
        let sender = self.next_sender()?;
        let task_id = TaskId::random();
        let (tx, rx) = oneshot::channel();
        self.inner.tasks.lock().insert(task_id, tx);

        if sender.send(MessageEnvelope::request(task_id, message)).await.is_err() {
            self.inner.tasks.lock().remove(&task_id);
            return Err(FabricError::ChannelClosed(self.inner.role));
        }

        match timeout(self.inner.options.response_timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(FabricError::ChannelClosed(self.inner.role)),
            Err(_) => {
                self.inner.tasks.lock().remove(&task_id);
                Err(FabricError::ResponseTimeout(self.inner.options.response_timeout))
            }
        }
    }

    /// Fire-and-forget dispatch. A task id is still assigned so downstream
    /// logs can correlate.
    pub async fn execute_no_resp(&self, message: ThreadMessage) -> Result<TaskId, FabricError> {
        let task_id = TaskId::random();
        let sender = self.next_sender()?;
        sender
            .send(MessageEnvelope { task_id: Some(task_id), to_server: false, message })
            .await
            .map_err(|_| FabricError::ChannelClosed(self.inner.role))?;
        Ok(task_id)
    }

    /// Deliver an envelope to a specific worker index.
    pub async fn send_to_worker(
        &self,
        index: usize,
        envelope: MessageEnvelope,
    ) -> Result<(), FabricError> {
        let sender = {
            let slots = self.inner.slots.lock();
            let slot = slots
                .get(index)
                .ok_or(FabricError::UnknownWorker { role: self.inner.role, index })?;
            slot.sender.clone()
        };
        sender.send(envelope).await.map_err(|_| FabricError::ChannelClosed(self.inner.role))
    }

    /// Deliver an envelope to the next worker in round-robin order.
    pub async fn send_to_next_worker(&self, envelope: MessageEnvelope) -> Result<(), FabricError> {
        let sender = self.next_sender()?;
        sender.send(envelope).await.map_err(|_| FabricError::ChannelClosed(self.inner.role))
    }

    /// Snapshot of per-slot states, index order.
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.inner.slots.lock().iter().map(|s| s.state).collect()
    }

    /// Drain and stop every worker. Dead workers are not restarted once this
    /// has been called.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        let senders: Vec<_> = {
            let mut slots = self.inner.slots.lock();
            for slot in slots.iter_mut() {
                if slot.state != WorkerState::Dead {
                    slot.state = WorkerState::Draining;
                }
            }
            slots.iter().map(|s| s.sender.clone()).collect()
        };
        for sender in senders {
            let _ = sender.send(MessageEnvelope::notify(ThreadMessage::ExitThread)).await;
        }

        // wait for the monitors to observe worker exit
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let all_dead =
                self.inner.slots.lock().iter().all(|s| s.state == WorkerState::Dead);
            if all_dead || Instant::now() >= deadline {
                break;
            }
            sleep(Duration::from_millis(25)).await;
        }
        info!(target: "opnet::fabric", role = %self.inner.role, "fabric shut down");
    }

    /// Round-robin pick over live workers; the index advances modulo the
    /// live count.
    fn next_sender(&self) -> Result<mpsc::Sender<MessageEnvelope>, FabricError> {
        let slots = self.inner.slots.lock();
        let live: Vec<&WorkerSlot> = slots
            .iter()
            .filter(|s| matches!(s.state, WorkerState::Spawning | WorkerState::Online))
            .collect();
        if live.is_empty() {
            return Err(FabricError::NoWorkers(self.inner.role));
        }
        let pick = self.inner.next.fetch_add(1, Ordering::Relaxed) % live.len();
        Ok(live[pick].sender.clone())
    }
}

fn set_slot(inner: &FabricInner, index: usize, slot: WorkerSlot) {
    let mut slots = inner.slots.lock();
    if index < slots.len() {
        slots[index] = slot;
    } else {
        debug_assert_eq!(index, slots.len());
        slots.push(slot);
    }
}

fn set_state(inner: &FabricInner, index: usize, state: WorkerState) {
    if let Some(slot) = inner.slots.lock().get_mut(index) {
        slot.state = state;
    }
}

/// Spawn (or respawn) the worker at `index` and its router/monitor tasks.
fn spawn_worker(inner: &Arc<FabricInner>, index: usize) {
    let capacity = inner.options.channel_capacity;
    let (parent_boot, worker_boot) = duplex_port(capacity);
    let (parent_port, worker_port) = duplex_port(capacity);

    let worker = inner.builder.build(index);
    let join = tokio::spawn(worker.run(WorkerChannel::new(inner.role, worker_boot)));

    set_slot(inner, index, WorkerSlot { state: WorkerState::Spawning, sender: parent_port.tx });
    debug!(target: "opnet::fabric", role = %inner.role, index, "worker spawning");

    // hand the dedicated endpoint to the worker over the bootstrap channel
    let boot_inner = inner.clone();
    tokio::spawn(async move {
        let handed = parent_boot
            .tx
            .send(MessageEnvelope::notify(ThreadMessage::SetMessagePort { port: worker_port }))
            .await;
        match handed {
            Ok(()) => set_state(&boot_inner, index, WorkerState::Online),
            Err(_) => {
                warn!(target: "opnet::fabric", role = %boot_inner.role, index, "worker dropped bootstrap channel");
            }
        }
    });

    // router: resolve responses, forward the rest upward
    let router_inner = inner.clone();
    let mut rx = parent_port.rx;
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            route_envelope(&router_inner, index, envelope).await;
        }
    });

    // monitor: detect worker exit and heal the slot
    let monitor_inner = inner.clone();
    tokio::spawn(async move {
        let result = join.await;
        set_state(&monitor_inner, index, WorkerState::Dead);
        if monitor_inner.shutting_down.load(Ordering::Acquire) {
            return;
        }
        match result {
            Ok(()) => {
                error!(target: "opnet::fabric", role = %monitor_inner.role, index, "worker exited unexpectedly");
            }
            Err(e) => {
                error!(target: "opnet::fabric", role = %monitor_inner.role, index, exit = %e, "worker crashed");
            }
        }
        sleep(monitor_inner.options.restart_backoff).await;
        if !monitor_inner.shutting_down.load(Ordering::Acquire) {
            info!(target: "opnet::fabric", role = %monitor_inner.role, index, "restarting worker");
            spawn_worker(&monitor_inner, index);
        }
    });
}

async fn route_envelope(inner: &Arc<FabricInner>, index: usize, envelope: MessageEnvelope) {
    let MessageEnvelope { task_id, to_server, message } = envelope;
    match message {
        ThreadMessage::ThreadResponse { data } => match task_id {
            Some(task_id) => {
                let waiter = inner.tasks.lock().remove(&task_id);
                match waiter {
                    // the receiver may have timed out; discarding is fine
                    Some(tx) => drop(tx.send(data)),
                    None => {
                        debug!(target: "opnet::fabric", role = %inner.role, index, %task_id, "response for expired task dropped");
                    }
                }
            }
            None => {
                warn!(target: "opnet::fabric", role = %inner.role, index, "response without task id dropped");
            }
        },
        ThreadMessage::LinkThreadRequest { target } => {
            let event =
                FabricEvent::LinkRequest { source_role: inner.role, source_index: index, target };
            if inner.events_tx.send(event).await.is_err() {
                warn!(target: "opnet::fabric", role = %inner.role, index, "link request dropped: no manager attached");
            }
        }
        message => {
            let envelope = MessageEnvelope { task_id, to_server, message };
            if inner.events_tx.send(FabricEvent::Envelope { source_index: index, envelope }).await.is_err()
            {
                debug!(target: "opnet::fabric", role = %inner.role, index, "worker envelope dropped: no manager attached");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Worker, WorkerChannel};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Test worker: answers `CurrentIndexerBlock` with height + 1, never
    /// answers `StartIndexer`, panics on `DeserializeBlock`.
    struct EchoWorker;

    #[async_trait]
    impl Worker for EchoWorker {
        async fn run(self: Box<Self>, channel: WorkerChannel) {
            let Some(mut conn) = channel.attach().await else { return };
            while let Some(envelope) = conn.next().await {
                match envelope.message {
                    ThreadMessage::CurrentIndexerBlock { height } => {
                        if let Some(task_id) = envelope.task_id {
                            let _ = conn.respond(task_id, ThreadData::Height(height + 1)).await;
                        }
                    }
                    ThreadMessage::StartIndexer => { /* deliberately no response */ }
                    ThreadMessage::DeserializeBlock { .. } => panic!("worker crash requested"),
                    ThreadMessage::ExitThread => break,
                    _ => {}
                }
            }
        }
    }

    fn echo_fabric(options: FabricOptions) -> WorkerFabric {
        WorkerFabric::new(
            WorkerRole::Indexer,
            |_index: usize| Box::new(EchoWorker) as Box<dyn Worker>,
            options,
        )
    }

    #[tokio::test]
    async fn execute_round_trip() -> eyre::Result<()> {
        let fabric = echo_fabric(FabricOptions::default());
        fabric.spawn(2).await;

        for height in [0u64, 10, 99] {
            let data = fabric.execute(ThreadMessage::CurrentIndexerBlock { height }).await?;
            assert_eq!(data, ThreadData::Height(height + 1));
        }
        fabric.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn execute_times_out_within_bound() {
        let options =
            FabricOptions { response_timeout: Duration::from_millis(200), ..Default::default() };
        let fabric = echo_fabric(options);
        fabric.spawn(1).await;

        let started = std::time::Instant::now();
        let result = fabric.execute(ThreadMessage::StartIndexer).await;
        let elapsed = started.elapsed();

        assert_matches::assert_matches!(result, Err(FabricError::ResponseTimeout(_)));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2), "timeout took {elapsed:?}");
        fabric.shutdown().await;
    }

    #[tokio::test]
    async fn execute_without_workers_fails() {
        let fabric = echo_fabric(FabricOptions::default());
        let result = fabric.execute(ThreadMessage::GetPeers).await;
        assert_matches::assert_matches!(result, Err(FabricError::NoWorkers(WorkerRole::Indexer)));
    }

    #[tokio::test]
    async fn crashed_worker_is_restarted() -> eyre::Result<()> {
        let options =
            FabricOptions { restart_backoff: Duration::from_millis(50), ..Default::default() };
        let fabric = echo_fabric(options);
        fabric.spawn(1).await;

        // crash it
        let _ = fabric
            .execute_no_resp(ThreadMessage::DeserializeBlock { raw: bytes::Bytes::new() })
            .await?;

        // wait out the backoff, then the slot must serve requests again
        sleep(Duration::from_millis(400)).await;
        let data = fabric.execute(ThreadMessage::CurrentIndexerBlock { height: 5 }).await?;
        assert_eq!(data, ThreadData::Height(6));
        fabric.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_prevents_restart() {
        let options =
            FabricOptions { restart_backoff: Duration::from_millis(50), ..Default::default() };
        let fabric = echo_fabric(options);
        fabric.spawn(1).await;
        fabric.shutdown().await;

        assert!(fabric.worker_states().iter().all(|s| *s == WorkerState::Dead));
        let result = fabric.execute(ThreadMessage::GetPeers).await;
        assert_matches::assert_matches!(result, Err(FabricError::ShuttingDown(_)));
    }
}
