//! The plugin worker pool.
//!
//! A fixed set of workers, each hosting any number of plugins behind the
//! [PluginRuntime] capability. Requests are correlated by request id; a
//! timeout resolves the caller's future without cancelling the worker-side
//! computation. When a worker dies, every outstanding request bound to it
//! fails, its plugins are reported crashed, and a fresh empty worker takes
//! the slot.

use crate::hooks::HookKind;
use async_trait::async_trait;
use bytes::Bytes;
use opnet_types::{NetworkInfo, TaskId};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Capability that actually runs plugin bytecode. The WASM contract engine
/// implements this outside the workspace; tests install mocks.
#[async_trait]
pub trait PluginRuntime: Send + Sync + 'static {
    async fn load(
        &self,
        plugin_id: &str,
        bytecode: Bytes,
        config: serde_json::Value,
        network: NetworkInfo,
        sync: SyncStateSender,
    ) -> Result<(), String>;

    async fn unload(&self, plugin_id: &str);

    /// Run a hook. `Ok(None)` means the hook ran without a return value.
    async fn invoke_hook(
        &self,
        plugin_id: &str,
        hook: HookKind,
        payload: serde_json::Value,
    ) -> Result<Option<serde_json::Value>, String>;

    async fn invoke_route(
        &self,
        plugin_id: &str,
        handler: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, String>;

    async fn invoke_ws(
        &self,
        plugin_id: &str,
        handler: &str,
        payload: serde_json::Value,
        client_id: &str,
    ) -> Result<serde_json::Value, String>;
}

/// Host callbacks for worker-originated events.
#[async_trait]
pub trait PoolObserver: Send + Sync + 'static {
    async fn on_plugin_crash(&self, plugin_id: &str, reason: &str);

    async fn on_sync_state_update(
        &self,
        plugin_id: &str,
        last_synced_block: u64,
        sync_completed: bool,
    );
}

/// Observer that ignores everything.
pub struct NoopObserver;

#[async_trait]
impl PoolObserver for NoopObserver {
    async fn on_plugin_crash(&self, _plugin_id: &str, _reason: &str) {}
    async fn on_sync_state_update(&self, _: &str, _: u64, _: bool) {}
}

/// Result of one hook invocation.
#[derive(Clone, Debug)]
pub struct HookOutcome {
    pub plugin_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl HookOutcome {
    fn failure(plugin_id: &str, started: Instant, error: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            success: false,
            duration_ms: started.elapsed().as_millis() as u64,
            result: None,
            error: Some(error.into()),
        }
    }
}

enum WorkerRequest {
    Load {
        request_id: TaskId,
        plugin_id: String,
        bytecode: Bytes,
        config: serde_json::Value,
        network: NetworkInfo,
    },
    Unload {
        request_id: TaskId,
        plugin_id: String,
    },
    Hook {
        request_id: TaskId,
        plugin_id: String,
        hook: HookKind,
        payload: serde_json::Value,
    },
    Route {
        request_id: TaskId,
        plugin_id: String,
        handler: String,
        payload: serde_json::Value,
    },
    Ws {
        request_id: TaskId,
        plugin_id: String,
        handler: String,
        payload: serde_json::Value,
        client_id: String,
    },
    Exit,
}

#[derive(Debug)]
enum WorkerReply {
    Done { request_id: TaskId, result: Result<Option<serde_json::Value>, String> },
    SyncStateUpdate { plugin_id: String, last_synced_block: u64, sync_completed: bool },
}

/// Handle a hosted plugin uses to report indexing progress to the host.
#[derive(Clone)]
pub struct SyncStateSender {
    tx: mpsc::Sender<WorkerReply>,
}

impl SyncStateSender {
    /// Post a `SyncStateUpdate` envelope upward.
    pub async fn update(&self, plugin_id: &str, last_synced_block: u64, sync_completed: bool) {
        let _ = self
            .tx
            .send(WorkerReply::SyncStateUpdate {
                plugin_id: plugin_id.to_string(),
                last_synced_block,
                sync_completed,
            })
            .await;
    }
}

struct WorkerSlot {
    sender: mpsc::Sender<WorkerRequest>,
    live: bool,
    generation: u64,
}

struct PendingRequest {
    worker_index: usize,
    reply: oneshot::Sender<Result<Option<serde_json::Value>, String>>,
}

struct PoolInner {
    runtime: Arc<dyn PluginRuntime>,
    observer: Arc<dyn PoolObserver>,
    workers: Mutex<Vec<WorkerSlot>>,
    /// plugin id -> hosting worker index.
    assignments: Mutex<HashMap<String, usize>>,
    pending: Mutex<HashMap<TaskId, PendingRequest>>,
    default_timeout: Duration,
    shutting_down: std::sync::atomic::AtomicBool,
}

/// Handle to the pool.
#[derive(Clone)]
pub struct PluginWorkerPool {
    inner: Arc<PoolInner>,
}

impl PluginWorkerPool {
    pub fn new(
        worker_count: usize,
        runtime: Arc<dyn PluginRuntime>,
        observer: Arc<dyn PoolObserver>,
        default_timeout: Duration,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            runtime,
            observer,
            workers: Mutex::new(Vec::new()),
            assignments: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            default_timeout,
            shutting_down: std::sync::atomic::AtomicBool::new(false),
        });
        let pool = Self { inner };
        for index in 0..worker_count.max(1) {
            spawn_pool_worker(&pool.inner, index, 0);
        }
        pool
    }

    /// Host a plugin on the least-loaded worker.
    pub async fn load_plugin(
        &self,
        plugin_id: &str,
        bytecode: Bytes,
        config: serde_json::Value,
        network: NetworkInfo,
    ) -> Result<usize, crate::error::PluginError> {
        let worker_index = self.least_loaded_worker()?;
        let request_id = TaskId::random();
        let reply = self.track(request_id, worker_index);
        self.send_to(
            worker_index,
            WorkerRequest::Load {
                request_id,
                plugin_id: plugin_id.to_string(),
                bytecode,
                config,
                network,
            },
        )
        .await?;

        match self.await_reply(request_id, reply, None).await {
            Ok(_) => {
                self.inner.assignments.lock().insert(plugin_id.to_string(), worker_index);
                info!(target: "opnet::plugin", plugin = %plugin_id, worker = worker_index, "plugin loaded");
                Ok(worker_index)
            }
            Err(reason) => Err(crate::error::PluginError::LoadFailed {
                id: plugin_id.to_string(),
                reason,
            }),
        }
    }

    /// Idempotent unload; a plugin that is not hosted is a no-op.
    pub async fn unload_plugin(&self, plugin_id: &str) -> Result<(), crate::error::PluginError> {
        let Some(worker_index) = self.inner.assignments.lock().remove(plugin_id) else {
            return Ok(());
        };
        let request_id = TaskId::random();
        let reply = self.track(request_id, worker_index);
        self.send_to(
            worker_index,
            WorkerRequest::Unload { request_id, plugin_id: plugin_id.to_string() },
        )
        .await?;
        let _ = self.await_reply(request_id, reply, None).await;
        Ok(())
    }

    /// Whether a plugin is currently hosted by a worker.
    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.inner.assignments.lock().contains_key(plugin_id)
    }

    /// The worker hosting a plugin.
    pub fn worker_of(&self, plugin_id: &str) -> Option<usize> {
        self.inner.assignments.lock().get(plugin_id).copied()
    }

    /// Run a hook, discarding any return value.
    pub async fn execute_hook(
        &self,
        plugin_id: &str,
        hook: HookKind,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> HookOutcome {
        let mut outcome = self.execute_hook_with_result(plugin_id, hook, payload, timeout).await;
        outcome.result = None;
        outcome
    }

    /// Run a hook and return its result.
    ///
    /// Never returns an error: failures, including `PluginNotLoaded` and
    /// timeouts, are encoded in the outcome.
    pub async fn execute_hook_with_result(
        &self,
        plugin_id: &str,
        hook: HookKind,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> HookOutcome {
        let started = Instant::now();
        let Some(worker_index) = self.worker_of(plugin_id) else {
            return HookOutcome::failure(plugin_id, started, format!("plugin {plugin_id} is not loaded"));
        };

        let request_id = TaskId::random();
        let reply = self.track(request_id, worker_index);
        let request = WorkerRequest::Hook {
            request_id,
            plugin_id: plugin_id.to_string(),
            hook,
            payload,
        };
        if let Err(e) = self.send_to(worker_index, request).await {
            return HookOutcome::failure(plugin_id, started, e.to_string());
        }

        match self.await_reply(request_id, reply, timeout).await {
            Ok(result) => HookOutcome {
                plugin_id: plugin_id.to_string(),
                success: true,
                duration_ms: started.elapsed().as_millis() as u64,
                result,
                error: None,
            },
            Err(reason) => HookOutcome::failure(plugin_id, started, reason),
        }
    }

    /// Run an API route handler inside the plugin.
    pub async fn execute_route_handler(
        &self,
        plugin_id: &str,
        handler: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, crate::error::PluginError> {
        let worker_index = self
            .worker_of(plugin_id)
            .ok_or_else(|| crate::error::PluginError::PluginNotLoaded(plugin_id.to_string()))?;
        let request_id = TaskId::random();
        let reply = self.track(request_id, worker_index);
        self.send_to(
            worker_index,
            WorkerRequest::Route {
                request_id,
                plugin_id: plugin_id.to_string(),
                handler: handler.to_string(),
                payload,
            },
        )
        .await?;
        self.await_reply(request_id, reply, None)
            .await
            .map(|v| v.unwrap_or(serde_json::Value::Null))
            .map_err(|reason| crate::error::PluginError::LoadFailed {
                id: plugin_id.to_string(),
                reason,
            })
    }

    /// Run a websocket handler inside the plugin.
    pub async fn execute_ws_handler(
        &self,
        plugin_id: &str,
        handler: &str,
        payload: serde_json::Value,
        request_id: TaskId,
        client_id: &str,
    ) -> Result<serde_json::Value, crate::error::PluginError> {
        let worker_index = self
            .worker_of(plugin_id)
            .ok_or_else(|| crate::error::PluginError::PluginNotLoaded(plugin_id.to_string()))?;
        let reply = self.track(request_id, worker_index);
        self.send_to(
            worker_index,
            WorkerRequest::Ws {
                request_id,
                plugin_id: plugin_id.to_string(),
                handler: handler.to_string(),
                payload,
                client_id: client_id.to_string(),
            },
        )
        .await?;
        self.await_reply(request_id, reply, None)
            .await
            .map(|v| v.unwrap_or(serde_json::Value::Null))
            .map_err(|reason| crate::error::PluginError::LoadFailed {
                id: plugin_id.to_string(),
                reason,
            })
    }

    /// Plugins hosted on a worker, for placement decisions.
    pub fn plugins_on(&self, worker_index: usize) -> usize {
        self.inner.assignments.lock().values().filter(|w| **w == worker_index).count()
    }

    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, std::sync::atomic::Ordering::Release);
        let senders: Vec<_> =
            self.inner.workers.lock().iter().map(|w| w.sender.clone()).collect();
        for sender in senders {
            let _ = sender.send(WorkerRequest::Exit).await;
        }
    }

    fn track(
        &self,
        request_id: TaskId,
        worker_index: usize,
    ) -> oneshot::Receiver<Result<Option<serde_json::Value>, String>> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, PendingRequest { worker_index, reply: tx });
        rx
    }

    async fn await_reply(
        &self,
        request_id: TaskId,
        reply: oneshot::Receiver<Result<Option<serde_json::Value>, String>>,
        timeout: Option<Duration>,
    ) -> Result<Option<serde_json::Value>, String> {
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err("worker crashed".to_string()),
            Err(_) => {
                // resolve locally; the worker side keeps running
                self.inner.pending.lock().remove(&request_id);
                Err(format!("hook timed out after {}ms", timeout.as_millis()))
            }
        }
    }

    async fn send_to(
        &self,
        worker_index: usize,
        request: WorkerRequest,
    ) -> Result<(), crate::error::PluginError> {
        let sender = {
            let workers = self.inner.workers.lock();
            let slot = workers
                .get(worker_index)
                .filter(|w| w.live)
                .ok_or(crate::error::PluginError::WorkerUnavailable(worker_index))?;
            slot.sender.clone()
        };
        sender.send(request).await.map_err(|_| crate::error::PluginError::ChannelClosed)
    }

    fn least_loaded_worker(&self) -> Result<usize, crate::error::PluginError> {
        let workers = self.inner.workers.lock();
        let assignments = self.inner.assignments.lock();
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for worker in assignments.values() {
            *counts.entry(*worker).or_default() += 1;
        }
        workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.live)
            .min_by_key(|(index, _)| counts.get(index).copied().unwrap_or(0))
            .map(|(index, _)| index)
            .ok_or(crate::error::PluginError::WorkerUnavailable(0))
    }
}

fn set_pool_slot(inner: &PoolInner, index: usize, slot: WorkerSlot) {
    let mut workers = inner.workers.lock();
    if index < workers.len() {
        workers[index] = slot;
    } else {
        debug_assert_eq!(index, workers.len());
        workers.push(slot);
    }
}

/// Spawn (or respawn) the pool worker at `index`.
fn spawn_pool_worker(inner: &Arc<PoolInner>, index: usize, generation: u64) {
    let (tx, mut rx) = mpsc::channel::<WorkerRequest>(256);
    let (reply_tx, mut reply_rx) = mpsc::channel::<WorkerReply>(256);
    set_pool_slot(inner, index, WorkerSlot { sender: tx, live: true, generation });

    // worker task: requests are processed one at a time, FIFO
    let runtime = inner.runtime.clone();
    let worker = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match request {
                WorkerRequest::Load { request_id, plugin_id, bytecode, config, network } => {
                    let sync = SyncStateSender { tx: reply_tx.clone() };
                    let result = runtime
                        .load(&plugin_id, bytecode, config, network, sync)
                        .await
                        .map(|_| None);
                    if reply_tx.send(WorkerReply::Done { request_id, result }).await.is_err() {
                        break;
                    }
                }
                WorkerRequest::Unload { request_id, plugin_id } => {
                    runtime.unload(&plugin_id).await;
                    let result = Ok(None);
                    if reply_tx.send(WorkerReply::Done { request_id, result }).await.is_err() {
                        break;
                    }
                }
                WorkerRequest::Hook { request_id, plugin_id, hook, payload } => {
                    let result = runtime.invoke_hook(&plugin_id, hook, payload).await;
                    if reply_tx.send(WorkerReply::Done { request_id, result }).await.is_err() {
                        break;
                    }
                }
                WorkerRequest::Route { request_id, plugin_id, handler, payload } => {
                    let result =
                        runtime.invoke_route(&plugin_id, &handler, payload).await.map(Some);
                    if reply_tx.send(WorkerReply::Done { request_id, result }).await.is_err() {
                        break;
                    }
                }
                WorkerRequest::Ws { request_id, plugin_id, handler, payload, client_id } => {
                    let result = runtime
                        .invoke_ws(&plugin_id, &handler, payload, &client_id)
                        .await
                        .map(Some);
                    if reply_tx.send(WorkerReply::Done { request_id, result }).await.is_err() {
                        break;
                    }
                }
                WorkerRequest::Exit => break,
            }
        }
    });

    // reply router
    let router_inner = inner.clone();
    tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            match reply {
                WorkerReply::Done { request_id, result } => {
                    let pending = router_inner.pending.lock().remove(&request_id);
                    match pending {
                        Some(p) => drop(p.reply.send(result)),
                        None => {
                            debug!(target: "opnet::plugin", %request_id, "reply for expired request dropped");
                        }
                    }
                }
                WorkerReply::SyncStateUpdate { plugin_id, last_synced_block, sync_completed } => {
                    router_inner
                        .observer
                        .on_sync_state_update(&plugin_id, last_synced_block, sync_completed)
                        .await;
                }
            }
        }
    });

    // monitor: crash propagation and slot healing
    let monitor_inner = inner.clone();
    tokio::spawn(async move {
        let result = worker.await;
        let shutting_down =
            monitor_inner.shutting_down.load(std::sync::atomic::Ordering::Acquire);

        {
            let mut workers = monitor_inner.workers.lock();
            if let Some(slot) = workers.get_mut(index) {
                if slot.generation == generation {
                    slot.live = false;
                }
            }
        }
        if shutting_down {
            return;
        }
        let reason = match result {
            Ok(()) => "worker exited".to_string(),
            Err(e) => format!("worker crashed: {e}"),
        };
        error!(target: "opnet::plugin", worker = index, %reason, "plugin worker died");

        // fail everything outstanding on this worker
        let failed: Vec<PendingRequest> = {
            let mut pending = monitor_inner.pending.lock();
            let ids: Vec<TaskId> = pending
                .iter()
                .filter(|(_, p)| p.worker_index == index)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for request in failed {
            let _ = request.reply.send(Err("worker crashed".to_string()));
        }

        // every hosted plugin crashes with the worker
        let crashed: Vec<String> = {
            let mut assignments = monitor_inner.assignments.lock();
            let ids: Vec<String> = assignments
                .iter()
                .filter(|(_, w)| **w == index)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                assignments.remove(id);
            }
            ids
        };
        for plugin_id in &crashed {
            monitor_inner.observer.on_plugin_crash(plugin_id, &reason).await;
        }

        // heal the slot with an empty worker after a short backoff
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !monitor_inner.shutting_down.load(std::sync::atomic::Ordering::Acquire) {
            warn!(target: "opnet::plugin", worker = index, "respawning plugin worker");
            spawn_pool_worker(&monitor_inner, index, generation + 1);
        }
    });
}
