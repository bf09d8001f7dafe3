//! `ReconcileScheduler`: the bounded worker pool that turns queued
//! [`ReconcileRequest`]s into Reconcile Engine runs.
//!
//! A single control loop owns `running`/`pending`/the timer wheel and spawns one worker
//! per dispatched request, driven by `tokio::select!` over an inbound request channel, a
//! worker completion channel, and [`crate::timer::TimerWheel`].

use crate::controller::{Controller, ReconcileResult};
use crate::dispatcher::ReconcileRequest;
use crate::engine::ReconcileEngine;
use crate::leader_election::LeaderElection;
use crate::timer::TimerWheel;
use oper8_core::config::Config;
use oper8_core::managed_object::ManagedObject;
use oper8_core::resource_id::ResourceId;
use oper8_core::status::Condition;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// Identifies a single resource's reconcile stream; `running`/`pending` are keyed by it.
/// Falls back to the resource's fully-qualified name for the rare object
/// that carries no uid (e.g. a manifest synthesized for a test).
type StreamKey = String;

fn stream_key(resource: &ManagedObject) -> StreamKey {
    resource.uid().map(str::to_string).unwrap_or_else(|| resource.identity_key())
}

fn resource_id_of(resource: &ManagedObject) -> ResourceId {
    let mut id = ResourceId::new(resource.api_version(), resource.kind());
    if let Some(ns) = resource.namespace() {
        id = id.within(ns);
    }
    if let Some(name) = resource.name() {
        id = id.named(name);
    }
    id
}

struct WorkerDone {
    key: StreamKey,
    resource_id: ResourceId,
    result: ReconcileResult,
    conditions: Vec<Condition>,
}

/// Queues [`ReconcileRequest`]s from the Dispatcher, runs a worker per in-flight
/// reconcile, and dedups/requeues them through a single control loop.
pub struct ReconcileScheduler {
    requests: mpsc::UnboundedSender<ReconcileRequest>,
    shutdown: Arc<Notify>,
    control_loop: Option<tokio::task::JoinHandle<()>>,
    worker_join_timeout: Duration,
}

impl ReconcileScheduler {
    #[must_use]
    pub fn new(
        engine: Arc<ReconcileEngine>,
        controllers: HashMap<String, Arc<dyn Controller>>,
        leader_election: Arc<dyn LeaderElection>,
        config: Arc<Config>,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(Notify::new());
        let worker_join_timeout = config.scheduler.worker_join_timeout;

        let control_loop = tokio::spawn(control_loop(
            engine,
            controllers,
            leader_election,
            config,
            request_rx,
            Arc::clone(&shutdown),
        ));

        Self { requests: request_tx, shutdown, control_loop: Some(control_loop), worker_join_timeout }
    }

    /// Enqueue a request from the Dispatcher. Dropped silently once the scheduler has
    /// already shut down.
    pub fn submit(&self, request: ReconcileRequest) {
        let _ = self.requests.send(request);
    }

    /// Cooperative shutdown: stop accepting new work and wait for the control
    /// loop, and transitively its running workers, to drain, up to the configured
    /// per-worker join timeout. Workers that exceed it are abandoned rather than
    /// blocking shutdown indefinitely.
    pub async fn shutdown(&mut self) {
        self.shutdown.notify_waiters();
        if let Some(handle) = self.control_loop.take() {
            if tokio::time::timeout(self.worker_join_timeout, handle).await.is_err() {
                warn!("scheduler control loop exceeded its join timeout during shutdown");
            }
        }
    }
}

struct ControlState {
    running: HashMap<StreamKey, ()>,
    pending: HashMap<StreamKey, ReconcileRequest>,
    conditions: HashMap<StreamKey, Vec<Condition>>,
    timer: TimerWheel<StreamKey>,
    latest_request: HashMap<StreamKey, ReconcileRequest>,
}

impl ControlState {
    fn new() -> Self {
        Self {
            running: HashMap::new(),
            pending: HashMap::new(),
            conditions: HashMap::new(),
            timer: TimerWheel::new(),
            latest_request: HashMap::new(),
        }
    }
}

async fn control_loop(
    engine: Arc<ReconcileEngine>,
    controllers: HashMap<String, Arc<dyn Controller>>,
    leader_election: Arc<dyn LeaderElection>,
    config: Arc<Config>,
    mut requests: mpsc::UnboundedReceiver<ReconcileRequest>,
    shutdown: Arc<Notify>,
) {
    let semaphore = Arc::new(Semaphore::new(config.scheduler.max_concurrent_reconciles));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<WorkerDone>();
    let mut state = ControlState::new();
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut shutting_down = false;

    loop {
        tokio::select! {
            () = shutdown.notified(), if !shutting_down => {
                info!("scheduler shutting down: no longer accepting new requests");
                shutting_down = true;
            }
            maybe_request = requests.recv(), if !shutting_down => {
                match maybe_request {
                    Some(request) => {
                        try_dispatch(request, &engine, &controllers, &leader_election, &semaphore, &done_tx, &mut state, &mut workers).await;
                    }
                    None => shutting_down = true,
                }
            }
            key = state.timer.next(), if !state.timer.is_empty() => {
                if let Some(key) = key {
                    if let Some(request) = state.latest_request.get(&key).cloned() {
                        try_dispatch(request, &engine, &controllers, &leader_election, &semaphore, &done_tx, &mut state, &mut workers).await;
                    }
                }
            }
            Some(done) = done_rx.recv() => {
                on_worker_done(done, &config, &leader_election, &mut state).await;
                if let Some(request) = state.pending.remove(&redrive_candidate(&state)) {
                    try_dispatch(request, &engine, &controllers, &leader_election, &semaphore, &done_tx, &mut state, &mut workers).await;
                }
            }
            else => break,
        }

        if shutting_down && state.running.is_empty() && state.pending.is_empty() {
            break;
        }
    }

    while workers.join_next().await.is_some() {}
}

/// A pending key that isn't currently running, for the worker-finished re-drive step:
/// once a stream frees up, its queued pending request gets dispatched immediately.
/// Returns an empty key (matching nothing) when there is none.
fn redrive_candidate(state: &ControlState) -> StreamKey {
    state.pending.keys().find(|k| !state.running.contains_key(*k)).cloned().unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
async fn try_dispatch(
    request: ReconcileRequest,
    engine: &Arc<ReconcileEngine>,
    controllers: &HashMap<String, Arc<dyn Controller>>,
    leader_election: &Arc<dyn LeaderElection>,
    semaphore: &Arc<Semaphore>,
    done_tx: &mpsc::UnboundedSender<WorkerDone>,
    state: &mut ControlState,
    workers: &mut JoinSet<()>,
) {
    let key = stream_key(&request.resource);
    state.latest_request.insert(key.clone(), request.clone());

    if state.running.contains_key(&key) {
        supersede_if_newer(&mut state.pending, key, request);
        return;
    }

    let resource_id = resource_id_of(&request.resource);
    if !leader_election.acquire_resource(&resource_id).await {
        debug!(resource = %resource_id, "per-resource leadership denied, deferring to pending");
        supersede_if_newer(&mut state.pending, key, request);
        return;
    }

    let Ok(permit) = Arc::clone(semaphore).try_acquire_owned() else {
        leader_election.release_resource(&resource_id).await;
        supersede_if_newer(&mut state.pending, key, request);
        return;
    };

    let Some(controller) = controllers.get(&request.controller_global_id).cloned() else {
        warn!(controller = %request.controller_global_id, "no controller registered for this reconcile request");
        leader_election.release_resource(&resource_id).await;
        return;
    };

    state.running.insert(key.clone(), ());
    let previous_conditions = state.conditions.get(&key).cloned().unwrap_or_default();
    let engine = Arc::clone(engine);
    let done_tx = done_tx.clone();

    workers.spawn(async move {
        let _permit = permit;
        let result = run_worker(engine.as_ref(), controller.as_ref(), &request, &previous_conditions).await;
        let _ = done_tx.send(WorkerDone { key, resource_id, result, conditions: previous_conditions });
    });
}

/// Deadline-based finalize detection: the engine itself reads `deletionTimestamp` off the
/// owner manifest's metadata, so the scheduler only needs to forward it unmodified.
#[instrument(skip_all, fields(controller = %request.controller_global_id, reason = ?request.reason))]
async fn run_worker(
    engine: &ReconcileEngine,
    controller: &dyn Controller,
    request: &ReconcileRequest,
    previous_conditions: &[Condition],
) -> ReconcileResult {
    let finalizing = request.resource.definition().pointer("/metadata/deletionTimestamp").is_some();
    engine.reconcile(controller, request.resource.definition().clone(), finalizing, &[], previous_conditions).await
}

fn supersede_if_newer(pending: &mut HashMap<StreamKey, ReconcileRequest>, key: StreamKey, request: ReconcileRequest) {
    match pending.get(&key) {
        Some(existing) if existing.timestamp >= request.timestamp => {}
        _ => {
            pending.insert(key, request);
        }
    }
}

async fn on_worker_done(done: WorkerDone, config: &Arc<Config>, leader_election: &Arc<dyn LeaderElection>, state: &mut ControlState) {
    state.running.remove(&done.key);
    state.conditions.insert(done.key.clone(), done.conditions);
    state.timer.cancel(&done.key);
    leader_election.release_resource(&done.resource_id).await;

    if let Some(after) = done.result.requeue_after {
        state.timer.schedule(done.key, after);
    } else if let Some(resync) = config.scheduler.periodic_resync {
        state.timer.schedule(done.key, resync);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentContext, ComponentError, RenderedComponent, ResourceNode, VerifyOutcome};
    use crate::controller::ControllerError;
    use crate::dispatcher::ReconcileReason;
    use crate::leader_election::DisabledLeaderElection;
    use crate::session::Session;
    use async_trait::async_trait;
    use oper8_client::{ClusterAdapter, DryRunClusterAdapter};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    struct NoopComponent;

    #[async_trait]
    impl Component for NoopComponent {
        fn name(&self) -> &str {
            "noop"
        }
        async fn render(&self, ctx: &ComponentContext<'_>) -> Result<RenderedComponent, ComponentError> {
            let owner_name = ctx.owner.pointer("/metadata/name").and_then(serde_json::Value::as_str).unwrap_or("owner");
            let manifest = json!({
                "apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {"name": format!("{owner_name}-cm"), "namespace": ctx.namespace},
            });
            Ok(RenderedComponent { nodes: vec![ResourceNode::new("cm", manifest)] })
        }
        async fn verify(&self, _ctx: &ComponentContext<'_>, _rendered: &RenderedComponent) -> Result<VerifyOutcome, ComponentError> {
            Ok(VerifyOutcome::Verified)
        }
    }

    struct CountingController {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Controller for CountingController {
        fn group(&self) -> &str {
            "example.com"
        }
        fn version(&self) -> &str {
            "v1"
        }
        fn kind(&self) -> &str {
            "Widget"
        }
        async fn setup_components(&self, session: &mut Session) -> Result<(), ControllerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            session.graph.add(Arc::new(NoopComponent)).map_err(|e| ControllerError::Setup(e.to_string()))
        }
    }

    fn reconcile_request(name: &str, uid: &str, timestamp: chrono::DateTime<chrono::Utc>) -> ReconcileRequest {
        let manifest = json!({
            "apiVersion": "example.com/v1", "kind": "Widget",
            "metadata": {"name": name, "namespace": "default", "uid": uid},
        });
        ReconcileRequest {
            controller_global_id: "Widget.v1.example.com".to_string(),
            reason: ReconcileReason::Event(oper8_client::WatchEventType::Added),
            resource: ManagedObject::from_manifest(manifest).unwrap(),
            timestamp,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_submitted_request_runs_the_controller() {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let engine = Arc::new(ReconcileEngine::new(Arc::clone(&adapter), Arc::new(Config::default())));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut controllers: HashMap<String, Arc<dyn Controller>> = HashMap::new();
        controllers.insert("Widget.v1.example.com".to_string(), Arc::new(CountingController { calls: Arc::clone(&calls) }));

        let mut scheduler = ReconcileScheduler::new(engine, controllers, Arc::new(DisabledLeaderElection), Arc::new(Config::default()));
        scheduler.submit(reconcile_request("demo", "u1", chrono::Utc::now()));

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        scheduler.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_request_for_a_running_uid_supersedes_the_pending_one() {
        let adapter: Arc<dyn ClusterAdapter> = Arc::new(DryRunClusterAdapter::new());
        let engine = Arc::new(ReconcileEngine::new(Arc::clone(&adapter), Arc::new(Config::default())));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut controllers: HashMap<String, Arc<dyn Controller>> = HashMap::new();
        controllers.insert("Widget.v1.example.com".to_string(), Arc::new(CountingController { calls: Arc::clone(&calls) }));

        let mut scheduler = ReconcileScheduler::new(engine, controllers, Arc::new(DisabledLeaderElection), Arc::new(Config::default()));
        let now = chrono::Utc::now();
        scheduler.submit(reconcile_request("demo", "u1", now));
        scheduler.submit(reconcile_request("demo", "u1", now + chrono::Duration::seconds(1)));

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        scheduler.shutdown().await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
