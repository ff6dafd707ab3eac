//! The orchestrator public surface.
//!
//! One [`Orchestrator`] instance owns its workflow registry, the priority
//! queue, the event bus, and the background scheduler task. External
//! callers (CLI/UI layers, out of scope here) register workflows, drive
//! lifecycle transitions, and subscribe to lifecycle events; the
//! reconciliation logic itself lives in [`scheduler`].
//!
//! Locking discipline: one mutex guards the registry (`core`). It is taken
//! for the shortest span that keeps a decision atomic and is never held
//! across I/O — every store/runner call happens between lock acquisitions.

pub(crate) mod registry;
pub mod scheduler;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use miette::Diagnostic;
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::event_bus::{ChannelSink, Event, EventBus, EventSink, WorkflowPhase};
use crate::graph::CircularDependencyError;
use crate::queue::{QueueError, QueueManager};
use crate::runner::{JobHandle, Runner};
use crate::store::{JobStore, StoreError};
use crate::types::{JobId, NodeId, RunnerKind, WorkflowId};
use crate::workflow::definition::WorkflowDefinition;
use crate::workflow::state::{NodeStatus, WorkflowState, WorkflowStatus};

use registry::Registry;
use registry::WorkflowRuntime;

pub use scheduler::PassReport;

/// Orchestrator-level errors surfaced synchronously to callers.
///
/// Node-level failures never appear here: they are captured inside the
/// scheduler loop and routed through failure policies, surfacing via the
/// event subscription instead.
#[derive(Debug, Error, Diagnostic)]
pub enum OrchestratorError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Circular(#[from] CircularDependencyError),

    #[error("workflow not found: {workflow_id}")]
    #[diagnostic(code(flowsmith::orchestrator::workflow_not_found))]
    WorkflowNotFound { workflow_id: WorkflowId },

    #[error("workflow {workflow_id} is already registered")]
    #[diagnostic(code(flowsmith::orchestrator::duplicate_workflow))]
    DuplicateWorkflow { workflow_id: WorkflowId },

    #[error("no runner registered for backend kind `{runner}`")]
    #[diagnostic(
        code(flowsmith::orchestrator::runner_unavailable),
        help("Register a runner for this backend kind before starting workflows that target it.")
    )]
    RunnerUnavailable { runner: RunnerKind },

    #[error("workflow {workflow_id} is {status}; cannot {operation}")]
    #[diagnostic(code(flowsmith::orchestrator::invalid_transition))]
    InvalidTransition {
        workflow_id: WorkflowId,
        status: WorkflowStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

struct SchedulerTask {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub(crate) struct OrchestratorInner {
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) runners: Mutex<FxHashMap<RunnerKind, Arc<dyn Runner>>>,
    pub(crate) queue: QueueManager,
    pub(crate) bus: EventBus,
    pub(crate) core: Mutex<Registry>,
    pub(crate) config: RuntimeConfig,
    scheduler: Mutex<Option<SchedulerTask>>,
}

/// DAG workflow orchestrator with a priority job queue.
///
/// Cheap to clone; clones share the same engine state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn JobStore>, config: RuntimeConfig) -> Self {
        let bus = config.event_bus.build_event_bus();
        bus.listen();
        let queue = QueueManager::new(store.clone(), config.queue.clone());
        Self {
            inner: Arc::new(OrchestratorInner {
                store,
                runners: Mutex::new(FxHashMap::default()),
                queue,
                bus,
                core: Mutex::new(Registry::default()),
                config,
                scheduler: Mutex::new(None),
            }),
        }
    }

    /// Register the execution backend for one [`RunnerKind`].
    pub fn add_runner(&self, kind: RunnerKind, runner: Arc<dyn Runner>) {
        self.inner.runners.lock().insert(kind, runner);
    }

    pub(crate) fn runner_for(
        &self,
        kind: RunnerKind,
    ) -> Result<Arc<dyn Runner>, OrchestratorError> {
        self.inner
            .runners
            .lock()
            .get(&kind)
            .cloned()
            .ok_or(OrchestratorError::RunnerUnavailable { runner: kind })
    }

    /// Direct access to the job queue for job-level operations
    /// (`set_priority`, `get_status`, `dequeue`, `cancel`).
    #[must_use]
    pub fn queue(&self) -> &QueueManager {
        &self.inner.queue
    }

    /// Validate and register a workflow definition.
    ///
    /// A cyclic edge set is rejected with no partial state retained.
    #[instrument(skip(self, definition), fields(workflow_id = %definition.workflow_id))]
    pub fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowId, OrchestratorError> {
        let workflow_id = definition.workflow_id.clone();
        // Materialization (and the acyclicity check) happens before the
        // registry is touched, so a rejected definition leaves nothing
        // behind.
        let runtime = WorkflowRuntime::materialize(definition)?;
        let mut core = self.inner.core.lock();
        if core.workflows.contains_key(&workflow_id) {
            return Err(OrchestratorError::DuplicateWorkflow { workflow_id });
        }
        info!(nodes = runtime.nodes.len(), "workflow registered");
        core.workflows.insert(workflow_id.clone(), runtime);
        Ok(workflow_id)
    }

    /// Begin executing a registered workflow: admit its initial frontier
    /// and submit whatever capacity allows.
    #[instrument(skip(self))]
    pub async fn start(&self, workflow_id: &WorkflowId) -> Result<(), OrchestratorError> {
        {
            let mut core = self.inner.core.lock();
            let runtime = core.runtime_mut(workflow_id).ok_or_else(|| {
                OrchestratorError::WorkflowNotFound {
                    workflow_id: workflow_id.clone(),
                }
            })?;
            if runtime.state.status != WorkflowStatus::Pending {
                return Err(OrchestratorError::InvalidTransition {
                    workflow_id: workflow_id.clone(),
                    status: runtime.state.status,
                    operation: "start",
                });
            }
            runtime.state.status = WorkflowStatus::Running;
            runtime.state.started_at = Some(chrono::Utc::now());
        }
        self.inner
            .bus
            .emit(Event::workflow(workflow_id.clone(), WorkflowPhase::Started));

        self.run_admissions().await?;
        self.run_submissions().await?;
        Ok(())
    }

    /// Block further admissions for this workflow; running nodes finish.
    ///
    /// Effective immediately for future admission — the queue checks the
    /// suspension flag synchronously inside `schedule`.
    #[instrument(skip(self))]
    pub fn pause(&self, workflow_id: &WorkflowId) -> Result<(), OrchestratorError> {
        let queued: Vec<JobId> = {
            let mut core = self.inner.core.lock();
            let runtime = core.runtime_mut(workflow_id).ok_or_else(|| {
                OrchestratorError::WorkflowNotFound {
                    workflow_id: workflow_id.clone(),
                }
            })?;
            if runtime.state.status != WorkflowStatus::Running {
                return Err(OrchestratorError::InvalidTransition {
                    workflow_id: workflow_id.clone(),
                    status: runtime.state.status,
                    operation: "pause",
                });
            }
            runtime.state.status = WorkflowStatus::Paused;
            queued_job_ids(runtime)
        };
        self.inner.queue.set_suspended(&queued, true);
        self.inner
            .bus
            .emit(Event::workflow(workflow_id.clone(), WorkflowPhase::Paused));
        Ok(())
    }

    /// Re-enable admissions for a paused workflow.
    #[instrument(skip(self))]
    pub async fn resume(&self, workflow_id: &WorkflowId) -> Result<(), OrchestratorError> {
        let queued: Vec<JobId> = {
            let mut core = self.inner.core.lock();
            let runtime = core.runtime_mut(workflow_id).ok_or_else(|| {
                OrchestratorError::WorkflowNotFound {
                    workflow_id: workflow_id.clone(),
                }
            })?;
            if runtime.state.status != WorkflowStatus::Paused {
                return Err(OrchestratorError::InvalidTransition {
                    workflow_id: workflow_id.clone(),
                    status: runtime.state.status,
                    operation: "resume",
                });
            }
            runtime.state.status = WorkflowStatus::Running;
            queued_job_ids(runtime)
        };
        self.inner.queue.set_suspended(&queued, false);
        self.inner
            .bus
            .emit(Event::workflow(workflow_id.clone(), WorkflowPhase::Resumed));
        self.run_admissions().await?;
        self.run_submissions().await?;
        Ok(())
    }

    /// Cancel a workflow: immediately force every non-terminal node
    /// terminal, then send best-effort cancels to the backends without
    /// waiting for acknowledgment.
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: &WorkflowId) -> Result<(), OrchestratorError> {
        let (events, cancel_jobs, cancel_handles) = {
            let mut core = self.inner.core.lock();
            let runtime = core.runtime_mut(workflow_id).ok_or_else(|| {
                OrchestratorError::WorkflowNotFound {
                    workflow_id: workflow_id.clone(),
                }
            })?;
            if runtime.state.status.is_terminal() {
                return Err(OrchestratorError::InvalidTransition {
                    workflow_id: workflow_id.clone(),
                    status: runtime.state.status,
                    operation: "cancel",
                });
            }
            runtime.state.status = WorkflowStatus::Cancelled;
            runtime.state.finished_at = Some(chrono::Utc::now());
            let mut outcome = registry::FailureOutcome::default();
            let skipped = runtime.skip_all_non_terminal(&mut outcome);
            let mut events: Vec<Event> = skipped
                .into_iter()
                .map(|node_id| {
                    let job_id = runtime
                        .nodes
                        .get(&node_id)
                        .and_then(|n| n.job_id.clone());
                    Event::node(
                        workflow_id.clone(),
                        node_id,
                        job_id,
                        crate::event_bus::NodePhase::Skipped,
                    )
                })
                .collect();
            events.push(Event::workflow(
                workflow_id.clone(),
                WorkflowPhase::Cancelled,
            ));
            (events, outcome.cancel_queue_jobs, outcome.cancel_handles)
        };

        for job_id in &cancel_jobs {
            if let Err(error) = self.inner.queue.cancel(job_id) {
                warn!(%job_id, %error, "queue cancel failed");
            }
        }
        for handle in cancel_handles {
            match self.runner_for(handle.runner) {
                Ok(runner) => {
                    if let Err(error) = runner.cancel(&handle).await {
                        warn!(job_id = %handle.job_id, %error, "backend cancel failed");
                    }
                }
                Err(error) => warn!(%error, "no runner for cancellation"),
            }
        }
        for event in events {
            self.inner.bus.emit(event);
        }
        Ok(())
    }

    /// Snapshot of a workflow's runtime state.
    pub fn get_status(&self, workflow_id: &WorkflowId) -> Result<WorkflowState, OrchestratorError> {
        let core = self.inner.core.lock();
        core.workflows
            .get(workflow_id)
            .map(|runtime| runtime.state.clone())
            .ok_or_else(|| OrchestratorError::WorkflowNotFound {
                workflow_id: workflow_id.clone(),
            })
    }

    /// Fraction of nodes completed, in `[0, 1]`.
    pub fn progress(&self, workflow_id: &WorkflowId) -> Result<f64, OrchestratorError> {
        Ok(self.get_status(workflow_id)?.progress())
    }

    /// Status of one node within a workflow, for observability.
    pub fn node_status(
        &self,
        workflow_id: &WorkflowId,
        node_id: &NodeId,
    ) -> Result<Option<NodeStatus>, OrchestratorError> {
        let core = self.inner.core.lock();
        let runtime = core.workflows.get(workflow_id).ok_or_else(|| {
            OrchestratorError::WorkflowNotFound {
                workflow_id: workflow_id.clone(),
            }
        })?;
        Ok(runtime.nodes.get(node_id).map(|node| node.status))
    }

    pub fn list_workflows(&self) -> Vec<(WorkflowId, WorkflowStatus)> {
        let core = self.inner.core.lock();
        core.workflows
            .values()
            .map(|runtime| (runtime.workflow_id().clone(), runtime.state.status))
            .collect()
    }

    /// Subscribe to lifecycle events. Each subscriber gets its own channel;
    /// dropping the receiver detaches the subscription.
    #[must_use]
    pub fn subscribe(&self) -> flume::Receiver<Event> {
        let (tx, rx) = flume::unbounded();
        self.inner.bus.add_sink(ChannelSink::new(tx));
        rx
    }

    /// Attach a custom event sink (metrics, persistence, UI push).
    pub fn add_sink<S: EventSink + 'static>(&self, sink: S) {
        self.inner.bus.add_sink(sink);
    }

    /// Re-register a definition after a process restart and reconcile node
    /// state from the store.
    ///
    /// `assignments` maps node ids to the job ids the previous process
    /// created for them; statuses come from one batch store read. Nodes
    /// with non-terminal jobs resume polling under a handle whose
    /// `backend_ref` is the job id — backends are expected to resolve
    /// recovered jobs by that id (and may report `Unknown` until they do).
    #[instrument(skip(self, definition, assignments), fields(workflow_id = %definition.workflow_id))]
    pub async fn recover(
        &self,
        definition: WorkflowDefinition,
        assignments: FxHashMap<NodeId, JobId>,
    ) -> Result<WorkflowId, OrchestratorError> {
        let workflow_id = definition.workflow_id.clone();
        let mut runtime = WorkflowRuntime::materialize(definition)?;

        let job_ids: Vec<JobId> = assignments.values().cloned().collect();
        let statuses = self.inner.store.get_job_statuses_batch(&job_ids).await?;

        // Pull results for completed jobs up front so downstream parameter
        // resolution has them. Per-record reads; only terminal jobs pay it.
        let mut results: FxHashMap<JobId, serde_json::Value> = FxHashMap::default();
        for (job_id, status) in &statuses {
            if *status == crate::types::JobStatus::Completed {
                if let Ok(record) = self.inner.store.get_job(job_id).await {
                    results.insert(
                        job_id.clone(),
                        record.results.unwrap_or(serde_json::Value::Null),
                    );
                }
            }
        }

        runtime.state.status = WorkflowStatus::Running;
        runtime.state.started_at = Some(chrono::Utc::now());
        let mut failed: Vec<NodeId> = Vec::new();
        for (node_id, job_id) in &assignments {
            let Some(node) = runtime.nodes.get_mut(node_id) else {
                continue;
            };
            node.job_id = Some(job_id.clone());
            match statuses.get(job_id) {
                Some(crate::types::JobStatus::Completed) => {
                    let value = results
                        .get(job_id)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    runtime.apply_completion(node_id, value);
                }
                Some(status) if status.is_terminal() => failed.push(node_id.clone()),
                Some(_) => {
                    node.job_handle = Some(JobHandle {
                        job_id: job_id.clone(),
                        backend_ref: job_id.clone(),
                        runner: node.runner,
                    });
                    node.status = NodeStatus::Running;
                    runtime.state.mark_running(node_id);
                }
                // Absent from the store: the previous process died between
                // assignment and creation. Leave the node pending; it is
                // re-admitted like a fresh node.
                None => {}
            }
        }
        for node_id in failed {
            runtime.apply_failure(&node_id, "failed before recovery".to_string());
        }

        let mut core = self.inner.core.lock();
        if core.workflows.contains_key(&workflow_id) {
            return Err(OrchestratorError::DuplicateWorkflow { workflow_id });
        }
        for (node_id, job_id) in assignments {
            core.job_index
                .insert(job_id, (workflow_id.clone(), node_id));
        }
        core.workflows.insert(workflow_id.clone(), runtime);
        drop(core);

        self.inner.bus.emit(Event::diagnostic(
            "recovery",
            format!("workflow {workflow_id} recovered"),
        ));
        Ok(workflow_id)
    }

    /// Spawn the background reconciliation loop on the configured interval.
    /// Idempotent; use [`shutdown`](Self::shutdown) to stop it.
    pub fn spawn_scheduler(&self) {
        let mut guard = self.inner.scheduler.lock();
        if guard.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let this = self.clone();
        let interval = self.inner.config.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        // A failed pass is fatal only to itself; the next
                        // tick retries from scratch.
                        if let Err(error) = this.tick().await {
                            warn!(%error, "reconciliation pass failed");
                        }
                    }
                }
            }
        });
        *guard = Some(SchedulerTask {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the background scheduler and drain the event bus.
    pub async fn shutdown(&self) {
        let task = self.inner.scheduler.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(());
            let _ = task.handle.await;
        }
        self.inner.bus.stop().await;
    }

    pub(crate) fn inner(&self) -> &OrchestratorInner {
        &self.inner
    }
}

fn queued_job_ids(runtime: &WorkflowRuntime) -> Vec<JobId> {
    runtime
        .nodes
        .values()
        .filter(|node| node.status == NodeStatus::Queued)
        .filter_map(|node| node.job_id.clone())
        .collect()
}
