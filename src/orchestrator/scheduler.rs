//! The reconciliation loop: poll, advance, admit, submit.
//!
//! One [`Orchestrator::tick`] call is a full reconciliation pass:
//!
//! 1. snapshot the in-flight job set and poll each backend handle;
//! 2. push fresh observations into the store, then batch-read the store so
//!    externally recorded completions are honored too;
//! 3. apply every newly terminal job to its owning node via the reverse
//!    index, routing failures through failure policies;
//! 4. promote and admit newly ready nodes (resolve parameters, create
//!    store jobs, enqueue);
//! 5. run one queue admission pass and submit admitted jobs to their
//!    backends;
//! 6. finalize workflows whose nodes are all terminal, emitting each
//!    terminal transition exactly once.
//!
//! The pass is idempotent with respect to repeated terminal observations:
//! a job whose node already advanced (or whose node now belongs to a newer
//! retry attempt) is ignored. Store errors abort the pass, which the
//! background loop retries on the next tick; per-job runner errors only
//! affect that job's observation.

use rustc_hash::FxHashSet;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::event_bus::{Event, NodePhase};
use crate::orchestrator::registry::FailureOutcome;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::runner::{JobHandle, WorkSpec};
use crate::store::JobSpec;
use crate::types::{JobId, JobStatus, NodeId, Priority, RunnerKind, WorkflowId};
use crate::workflow::state::{NodeStatus, WorkflowStatus};

/// Summary of one reconciliation pass.
#[derive(Clone, Debug, Default)]
pub struct PassReport {
    /// In-flight jobs whose backends were polled.
    pub polled: usize,
    /// Jobs that reached `Completed` this pass.
    pub completed: Vec<JobId>,
    /// Jobs that reached `Failed`/`Cancelled` this pass.
    pub failed: Vec<JobId>,
    /// Jobs admitted and submitted this pass.
    pub submitted: Vec<JobId>,
    /// Workflows that reached a terminal status this pass.
    pub finalized: Vec<WorkflowId>,
}

/// A node cleared for admission: parameters resolved, ready to become a
/// store job and queue entry.
struct AdmissionPlan {
    workflow_id: WorkflowId,
    node_id: NodeId,
    spec: JobSpec,
    dependencies: FxHashSet<JobId>,
    priority: Priority,
    runner: RunnerKind,
    cluster: Option<String>,
}

/// A submission target snapshotted from the registry.
struct SubmissionPlan {
    workflow_id: WorkflowId,
    node_id: NodeId,
    work: WorkSpec,
    runner: RunnerKind,
}

impl Orchestrator {
    /// Run one reconciliation pass. Safe to call concurrently with the
    /// public API; the background loop calls this on its interval.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<PassReport, OrchestratorError> {
        let mut report = PassReport::default();

        // (1) Snapshot in-flight handles; lock dropped before any I/O.
        let inflight: Vec<(JobId, JobHandle)> = {
            let core = self.inner().core.lock();
            core.workflows
                .values()
                .filter(|rt| !rt.state.status.is_terminal())
                .flat_map(|rt| rt.nodes.values())
                .filter(|node| node.status == NodeStatus::Running)
                .filter_map(|node| {
                    Some((node.job_id.clone()?, node.job_handle.clone()?))
                })
                .collect()
        };
        report.polled = inflight.len();

        // (2) Poll backends and push observations into the store. A runner
        // error spoils only that job's observation for this pass.
        for (job_id, handle) in &inflight {
            let runner = match self.runner_for(handle.runner) {
                Ok(runner) => runner,
                Err(error) => {
                    warn!(%job_id, %error, "skipping observation");
                    continue;
                }
            };
            match runner.get_status(handle).await {
                Ok(JobStatus::Unknown) => {
                    // Legitimate non-terminal answer: retry next pass.
                    debug!(%job_id, "backend reports unknown; will retry");
                }
                Ok(status) => {
                    self.inner().store.update_status(job_id, status).await?;
                }
                Err(error) => {
                    warn!(%job_id, %error, "status poll failed");
                }
            }
        }

        // Single batched store read covers both our own observations and
        // anything recorded externally (e.g. before a restart).
        let inflight_ids: Vec<JobId> = inflight.iter().map(|(id, _)| id.clone()).collect();
        let statuses = if inflight_ids.is_empty() {
            Default::default()
        } else {
            self.inner()
                .store
                .get_job_statuses_batch(&inflight_ids)
                .await?
        };

        // (3) Apply newly terminal jobs.
        for (job_id, status) in statuses {
            if !status.is_terminal() {
                continue;
            }
            self.apply_terminal(&job_id, status, &mut report).await?;
        }

        // (4) + (5) Admissions and submissions.
        self.run_admissions().await?;
        let submitted = self.run_submissions().await?;
        report.submitted = submitted;

        // (6) Terminal workflow detection, exactly once per workflow.
        let terminal_events: Vec<Event> = {
            let mut core = self.inner().core.lock();
            let mut events = Vec::new();
            for runtime in core.workflows.values_mut() {
                if let Some(event) = runtime.maybe_finalize() {
                    if let Some(workflow_id) = event.workflow_id() {
                        report.finalized.push(workflow_id.to_string());
                    }
                    events.push(event);
                }
            }
            events
        };
        for event in terminal_events {
            self.inner().bus.emit(event);
        }

        self.inner().queue.cleanup_terminal();
        Ok(report)
    }

    /// Apply one observed terminal job status to its owning node.
    ///
    /// Idempotent: observations for jobs whose node already advanced (or
    /// that belong to a superseded retry attempt) are ignored.
    async fn apply_terminal(
        &self,
        job_id: &JobId,
        status: JobStatus,
        report: &mut PassReport,
    ) -> Result<(), OrchestratorError> {
        // Resolve ownership and check the idempotence guards under the lock.
        let target: Option<(WorkflowId, NodeId, Option<JobHandle>)> = {
            let core = self.inner().core.lock();
            core.job_index.get(job_id).and_then(|(wf, node_id)| {
                let runtime = core.workflows.get(wf)?;
                let node = runtime.nodes.get(node_id)?;
                let current_attempt = node.job_id.as_deref() == Some(job_id.as_str());
                let advancing = matches!(node.status, NodeStatus::Queued | NodeStatus::Running);
                if current_attempt && advancing {
                    Some((wf.clone(), node_id.clone(), node.job_handle.clone()))
                } else {
                    None
                }
            })
        };
        let Some((workflow_id, node_id, handle)) = target else {
            return Ok(());
        };

        // Completed jobs get their results pulled before the state change;
        // the lock stays released across the retrieval round trip.
        let results: Option<Value> = if status == JobStatus::Completed {
            let metrics = match (&handle, self.runner_for_handle(&handle)) {
                (Some(h), Some(runner)) => match runner.retrieve_results(h, None).await {
                    Ok(retrieved) if retrieved.success => retrieved.final_metrics,
                    Ok(retrieved) => {
                        warn!(%job_id, errors = ?retrieved.errors, "result retrieval unsuccessful");
                        Value::Object(serde_json::Map::new())
                    }
                    Err(error) => {
                        // The job itself succeeded; a failed metrics fetch
                        // does not fail the node.
                        warn!(%job_id, %error, "result retrieval failed");
                        Value::Object(serde_json::Map::new())
                    }
                },
                _ => Value::Object(serde_json::Map::new()),
            };
            self.inner()
                .store
                .update_results(job_id, metrics.clone())
                .await?;
            Some(metrics)
        } else {
            None
        };

        // Re-acquire and apply, re-verifying the guards after the I/O gap.
        let (events, outcome) = {
            let mut core = self.inner().core.lock();
            let Some(runtime) = core.workflows.get_mut(&workflow_id) else {
                return Ok(());
            };
            let still_current = runtime
                .nodes
                .get(&node_id)
                .is_some_and(|node| {
                    node.job_id.as_deref() == Some(job_id.as_str())
                        && matches!(node.status, NodeStatus::Queued | NodeStatus::Running)
                });
            if !still_current {
                return Ok(());
            }
            match status {
                JobStatus::Completed => {
                    report.completed.push(job_id.clone());
                    let events = runtime
                        .apply_completion(&node_id, results.unwrap_or(Value::Null));
                    (events, FailureOutcome::default())
                }
                JobStatus::Failed | JobStatus::Cancelled => {
                    report.failed.push(job_id.clone());
                    let reason = if status == JobStatus::Cancelled {
                        "job cancelled by backend".to_string()
                    } else {
                        "job failed on backend".to_string()
                    };
                    let outcome = runtime.apply_failure(&node_id, reason);
                    (Vec::new(), outcome)
                }
                _ => unreachable!("caller filters terminal statuses"),
            }
        };

        self.inner().queue.mark_terminal(job_id, status);
        self.execute_outcome(outcome).await;
        for event in events {
            self.inner().bus.emit(event);
        }
        Ok(())
    }

    /// Promote pending nodes whose dependencies completed, resolve their
    /// parameters, create store jobs, and enqueue them.
    pub(crate) async fn run_admissions(&self) -> Result<(), OrchestratorError> {
        // Plan under the lock: promotion, resolution (pure), and snapshot
        // of everything the I/O stage needs.
        let (plans, failures) = {
            let mut core = self.inner().core.lock();
            let mut plans: Vec<AdmissionPlan> = Vec::new();
            let mut failures: Vec<FailureOutcome> = Vec::new();
            for runtime in core.workflows.values_mut() {
                if runtime.state.status != WorkflowStatus::Running {
                    continue;
                }
                runtime.promote_ready();
                for node_id in runtime.ready_ids() {
                    match runtime.resolve_node_parameters(&node_id) {
                        Ok(resolved) => {
                            let dependencies: FxHashSet<JobId> = {
                                let node = &runtime.nodes[&node_id];
                                node.dependencies
                                    .iter()
                                    .filter_map(|dep| runtime.nodes.get(dep))
                                    .filter_map(|dep| dep.job_id.clone())
                                    .collect()
                            };
                            let node = runtime
                                .nodes
                                .get_mut(&node_id)
                                .expect("ready node present");
                            node.resolved_parameters = Some(resolved.clone());
                            plans.push(AdmissionPlan {
                                workflow_id: runtime.state.workflow_id.clone(),
                                node_id: node_id.clone(),
                                spec: JobSpec {
                                    runner: node.runner,
                                    cluster: node.cluster.clone(),
                                    work: WorkSpec {
                                        job_name: node.job_name.clone(),
                                        template: node.template.clone(),
                                        parameters: resolved,
                                    },
                                    workflow_id: Some(runtime.state.workflow_id.clone()),
                                    node_id: Some(node_id.clone()),
                                },
                                dependencies,
                                priority: node.priority,
                                runner: node.runner,
                                cluster: node.cluster.clone(),
                            });
                        }
                        Err(error) => {
                            // Resolution errors are node failures raised
                            // before submission; the node never reaches the
                            // queue.
                            failures.push(runtime.apply_failure(&node_id, error.to_string()));
                        }
                    }
                }
            }
            (plans, failures)
        };
        for outcome in failures {
            self.execute_outcome(outcome).await;
        }

        // I/O stage: create the store job and enqueue, lock released.
        for plan in plans {
            let created = self.inner().store.create_job(plan.spec).await;
            let job_id = match created {
                Ok(job_id) => job_id,
                Err(error) => {
                    self.fail_node(&plan.workflow_id, &plan.node_id, error.to_string())
                        .await;
                    continue;
                }
            };
            let enqueued = self
                .inner()
                .queue
                .enqueue(
                    job_id.clone(),
                    plan.dependencies,
                    plan.priority,
                    plan.runner,
                    plan.cluster,
                )
                .await;
            if let Err(error) = enqueued {
                self.fail_node(&plan.workflow_id, &plan.node_id, error.to_string())
                    .await;
                continue;
            }

            // Record the admission, re-verifying that the workflow was not
            // paused or cancelled while the lock was released.
            let recorded = {
                let mut core = self.inner().core.lock();
                let live = core.workflows.get_mut(&plan.workflow_id).and_then(|rt| {
                    if rt.state.status != WorkflowStatus::Running {
                        return None;
                    }
                    let node = rt.nodes.get_mut(&plan.node_id)?;
                    if node.status != NodeStatus::Ready {
                        return None;
                    }
                    node.job_id = Some(job_id.clone());
                    node.status = NodeStatus::Queued;
                    Some(())
                });
                if live.is_some() {
                    core.job_index
                        .insert(job_id.clone(), (plan.workflow_id, plan.node_id));
                    true
                } else {
                    false
                }
            };
            if !recorded {
                // The enqueue is orphaned; pull it back out of the queue.
                let _ = self.inner().queue.dequeue(&job_id);
            }
        }
        Ok(())
    }

    /// One queue admission pass plus backend submission for every admitted
    /// job.
    pub(crate) async fn run_submissions(&self) -> Result<Vec<JobId>, OrchestratorError> {
        let admitted = self.inner().queue.schedule().await?;
        let mut submitted = Vec::new();
        for job_id in admitted {
            let plan: Option<SubmissionPlan> = {
                let core = self.inner().core.lock();
                core.job_index.get(&job_id).and_then(|(wf, node_id)| {
                    let runtime = core.workflows.get(wf)?;
                    let node = runtime.nodes.get(node_id)?;
                    if node.status != NodeStatus::Queued {
                        return None;
                    }
                    Some(SubmissionPlan {
                        workflow_id: wf.clone(),
                        node_id: node_id.clone(),
                        work: WorkSpec {
                            job_name: node.job_name.clone(),
                            template: node.template.clone(),
                            parameters: node.resolved_parameters.clone().unwrap_or_default(),
                        },
                        runner: node.runner,
                    })
                })
            };
            let Some(plan) = plan else {
                // Admitted job with no live node (cancelled or superseded):
                // release the slot and move on.
                self.inner().queue.mark_terminal(&job_id, JobStatus::Cancelled);
                continue;
            };

            let runner = match self.runner_for(plan.runner) {
                Ok(runner) => runner,
                Err(error) => {
                    self.inner().queue.mark_terminal(&job_id, JobStatus::Failed);
                    let _ = self
                        .inner()
                        .store
                        .update_status(&job_id, JobStatus::Failed)
                        .await;
                    self.fail_node(&plan.workflow_id, &plan.node_id, error.to_string())
                        .await;
                    continue;
                }
            };

            match runner.submit(&job_id, &plan.work).await {
                Ok(handle) => {
                    if let Err(error) = self
                        .inner()
                        .store
                        .update_status(&job_id, JobStatus::Running)
                        .await
                    {
                        warn!(%job_id, %error, "store status update failed after submit");
                    }
                    let event = {
                        let mut core = self.inner().core.lock();
                        core.workflows.get_mut(&plan.workflow_id).and_then(|rt| {
                            let node = rt.nodes.get_mut(&plan.node_id)?;
                            node.job_handle = Some(handle);
                            node.status = NodeStatus::Running;
                            rt.state.mark_running(&plan.node_id);
                            Some(Event::node(
                                plan.workflow_id.clone(),
                                plan.node_id.clone(),
                                Some(job_id.clone()),
                                NodePhase::Started,
                            ))
                        })
                    };
                    if let Some(event) = event {
                        self.inner().bus.emit(event);
                    }
                    submitted.push(job_id);
                }
                Err(error) => {
                    // Submission errors are routed through the failure
                    // policy like any other node-level failure.
                    self.inner().queue.mark_terminal(&job_id, JobStatus::Failed);
                    let _ = self
                        .inner()
                        .store
                        .update_status(&job_id, JobStatus::Failed)
                        .await;
                    self.fail_node(&plan.workflow_id, &plan.node_id, error.to_string())
                        .await;
                }
            }
        }
        Ok(submitted)
    }

    /// Apply a failure policy to one node and execute the outcome.
    async fn fail_node(&self, workflow_id: &WorkflowId, node_id: &NodeId, error: String) {
        let outcome = {
            let mut core = self.inner().core.lock();
            core.workflows
                .get_mut(workflow_id)
                .map(|runtime| runtime.apply_failure(node_id, error))
                .unwrap_or_default()
        };
        self.execute_outcome(outcome).await;
    }

    /// Cancel queue entries and backend jobs requested by a policy
    /// application, then emit its events. All I/O happens without the core
    /// lock.
    async fn execute_outcome(&self, outcome: FailureOutcome) {
        for job_id in &outcome.cancel_queue_jobs {
            if let Err(error) = self.inner().queue.cancel(job_id) {
                debug!(%job_id, %error, "queue cancel skipped");
            }
        }
        for handle in &outcome.cancel_handles {
            match self.runner_for(handle.runner) {
                Ok(runner) => {
                    if let Err(error) = runner.cancel(handle).await {
                        warn!(job_id = %handle.job_id, %error, "backend cancel failed");
                    }
                }
                Err(error) => warn!(%error, "no runner for cancellation"),
            }
        }
        for event in outcome.events {
            self.inner().bus.emit(event);
        }
    }

    fn runner_for_handle(
        &self,
        handle: &Option<JobHandle>,
    ) -> Option<std::sync::Arc<dyn crate::runner::Runner>> {
        handle
            .as_ref()
            .and_then(|h| self.runner_for(h.runner).ok())
    }
}
