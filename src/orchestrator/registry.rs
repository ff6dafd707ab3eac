//! Per-workflow runtime state and the transition rules applied to it.
//!
//! A [`WorkflowRuntime`] owns everything mutable about one registered
//! workflow: the materialized nodes, the validated dependency graph, and
//! the [`WorkflowState`] tracking sets. The scheduler loop drives all
//! mutation through the methods here while holding the orchestrator's core
//! lock; none of these methods perform I/O.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::sync::Arc;

use crate::event_bus::{Event, NodePhase};
use crate::graph::{CircularDependencyError, DependencyGraph};
use crate::params::{ParameterResolutionError, ResolverScope, resolve_parameters};
use crate::runner::JobHandle;
use crate::types::{JobId, NodeId, WorkflowId};
use crate::workflow::definition::{WorkflowDefinition, WorkflowNode};
use crate::workflow::state::{FailurePolicy, NodeStatus, WorkflowState, WorkflowStatus};

static NULL_RESULTS: Value = Value::Null;

/// What a failure application asks the scheduler to do outside the lock.
#[derive(Debug, Default)]
pub(crate) struct FailureOutcome {
    pub events: Vec<Event>,
    /// Queue entries to cancel (jobs that were queued but not yet running).
    pub cancel_queue_jobs: Vec<JobId>,
    /// Backend handles to cancel, best-effort.
    pub cancel_handles: Vec<JobHandle>,
}

/// Runtime state of one registered workflow.
pub(crate) struct WorkflowRuntime {
    pub definition: Arc<WorkflowDefinition>,
    pub graph: DependencyGraph<NodeId>,
    pub nodes: FxHashMap<NodeId, WorkflowNode>,
    pub state: WorkflowState,
}

impl WorkflowRuntime {
    /// Validate the definition's edge set and materialize runtime nodes.
    /// Nothing is retained on failure.
    pub fn materialize(
        definition: WorkflowDefinition,
    ) -> Result<Self, CircularDependencyError> {
        let mut graph = DependencyGraph::new();
        for spec in definition.nodes.values() {
            graph.add_node(spec.node_id.clone());
        }
        for (node, dep) in definition.edges() {
            graph.add_dependency(node, dep);
        }
        graph.validate()?;

        let nodes: FxHashMap<NodeId, WorkflowNode> = definition
            .nodes
            .values()
            .map(|spec| {
                (
                    spec.node_id.clone(),
                    WorkflowNode::materialize(spec, definition.default_failure_policy),
                )
            })
            .collect();
        let state = WorkflowState::new(definition.workflow_id.clone(), nodes.len());

        Ok(Self {
            definition: Arc::new(definition),
            graph,
            nodes,
            state,
        })
    }

    pub fn workflow_id(&self) -> &WorkflowId {
        &self.state.workflow_id
    }

    /// Node ids whose status is `Completed`.
    pub fn completed_set(&self) -> FxHashSet<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.status == NodeStatus::Completed)
            .map(|node| node.node_id.clone())
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|node| node.status.is_terminal())
    }

    /// Promote `Pending` nodes whose dependencies are all completed to
    /// `Ready`, returning the promoted ids.
    pub fn promote_ready(&mut self) -> Vec<NodeId> {
        let completed = self.completed_set();
        let promoted: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| node.status == NodeStatus::Pending)
            .filter(|node| self.graph.is_ready(&node.node_id, &completed))
            .map(|node| node.node_id.clone())
            .collect();
        for node_id in &promoted {
            if let Some(node) = self.nodes.get_mut(node_id) {
                node.status = NodeStatus::Ready;
            }
        }
        promoted
    }

    /// Ids of nodes currently `Ready` (resolved or not).
    pub fn ready_ids(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|node| node.status == NodeStatus::Ready)
            .map(|node| node.node_id.clone())
            .collect()
    }

    /// Render one node's parameters against globals, its own raw values,
    /// and its completed dependencies' results.
    pub fn resolve_node_parameters(
        &self,
        node_id: &NodeId,
    ) -> Result<serde_json::Map<String, Value>, ParameterResolutionError> {
        let node = &self.nodes[node_id];
        let dependency_results: FxHashMap<&str, &Value> = node
            .dependencies
            .iter()
            .filter_map(|dep| self.nodes.get(dep))
            .filter(|dep| dep.status == NodeStatus::Completed)
            .map(|dep| {
                (
                    dep.node_id.as_str(),
                    dep.results.as_ref().unwrap_or(&NULL_RESULTS),
                )
            })
            .collect();
        let scope = ResolverScope {
            globals: &self.definition.global_parameters,
            own: &node.parameters,
            dependency_results,
        };
        resolve_parameters(&node.parameters, &scope)
    }

    /// Record a successful completion.
    pub fn apply_completion(&mut self, node_id: &NodeId, results: Value) -> Vec<Event> {
        let workflow_id = self.state.workflow_id.clone();
        let Some(node) = self.nodes.get_mut(node_id) else {
            return Vec::new();
        };
        node.status = NodeStatus::Completed;
        node.results = Some(results.clone());
        self.state.mark_completed(node_id);
        vec![Event::node(
            workflow_id,
            node_id.clone(),
            node.job_id.clone(),
            NodePhase::Completed { results },
        )]
    }

    /// Route one node failure through its failure policy.
    ///
    /// RETRY with remaining budget resets the node to `Pending`; an
    /// exhausted RETRY falls back to ABORT (the crate-wide default for the
    /// exhaustion fallback). ABORT fails the workflow and skips every
    /// non-terminal node; SKIP_DEPENDENTS and CONTINUE skip the transitive
    /// dependents and let independent branches proceed.
    pub fn apply_failure(&mut self, node_id: &NodeId, error: String) -> FailureOutcome {
        let workflow_id = self.state.workflow_id.clone();
        let mut outcome = FailureOutcome::default();
        let Some(node) = self.nodes.get_mut(node_id) else {
            return outcome;
        };
        let policy = node.failure_policy;

        if policy == FailurePolicy::Retry && node.retry_count < node.max_retries {
            node.retry_count += 1;
            let retry_count = node.retry_count;
            let old_job = node.job_id.clone();
            node.reset_for_retry();
            self.state.clear_node(node_id);
            outcome.events.push(Event::node(
                workflow_id,
                node_id.clone(),
                old_job,
                NodePhase::Failed { error, retry_count },
            ));
            return outcome;
        }

        let effective = match policy {
            FailurePolicy::Retry => FailurePolicy::Abort,
            other => other,
        };

        node.status = NodeStatus::Failed;
        let retry_count = node.retry_count;
        let job_id = node.job_id.clone();
        self.state.mark_failed(node_id);
        outcome.events.push(Event::node(
            workflow_id.clone(),
            node_id.clone(),
            job_id,
            NodePhase::Failed { error, retry_count },
        ));

        let skipped = match effective {
            FailurePolicy::Abort => {
                self.state.status = WorkflowStatus::Failed;
                self.state.finished_at = Some(chrono::Utc::now());
                self.skip_all_non_terminal(&mut outcome)
            }
            FailurePolicy::SkipDependents | FailurePolicy::Continue => {
                self.skip_dependents_of(node_id, &mut outcome)
            }
            FailurePolicy::Retry => unreachable!("mapped to Abort above"),
        };
        for skipped_id in skipped {
            let job_id = self.nodes.get(&skipped_id).and_then(|n| n.job_id.clone());
            outcome.events.push(Event::node(
                workflow_id.clone(),
                skipped_id,
                job_id,
                NodePhase::Skipped,
            ));
        }
        if effective == FailurePolicy::Abort {
            outcome.events.push(Event::workflow(
                workflow_id,
                crate::event_bus::WorkflowPhase::Failed,
            ));
        }
        outcome
    }

    /// Force every non-terminal node to `Skipped`, collecting cancellation
    /// work for anything already queued or running.
    pub fn skip_all_non_terminal(&mut self, outcome: &mut FailureOutcome) -> Vec<NodeId> {
        let ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| !node.status.is_terminal())
            .map(|node| node.node_id.clone())
            .collect();
        for node_id in &ids {
            self.skip_node(node_id, outcome);
        }
        ids
    }

    fn skip_dependents_of(
        &mut self,
        node_id: &NodeId,
        outcome: &mut FailureOutcome,
    ) -> Vec<NodeId> {
        let dependents = self.graph.transitive_dependents(node_id);
        let mut skipped = Vec::new();
        for dependent in dependents {
            let is_open = self
                .nodes
                .get(&dependent)
                .is_some_and(|node| !node.status.is_terminal());
            if is_open {
                self.skip_node(&dependent, outcome);
                skipped.push(dependent);
            }
        }
        skipped
    }

    fn skip_node(&mut self, node_id: &NodeId, outcome: &mut FailureOutcome) {
        let Some(node) = self.nodes.get_mut(node_id) else {
            return;
        };
        match node.status {
            NodeStatus::Queued => {
                if let Some(job_id) = node.job_id.clone() {
                    outcome.cancel_queue_jobs.push(job_id);
                }
            }
            NodeStatus::Running => {
                if let Some(handle) = node.job_handle.clone() {
                    outcome.cancel_handles.push(handle);
                }
                if let Some(job_id) = node.job_id.clone() {
                    outcome.cancel_queue_jobs.push(job_id);
                }
            }
            _ => {}
        }
        node.status = NodeStatus::Skipped;
        self.state.clear_node(node_id);
    }

    /// Transition a running workflow whose nodes are all terminal, exactly
    /// once. Returns the terminal event to emit.
    pub fn maybe_finalize(&mut self) -> Option<Event> {
        if self.state.status != WorkflowStatus::Running || !self.all_terminal() {
            return None;
        }
        let phase = if self.state.failed_nodes.is_empty() {
            self.state.status = WorkflowStatus::Completed;
            crate::event_bus::WorkflowPhase::Completed
        } else {
            // Explicit partial-failure semantics: nothing further can
            // become ready and at least one node failed.
            self.state.status = WorkflowStatus::Failed;
            crate::event_bus::WorkflowPhase::Failed
        };
        self.state.finished_at = Some(chrono::Utc::now());
        Some(Event::workflow(self.state.workflow_id.clone(), phase))
    }
}

/// All registered workflows plus the reverse job index the scheduler uses
/// to resolve an observed job id back to its owning node.
#[derive(Default)]
pub(crate) struct Registry {
    pub workflows: FxHashMap<WorkflowId, WorkflowRuntime>,
    pub job_index: FxHashMap<JobId, (WorkflowId, NodeId)>,
}

impl Registry {
    pub fn runtime_mut(&mut self, workflow_id: &WorkflowId) -> Option<&mut WorkflowRuntime> {
        self.workflows.get_mut(workflow_id)
    }
}
