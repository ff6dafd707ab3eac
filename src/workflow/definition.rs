//! Immutable workflow definitions and the builder that assembles them.
//!
//! A [`WorkflowDefinition`] is the declarative shape of a workflow: named
//! nodes with raw parameters, dependency edges, failure policies, and
//! global parameters shared by every node. Definitions are immutable once
//! registered; the orchestrator materializes a mutable [`WorkflowNode`] per
//! spec at registration time.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::runner::JobHandle;
use crate::types::{JobId, NodeId, Priority, RunnerKind, WorkflowId};
use crate::utils::id_generator::IdGenerator;
use crate::workflow::state::{FailurePolicy, NodeStatus};

/// Declarative description of one workflow step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSpec {
    pub node_id: NodeId,
    pub job_name: String,
    /// Name of the job template the backend should instantiate.
    pub template: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub dependencies: FxHashSet<NodeId>,
    /// `None` falls back to the workflow's default policy.
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_runner")]
    pub runner: RunnerKind,
    #[serde(default)]
    pub cluster: Option<String>,
}

fn default_runner() -> RunnerKind {
    RunnerKind::Local
}

impl NodeSpec {
    pub fn new(
        node_id: impl Into<NodeId>,
        job_name: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            job_name: job_name.into(),
            template: template.into(),
            parameters: Map::new(),
            dependencies: FxHashSet::default(),
            failure_policy: None,
            max_retries: 0,
            priority: 0,
            runner: RunnerKind::Local,
            cluster: None,
        }
    }

    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn depends_on(mut self, node_id: impl Into<NodeId>) -> Self {
        self.dependencies.insert(node_id.into());
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn runner(mut self, runner: RunnerKind) -> Self {
        self.runner = runner;
        self
    }

    #[must_use]
    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }
}

/// Immutable workflow shape, produced by [`WorkflowBuilder::build`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub nodes: FxHashMap<NodeId, NodeSpec>,
    pub global_parameters: Map<String, Value>,
    pub default_failure_policy: FailurePolicy,
}

impl WorkflowDefinition {
    /// `(node, dependency)` edge pairs for graph validation.
    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.nodes.values().flat_map(|spec| {
            spec.dependencies
                .iter()
                .map(|dep| (spec.node_id.clone(), dep.clone()))
        })
    }
}

/// Fluent builder for [`WorkflowDefinition`].
pub struct WorkflowBuilder {
    name: String,
    nodes: FxHashMap<NodeId, NodeSpec>,
    global_parameters: Map<String, Value>,
    default_failure_policy: FailurePolicy,
}

impl WorkflowBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: FxHashMap::default(),
            global_parameters: Map::new(),
            default_failure_policy: FailurePolicy::default(),
        }
    }

    /// Add a node spec. A later spec with the same `node_id` replaces the
    /// earlier one.
    #[must_use]
    pub fn node(mut self, spec: NodeSpec) -> Self {
        self.nodes.insert(spec.node_id.clone(), spec);
        self
    }

    #[must_use]
    pub fn global(mut self, key: impl Into<String>, value: Value) -> Self {
        self.global_parameters.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn default_policy(mut self, policy: FailurePolicy) -> Self {
        self.default_failure_policy = policy;
        self
    }

    #[must_use]
    pub fn build(self) -> WorkflowDefinition {
        WorkflowDefinition {
            workflow_id: IdGenerator::new().workflow_id(),
            name: self.name,
            nodes: self.nodes,
            global_parameters: self.global_parameters,
            default_failure_policy: self.default_failure_policy,
        }
    }
}

/// Mutable per-node runtime record, materialized at registration.
///
/// Mutated only by the scheduler loop and the orchestrator API; destroyed
/// with the owning workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub node_id: NodeId,
    pub job_name: String,
    pub template: String,
    pub parameters: Map<String, Value>,
    pub resolved_parameters: Option<Map<String, Value>>,
    pub dependencies: FxHashSet<NodeId>,
    pub status: NodeStatus,
    pub failure_policy: FailurePolicy,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    pub runner: RunnerKind,
    pub cluster: Option<String>,
    /// Store job id for the current attempt, set at admission.
    pub job_id: Option<JobId>,
    /// Backend handle for the current attempt, set after submission.
    pub job_handle: Option<JobHandle>,
    pub results: Option<Value>,
}

impl WorkflowNode {
    /// Materialize a runtime node from its spec, applying the workflow
    /// default policy where the spec left it unset.
    #[must_use]
    pub fn materialize(spec: &NodeSpec, default_policy: FailurePolicy) -> Self {
        Self {
            node_id: spec.node_id.clone(),
            job_name: spec.job_name.clone(),
            template: spec.template.clone(),
            parameters: spec.parameters.clone(),
            resolved_parameters: None,
            dependencies: spec.dependencies.clone(),
            status: NodeStatus::Pending,
            failure_policy: spec.failure_policy.unwrap_or(default_policy),
            retry_count: 0,
            max_retries: spec.max_retries,
            priority: spec.priority,
            runner: spec.runner,
            cluster: spec.cluster.clone(),
            job_id: None,
            job_handle: None,
            results: None,
        }
    }

    /// Reset the node for a RETRY resubmission: back to `Pending` with the
    /// previous attempt's job identity and outputs discarded.
    pub fn reset_for_retry(&mut self) {
        self.status = NodeStatus::Pending;
        self.resolved_parameters = None;
        self.job_id = None;
        self.job_handle = None;
        self.results = None;
    }
}
