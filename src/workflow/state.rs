//! Status enums, failure policies, and per-workflow runtime state.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{NodeId, WorkflowId};

/// Lifecycle of a single node.
///
/// `Pending -> Ready -> Queued -> Running -> {Completed, Failed, Skipped}`.
/// The last three are terminal. A node only re-enters `Pending` through an
/// explicit RETRY resubmission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle of a whole workflow.
///
/// `Paused` is resumable; the other non-`Running` states past `Pending` are
/// terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Per-node rule deciding what a failure does to the rest of the workflow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The workflow fails immediately; every non-terminal node is skipped.
    #[default]
    Abort,
    /// Transitive dependents are skipped; independent branches continue.
    SkipDependents,
    /// Resubmit from `Pending` while retries remain, then fall back to
    /// `Abort`.
    Retry,
    /// The node stays failed and its dependents are skipped, but the
    /// workflow as a whole proceeds.
    Continue,
}

/// Mutable runtime state of one registered workflow.
///
/// Exclusively owned by the orchestrator. The three node sets are pairwise
/// disjoint by construction: every transition helper removes a node from
/// the other sets before inserting it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub completed_nodes: FxHashSet<NodeId>,
    pub failed_nodes: FxHashSet<NodeId>,
    pub running_nodes: FxHashSet<NodeId>,
    pub total_nodes: usize,
}

impl WorkflowState {
    #[must_use]
    pub fn new(workflow_id: WorkflowId, total_nodes: usize) -> Self {
        Self {
            workflow_id,
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            completed_nodes: FxHashSet::default(),
            failed_nodes: FxHashSet::default(),
            running_nodes: FxHashSet::default(),
            total_nodes,
        }
    }

    /// Fraction of nodes that reached a successful terminal state.
    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.total_nodes == 0 {
            return 1.0;
        }
        self.completed_nodes.len() as f64 / self.total_nodes as f64
    }

    pub fn mark_running(&mut self, node_id: &NodeId) {
        self.completed_nodes.remove(node_id);
        self.failed_nodes.remove(node_id);
        self.running_nodes.insert(node_id.clone());
    }

    pub fn mark_completed(&mut self, node_id: &NodeId) {
        self.running_nodes.remove(node_id);
        self.failed_nodes.remove(node_id);
        self.completed_nodes.insert(node_id.clone());
    }

    pub fn mark_failed(&mut self, node_id: &NodeId) {
        self.running_nodes.remove(node_id);
        self.completed_nodes.remove(node_id);
        self.failed_nodes.insert(node_id.clone());
    }

    /// Remove a node from every tracking set (retry resubmission, skip).
    pub fn clear_node(&mut self, node_id: &NodeId) {
        self.running_nodes.remove(node_id);
        self.completed_nodes.remove(node_id);
        self.failed_nodes.remove(node_id);
    }
}
