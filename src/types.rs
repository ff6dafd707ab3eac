//! Core identifier and classification types for the flowsmith engine.
//!
//! These are the vocabulary types shared by every layer: workflow/node/job
//! identifiers, the backend routing key ([`RunnerKind`]), admission priority,
//! and the externally observable [`JobStatus`]. Richer domain types (node and
//! workflow state machines) live in [`crate::workflow`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a registered workflow. Generated at build time by
/// [`IdGenerator`](crate::utils::id_generator::IdGenerator).
pub type WorkflowId = String;

/// Identifier of a node within a workflow. Unique per workflow, chosen by
/// the workflow author.
pub type NodeId = String;

/// Identifier of a job record in the [`JobStore`](crate::store::JobStore).
/// Jobs exist independently of workflow membership.
pub type JobId = String;

/// Admission priority. Higher values are admitted first; ties break FIFO by
/// enqueue order.
pub type Priority = i32;

/// The class of execution backend a job targets.
///
/// This is a routing key only: the queue tracks capacity per
/// `(RunnerKind, cluster)` slot and the orchestrator picks the matching
/// [`Runner`](crate::runner::Runner) implementation. Concrete transports
/// (process spawning, SSH, batch submission) live behind the `Runner` trait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    /// In-process or local-machine execution.
    Local,
    /// Remote execution over SSH.
    Ssh,
    /// Batch-scheduler execution (e.g. a cluster queue).
    Batch,
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Ssh => write!(f, "ssh"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

/// Externally observable status of a job, as reported by the store or a
/// runner backend.
///
/// `Unknown` is a legitimate, non-terminal answer: a backend that cannot
/// currently resolve a handle reports `Unknown` and the scheduler retries
/// observation on the next pass rather than guessing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl JobStatus {
    /// Terminal statuses never change again; the state machine processes
    /// each terminal observation exactly once.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Unknown.is_terminal());
    }

    #[test]
    fn runner_kind_round_trips_through_serde() {
        let encoded = serde_json::to_string(&RunnerKind::Batch).unwrap();
        assert_eq!(encoded, "\"batch\"");
        let decoded: RunnerKind = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, RunnerKind::Batch);
    }
}
