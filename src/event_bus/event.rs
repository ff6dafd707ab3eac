//! Lifecycle events emitted by the orchestrator.
//!
//! A closed tagged union: consumers match on [`Event`] and the phase enums
//! instead of registering duck-typed callbacks. Events are serializable so
//! sinks can ship them over the wire as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::types::{JobId, NodeId, WorkflowId};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Event {
    Workflow(WorkflowEvent),
    Node(NodeEvent),
    Diagnostic(DiagnosticEvent),
}

/// Workflow-level lifecycle transition.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEvent {
    pub workflow_id: WorkflowId,
    pub phase: WorkflowPhase,
    pub when: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Started,
    Paused,
    Resumed,
    Completed,
    Failed,
    Cancelled,
}

/// Node-level lifecycle transition, with payloads on the phases that carry
/// data.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeEvent {
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub job_id: Option<JobId>,
    pub phase: NodePhase,
    pub when: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NodePhase {
    Started,
    Completed { results: Value },
    Failed { error: String, retry_count: u32 },
    Skipped,
}

/// Free-form diagnostics from the orchestration plumbing itself.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DiagnosticEvent {
    pub scope: String,
    pub message: String,
}

impl Event {
    pub fn workflow(workflow_id: impl Into<WorkflowId>, phase: WorkflowPhase) -> Self {
        Event::Workflow(WorkflowEvent {
            workflow_id: workflow_id.into(),
            phase,
            when: Utc::now(),
        })
    }

    pub fn node(
        workflow_id: impl Into<WorkflowId>,
        node_id: impl Into<NodeId>,
        job_id: Option<JobId>,
        phase: NodePhase,
    ) -> Self {
        Event::Node(NodeEvent {
            workflow_id: workflow_id.into(),
            node_id: node_id.into(),
            job_id,
            phase,
            when: Utc::now(),
        })
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic(DiagnosticEvent {
            scope: scope.into(),
            message: message.into(),
        })
    }

    /// Workflow id the event belongs to, when it has one.
    #[must_use]
    pub fn workflow_id(&self) -> Option<&str> {
        match self {
            Event::Workflow(e) => Some(&e.workflow_id),
            Event::Node(e) => Some(&e.workflow_id),
            Event::Diagnostic(_) => None,
        }
    }

    /// Structured JSON form with a normalized `type`/`timestamp` envelope.
    #[must_use]
    pub fn to_json_value(&self) -> Value {
        use serde_json::json;
        match self {
            Event::Workflow(e) => json!({
                "type": "workflow",
                "workflow_id": e.workflow_id,
                "phase": e.phase,
                "timestamp": e.when.to_rfc3339(),
            }),
            Event::Node(e) => json!({
                "type": "node",
                "workflow_id": e.workflow_id,
                "node_id": e.node_id,
                "job_id": e.job_id,
                "phase": e.phase,
                "timestamp": e.when.to_rfc3339(),
            }),
            Event::Diagnostic(e) => json!({
                "type": "diagnostic",
                "scope": e.scope,
                "message": e.message,
            }),
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Workflow(e) => write!(f, "[{}] workflow {}", e.workflow_id, e.phase),
            Event::Node(e) => match &e.phase {
                NodePhase::Started => write!(f, "[{}/{}] started", e.workflow_id, e.node_id),
                NodePhase::Completed { .. } => {
                    write!(f, "[{}/{}] completed", e.workflow_id, e.node_id)
                }
                NodePhase::Failed { error, retry_count } => write!(
                    f,
                    "[{}/{}] failed (retry {}): {}",
                    e.workflow_id, e.node_id, retry_count, error
                ),
                NodePhase::Skipped => write!(f, "[{}/{}] skipped", e.workflow_id, e.node_id),
            },
            Event::Diagnostic(e) => write!(f, "[{}] {}", e.scope, e.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_envelope_carries_the_phase_payload() {
        let event = Event::node(
            "wf-1",
            "relax",
            Some("job-1".to_string()),
            NodePhase::Completed {
                results: json!({"energy": -2.5}),
            },
        );
        let value = event.to_json_value();
        assert_eq!(value["type"], "node");
        assert_eq!(value["phase"]["completed"]["results"]["energy"], json!(-2.5));
    }

    #[test]
    fn display_is_compact() {
        let event = Event::workflow("wf-9", WorkflowPhase::Started);
        assert_eq!(event.to_string(), "[wf-9] workflow started");
        let event = Event::node(
            "wf-9",
            "a",
            None,
            NodePhase::Failed {
                error: "boom".into(),
                retry_count: 1,
            },
        );
        assert_eq!(event.to_string(), "[wf-9/a] failed (retry 1): boom");
    }
}
