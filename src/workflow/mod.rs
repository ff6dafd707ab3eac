//! Workflow definitions and runtime state.
//!
//! [`definition`] holds the immutable shape of a workflow (nodes, raw
//! parameters, dependency edges) and the builder used to assemble it;
//! [`state`] holds everything that changes while a workflow runs (status
//! enums, failure policies, per-workflow progress sets).

pub mod definition;
pub mod state;

pub use definition::{NodeSpec, WorkflowBuilder, WorkflowDefinition, WorkflowNode};
pub use state::{FailurePolicy, NodeStatus, WorkflowState, WorkflowStatus};
