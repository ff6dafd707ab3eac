use flowsmith::orchestrator::Orchestrator;
use flowsmith::types::WorkflowId;
use flowsmith::workflow::{NodeStatus, WorkflowStatus};

pub fn assert_node(
    orchestrator: &Orchestrator,
    workflow_id: &WorkflowId,
    node_id: &str,
    expected: NodeStatus,
) {
    let actual = orchestrator
        .node_status(workflow_id, &node_id.to_string())
        .expect("workflow exists")
        .expect("node exists");
    assert_eq!(actual, expected, "node `{node_id}` status");
}

pub fn assert_workflow(
    orchestrator: &Orchestrator,
    workflow_id: &WorkflowId,
    expected: WorkflowStatus,
) {
    let state = orchestrator.get_status(workflow_id).expect("workflow exists");
    assert_eq!(state.status, expected, "workflow status");
}
