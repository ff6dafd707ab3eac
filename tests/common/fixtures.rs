use std::sync::Arc;
use std::time::Duration;

use flowsmith::config::{EventBusConfig, QueueConfig, RuntimeConfig};
use flowsmith::orchestrator::Orchestrator;
use flowsmith::store::InMemoryJobStore;
use flowsmith::types::{RunnerKind, WorkflowId};
use flowsmith::utils::testing::ScriptedRunner;
use flowsmith::workflow::{FailurePolicy, NodeSpec, WorkflowBuilder, WorkflowDefinition};

/// Orchestrator wired to an in-memory store and a scripted local runner,
/// with no stdout sink noise.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub runner: Arc<ScriptedRunner>,
    pub store: Arc<InMemoryJobStore>,
}

pub fn harness() -> Harness {
    harness_with_queue(QueueConfig::default())
}

pub fn harness_with_queue(queue: QueueConfig) -> Harness {
    let store = Arc::new(InMemoryJobStore::new());
    let runner = Arc::new(ScriptedRunner::new());
    let config = RuntimeConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_queue(queue)
        .with_event_bus(EventBusConfig::silent());
    let orchestrator = Orchestrator::new(store.clone(), config);
    orchestrator.add_runner(RunnerKind::Local, runner.clone());
    Harness {
        orchestrator,
        runner,
        store,
    }
}

/// Run `passes` reconciliation passes back to back.
pub async fn drive(orchestrator: &Orchestrator, passes: usize) {
    for _ in 0..passes {
        orchestrator
            .tick()
            .await
            .expect("reconciliation pass should not fail in tests");
    }
}

/// Register and start a workflow in one step.
pub async fn launch(harness: &Harness, definition: WorkflowDefinition) -> WorkflowId {
    let workflow_id = harness
        .orchestrator
        .register_workflow(definition)
        .expect("definition is valid");
    harness
        .orchestrator
        .start(&workflow_id)
        .await
        .expect("workflow starts");
    workflow_id
}

/// `a -> b -> c` with job names `job-a`, `job-b`, `job-c`.
pub fn linear_abc(policy: FailurePolicy) -> WorkflowDefinition {
    WorkflowBuilder::new("linear")
        .default_policy(policy)
        .node(NodeSpec::new("a", "job-a", "tmpl"))
        .node(NodeSpec::new("b", "job-b", "tmpl").depends_on("a"))
        .node(NodeSpec::new("c", "job-c", "tmpl").depends_on("b"))
        .build()
}

/// Diamond `a -> {b, c} -> d`; `b` carries its own failure policy.
pub fn diamond(b_policy: FailurePolicy) -> WorkflowDefinition {
    WorkflowBuilder::new("diamond")
        .node(NodeSpec::new("a", "job-a", "tmpl"))
        .node(
            NodeSpec::new("b", "job-b", "tmpl")
                .depends_on("a")
                .policy(b_policy),
        )
        .node(NodeSpec::new("c", "job-c", "tmpl").depends_on("a"))
        .node(
            NodeSpec::new("d", "job-d", "tmpl")
                .depends_on("b")
                .depends_on("c"),
        )
        .build()
}
