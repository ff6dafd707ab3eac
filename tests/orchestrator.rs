//! End-to-end scenarios driven through the public orchestrator surface
//! with a scripted runner and the in-memory store.

mod common;

use common::*;
use flowsmith::event_bus::{Event, NodePhase};
use flowsmith::orchestrator::OrchestratorError;
use flowsmith::types::JobStatus;
use flowsmith::workflow::{FailurePolicy, NodeSpec, NodeStatus, WorkflowBuilder, WorkflowStatus};
use rustc_hash::FxHashMap;
use serde_json::json;

#[tokio::test]
async fn linear_workflow_completes_and_threads_results() {
    let h = harness();
    h.runner.with_result("job-a", json!({"energy": -3.5}));
    let def = WorkflowBuilder::new("two-step")
        .node(NodeSpec::new("a", "job-a", "tmpl"))
        .node(
            NodeSpec::new("b", "job-b", "tmpl")
                .depends_on("a")
                .param("input_energy", json!("${a.energy}")),
        )
        .build();
    let wf = launch(&h, def).await;

    drive(&h.orchestrator, 3).await;

    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Completed);
    assert_node(&h.orchestrator, &wf, "a", NodeStatus::Completed);
    assert_node(&h.orchestrator, &wf, "b", NodeStatus::Completed);
    assert!((h.orchestrator.progress(&wf).unwrap() - 1.0).abs() < f64::EPSILON);

    // b's store job was created with a's result threaded in.
    let b_record = h
        .store
        .snapshot()
        .into_iter()
        .find(|record| record.spec.work.job_name == "job-b")
        .expect("job-b was created");
    assert_eq!(b_record.spec.work.parameters["input_energy"], json!(-3.5));
}

#[tokio::test]
async fn registration_rejects_cycles_with_no_partial_state() {
    let h = harness();
    let def = WorkflowBuilder::new("cyclic")
        .node(NodeSpec::new("a", "job-a", "tmpl").depends_on("c"))
        .node(NodeSpec::new("b", "job-b", "tmpl").depends_on("a"))
        .node(NodeSpec::new("c", "job-c", "tmpl").depends_on("b"))
        .build();
    let err = h.orchestrator.register_workflow(def).unwrap_err();
    assert!(matches!(err, OrchestratorError::Circular(_)));
    assert!(h.orchestrator.list_workflows().is_empty());
}

// Scenario: linear a -> b -> c, a fails with ABORT.
#[tokio::test]
async fn abort_fails_the_workflow_and_skips_downstream() {
    let h = harness();
    h.runner.always_fail("job-a");
    let wf = launch(&h, linear_abc(FailurePolicy::Abort)).await;

    drive(&h.orchestrator, 2).await;

    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Failed);
    assert_node(&h.orchestrator, &wf, "a", NodeStatus::Failed);
    assert_node(&h.orchestrator, &wf, "b", NodeStatus::Skipped);
    assert_node(&h.orchestrator, &wf, "c", NodeStatus::Skipped);
    // b and c never reached the backend.
    assert_eq!(h.runner.submissions_of("job-b"), 0);
    assert_eq!(h.runner.submissions_of("job-c"), 0);
}

// Scenario: diamond a -> {b, c} -> d, b fails with SKIP_DEPENDENTS.
#[tokio::test]
async fn skip_dependents_spares_independent_branches() {
    let h = harness();
    h.runner.always_fail("job-b");
    let wf = launch(&h, diamond(FailurePolicy::SkipDependents)).await;

    drive(&h.orchestrator, 4).await;

    assert_node(&h.orchestrator, &wf, "a", NodeStatus::Completed);
    assert_node(&h.orchestrator, &wf, "b", NodeStatus::Failed);
    assert_node(&h.orchestrator, &wf, "c", NodeStatus::Completed);
    assert_node(&h.orchestrator, &wf, "d", NodeStatus::Skipped);
    // Partial failure is explicit: the workflow ends Failed.
    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Failed);
}

// Scenario: single node, max_retries = 2, backend fails every attempt.
#[tokio::test]
async fn retry_bound_is_exact_then_falls_back_to_abort() {
    let h = harness();
    h.runner.always_fail("job-a");
    let def = WorkflowBuilder::new("retrying")
        .node(
            NodeSpec::new("a", "job-a", "tmpl")
                .policy(FailurePolicy::Retry)
                .max_retries(2),
        )
        .build();
    let wf = launch(&h, def).await;

    drive(&h.orchestrator, 6).await;

    // Exactly three attempts: the original plus two retries.
    assert_eq!(h.runner.submissions_of("job-a"), 3);
    assert_node(&h.orchestrator, &wf, "a", NodeStatus::Failed);
    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Failed);
}

// Scenario: a parameter referencing a node outside the declared
// dependency set fails resolution before submission.
#[tokio::test]
async fn undeclared_reference_fails_before_submission() {
    let h = harness();
    let def = WorkflowBuilder::new("bad-reference")
        .node(NodeSpec::new("a", "job-a", "tmpl"))
        .node(
            NodeSpec::new("b", "job-b", "tmpl")
                .depends_on("a")
                .param("sneaky", json!("${other.value}")),
        )
        .build();
    let wf = launch(&h, def).await;

    drive(&h.orchestrator, 3).await;

    assert_node(&h.orchestrator, &wf, "b", NodeStatus::Failed);
    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Failed);
    // The node never reached the backend.
    assert_eq!(h.runner.submissions_of("job-b"), 0);
}

#[tokio::test]
async fn repeated_terminal_observations_are_idempotent() {
    let h = harness();
    let wf = launch(&h, linear_abc(FailurePolicy::Abort)).await;

    drive(&h.orchestrator, 4).await;
    let before = h.orchestrator.get_status(&wf).unwrap();
    assert_eq!(before.status, WorkflowStatus::Completed);

    // Extra passes re-observe the same terminal jobs.
    drive(&h.orchestrator, 3).await;
    let after = h.orchestrator.get_status(&wf).unwrap();
    assert_eq!(after.completed_nodes, before.completed_nodes);
    assert_eq!(after.failed_nodes, before.failed_nodes);
    assert_eq!(after.status, before.status);
    assert_eq!(after.finished_at, before.finished_at);
}

#[tokio::test]
async fn unknown_status_is_retried_not_guessed() {
    let h = harness();
    h.runner.status_sequence(
        "job-a",
        [JobStatus::Unknown, JobStatus::Unknown, JobStatus::Completed],
    );
    let def = WorkflowBuilder::new("unknown")
        .node(NodeSpec::new("a", "job-a", "tmpl"))
        .build();
    let wf = launch(&h, def).await;

    drive(&h.orchestrator, 1).await;
    assert_node(&h.orchestrator, &wf, "a", NodeStatus::Running);
    drive(&h.orchestrator, 1).await;
    assert_node(&h.orchestrator, &wf, "a", NodeStatus::Running);
    drive(&h.orchestrator, 2).await;
    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Completed);
}

#[tokio::test]
async fn pause_lets_running_nodes_finish_but_blocks_admission() {
    let h = harness();
    h.runner
        .status_sequence("job-a", [JobStatus::Running, JobStatus::Completed]);
    let def = WorkflowBuilder::new("pausable")
        .node(NodeSpec::new("a", "job-a", "tmpl"))
        .node(NodeSpec::new("b", "job-b", "tmpl").depends_on("a"))
        .build();
    let wf = launch(&h, def).await;

    drive(&h.orchestrator, 1).await;
    assert_node(&h.orchestrator, &wf, "a", NodeStatus::Running);

    h.orchestrator.pause(&wf).unwrap();
    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Paused);

    // a finishes while paused; b is not admitted.
    drive(&h.orchestrator, 2).await;
    assert_node(&h.orchestrator, &wf, "a", NodeStatus::Completed);
    assert_node(&h.orchestrator, &wf, "b", NodeStatus::Pending);
    assert_eq!(h.runner.submissions_of("job-b"), 0);

    h.orchestrator.resume(&wf).await.unwrap();
    drive(&h.orchestrator, 2).await;
    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Completed);
}

#[tokio::test]
async fn cancel_forces_terminal_without_waiting_for_backends() {
    let h = harness();
    h.runner.status_sequence("job-a", [JobStatus::Running]);
    let def = WorkflowBuilder::new("cancellable")
        .node(NodeSpec::new("a", "job-a", "tmpl"))
        .node(NodeSpec::new("b", "job-b", "tmpl").depends_on("a"))
        .build();
    let wf = launch(&h, def).await;

    drive(&h.orchestrator, 1).await;
    h.orchestrator.cancel(&wf).await.unwrap();

    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Cancelled);
    assert_node(&h.orchestrator, &wf, "a", NodeStatus::Skipped);
    assert_node(&h.orchestrator, &wf, "b", NodeStatus::Skipped);
    // Best-effort cancel reached the backend for the running job.
    assert_eq!(h.runner.cancelled().len(), 1);

    // Cancelling again is a caller error.
    assert!(matches!(
        h.orchestrator.cancel(&wf).await,
        Err(OrchestratorError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn submission_errors_route_through_the_failure_policy() {
    let h = harness();
    h.runner.fail_submissions("job-a", 1);
    let def = WorkflowBuilder::new("flaky-submit")
        .node(
            NodeSpec::new("a", "job-a", "tmpl")
                .policy(FailurePolicy::Retry)
                .max_retries(1),
        )
        .build();
    let wf = launch(&h, def).await;

    drive(&h.orchestrator, 4).await;

    // First submission is rejected, the retry succeeds.
    assert_eq!(h.runner.submissions_of("job-a"), 1);
    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Completed);
}

#[tokio::test]
async fn priorities_order_sibling_admissions() {
    let h = harness_with_queue(
        flowsmith::config::QueueConfig::default().with_default_slots(1),
    );
    h.runner
        .status_sequence("job-low", [JobStatus::Running, JobStatus::Completed]);
    h.runner
        .status_sequence("job-high", [JobStatus::Running, JobStatus::Completed]);
    let def = WorkflowBuilder::new("priorities")
        .node(NodeSpec::new("low", "job-low", "tmpl").priority(1))
        .node(NodeSpec::new("high", "job-high", "tmpl").priority(5))
        .build();
    let wf = launch(&h, def).await;

    // Capacity 1: only the high-priority node is running after start.
    assert_node(&h.orchestrator, &wf, "high", NodeStatus::Running);
    assert_node(&h.orchestrator, &wf, "low", NodeStatus::Queued);

    drive(&h.orchestrator, 4).await;
    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Completed);
}

#[tokio::test]
async fn lifecycle_events_arrive_in_order() {
    let h = harness();
    let events_rx = h.orchestrator.subscribe();
    h.runner.with_result("job-a", json!({"ok": true}));
    let def = WorkflowBuilder::new("observed")
        .node(NodeSpec::new("a", "job-a", "tmpl"))
        .build();
    let wf = launch(&h, def).await;
    drive(&h.orchestrator, 2).await;
    h.orchestrator.shutdown().await;

    let events: Vec<Event> = events_rx.try_iter().collect();
    let phases: Vec<String> = events
        .iter()
        .map(|event| match event {
            Event::Workflow(e) => format!("workflow:{}", e.phase),
            Event::Node(e) => match &e.phase {
                NodePhase::Started => format!("node:{}:started", e.node_id),
                NodePhase::Completed { .. } => format!("node:{}:completed", e.node_id),
                NodePhase::Failed { .. } => format!("node:{}:failed", e.node_id),
                NodePhase::Skipped => format!("node:{}:skipped", e.node_id),
            },
            Event::Diagnostic(e) => format!("diagnostic:{}", e.scope),
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            "workflow:started".to_string(),
            "node:a:started".to_string(),
            "node:a:completed".to_string(),
            "workflow:completed".to_string(),
        ]
    );
    // The completion event carries the retrieved results.
    let completed = events.iter().find_map(|event| match event {
        Event::Node(e) => match &e.phase {
            NodePhase::Completed { results } => Some(results.clone()),
            _ => None,
        },
        _ => None,
    });
    assert_eq!(completed, Some(json!({"ok": true})));

    // Terminal workflow events fired exactly once.
    let terminal = phases
        .iter()
        .filter(|p| p.as_str() == "workflow:completed")
        .count();
    assert_eq!(terminal, 1);
    let _ = wf;
}

#[tokio::test]
async fn background_scheduler_drives_to_completion() {
    let h = harness();
    let def = linear_abc(FailurePolicy::Abort);
    let wf = launch(&h, def).await;
    h.orchestrator.spawn_scheduler();

    let mut done = false;
    for _ in 0..200 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        if h.orchestrator.get_status(&wf).unwrap().status.is_terminal() {
            done = true;
            break;
        }
    }
    h.orchestrator.shutdown().await;
    assert!(done, "workflow did not finish under the background loop");
    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Completed);
}

#[tokio::test]
async fn recover_reconciles_from_store_and_resumes_downstream() {
    use flowsmith::runner::WorkSpec;
    use flowsmith::store::{JobSpec, JobStore};
    use flowsmith::types::RunnerKind;

    let h = harness();
    // A previous process completed node a's job.
    let a_job = h
        .store
        .create_job(JobSpec {
            runner: RunnerKind::Local,
            cluster: None,
            work: WorkSpec {
                job_name: "job-a".to_string(),
                template: "tmpl".to_string(),
                parameters: serde_json::Map::new(),
            },
            workflow_id: None,
            node_id: None,
        })
        .await
        .unwrap();
    h.store
        .update_status(&a_job, JobStatus::Completed)
        .await
        .unwrap();
    h.store
        .update_results(&a_job, json!({"energy": -1.5}))
        .await
        .unwrap();

    let def = WorkflowBuilder::new("recovered")
        .node(NodeSpec::new("a", "job-a", "tmpl"))
        .node(
            NodeSpec::new("b", "job-b", "tmpl")
                .depends_on("a")
                .param("seed", json!("${a.energy}")),
        )
        .build();
    let mut assignments = FxHashMap::default();
    assignments.insert("a".to_string(), a_job);
    let wf = h.orchestrator.recover(def, assignments).await.unwrap();

    assert_node(&h.orchestrator, &wf, "a", NodeStatus::Completed);
    drive(&h.orchestrator, 3).await;
    assert_workflow(&h.orchestrator, &wf, WorkflowStatus::Completed);

    // b resolved its parameters from the recovered results.
    let b_record = h
        .store
        .snapshot()
        .into_iter()
        .find(|record| record.spec.work.job_name == "job-b")
        .expect("job-b admitted after recovery");
    assert_eq!(b_record.spec.work.parameters["seed"], json!(-1.5));
}

#[tokio::test]
async fn caller_errors_on_unknown_workflow_ids() {
    let h = harness();
    let ghost = "wf-ghost".to_string();
    assert!(matches!(
        h.orchestrator.get_status(&ghost),
        Err(OrchestratorError::WorkflowNotFound { .. })
    ));
    assert!(matches!(
        h.orchestrator.start(&ghost).await,
        Err(OrchestratorError::WorkflowNotFound { .. })
    ));
    assert!(matches!(
        h.orchestrator.pause(&ghost),
        Err(OrchestratorError::WorkflowNotFound { .. })
    ));
}
