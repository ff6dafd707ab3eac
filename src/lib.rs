//! # Flowsmith: DAG workflow orchestration with a priority job queue
//!
//! Flowsmith runs multi-step computational workflows: it validates a
//! workflow's dependency graph, renders each step's parameters from
//! upstream results through a sandboxed template layer, mediates between
//! ready work and finite backend capacity with a priority queue, and
//! advances everything from a reconciliation loop that observes externally
//! reported job completions.
//!
//! ## Core concepts
//!
//! - **Workflow**: an immutable [`WorkflowDefinition`](workflow::WorkflowDefinition)
//!   of named nodes and dependency edges, validated acyclic at registration
//! - **Node**: one workflow step, mapped to at most one admitted job
//! - **Job**: a unit of work tracked in a [`JobStore`](store::JobStore) and
//!   executed by a [`Runner`](runner::Runner) backend
//! - **Queue**: priority admission with per-`(backend, cluster)` capacity
//!   and store-verified dependency gating
//! - **Scheduler**: the [`tick`](orchestrator::Orchestrator::tick)
//!   reconciliation pass, also runnable as a background task
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use flowsmith::config::RuntimeConfig;
//! use flowsmith::orchestrator::Orchestrator;
//! use flowsmith::store::InMemoryJobStore;
//! use flowsmith::types::RunnerKind;
//! use flowsmith::utils::testing::ScriptedRunner;
//! use flowsmith::workflow::{NodeSpec, WorkflowBuilder};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), flowsmith::orchestrator::OrchestratorError> {
//! let orchestrator = Orchestrator::new(
//!     Arc::new(InMemoryJobStore::new()),
//!     RuntimeConfig::default(),
//! );
//! orchestrator.add_runner(RunnerKind::Local, Arc::new(ScriptedRunner::new()));
//!
//! let definition = WorkflowBuilder::new("relax-then-analyze")
//!     .global("cutoff", json!(520))
//!     .node(NodeSpec::new("relax", "relax-structure", "vasp_relax"))
//!     .node(
//!         NodeSpec::new("analyze", "analyze-results", "analysis")
//!             .depends_on("relax")
//!             .param("energy", json!("${relax.energy}")),
//!     )
//!     .build();
//!
//! let workflow_id = orchestrator.register_workflow(definition)?;
//! orchestrator.start(&workflow_id).await?;
//! orchestrator.spawn_scheduler();
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`graph`] - Dependency graph storage, cycle detection, readiness math
//! - [`params`] - Sandboxed dot-path parameter resolution
//! - [`workflow`] - Definitions, builders, status state machines
//! - [`queue`] - Priority admission against per-backend capacity
//! - [`runner`] / [`store`] - The execution and persistence boundaries
//! - [`orchestrator`] - Public surface and the reconciliation loop
//! - [`event_bus`] - Lifecycle event fan-out to pluggable sinks
//! - [`telemetry`] - Event formatting and tracing setup

pub mod config;
pub mod event_bus;
pub mod graph;
pub mod orchestrator;
pub mod params;
pub mod queue;
pub mod runner;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;
pub mod workflow;
