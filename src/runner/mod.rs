//! Execution backend boundary.
//!
//! [`Runner`] abstracts over whatever actually executes a job: a local
//! process, an SSH-reachable host, or a batch scheduler. The core only ever
//! talks to this trait; concrete transports live in downstream crates. The
//! contract the scheduler relies on:
//!
//! - `submit` either returns a durable [`JobHandle`] or fails with a
//!   submission error that is routed through the node's failure policy;
//! - `get_status` may legitimately answer [`JobStatus::Unknown`]; the
//!   scheduler retries observation on the next pass instead of guessing;
//! - `cancel` is best-effort and never awaited for acknowledgment;
//! - `stream_output` is lazy and terminates once the backend reports a
//!   terminal status.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

use crate::types::{JobId, JobStatus, RunnerKind};

/// Everything a backend needs to execute one job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkSpec {
    pub job_name: String,
    pub template: String,
    pub parameters: Map<String, Value>,
}

/// Durable reference to a submitted job on a specific backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    /// Backend-native identifier (pid, batch job number, remote token).
    pub backend_ref: String,
    pub runner: RunnerKind,
}

/// Outcome of pulling a finished job's artifacts back from the backend.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetrievedResults {
    pub success: bool,
    /// Final metrics extracted from the job's outputs.
    pub final_metrics: Value,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Lazy line stream of a job's output.
pub type OutputStream = BoxStream<'static, Result<String, RunnerError>>;

/// Backend-level failures, distinct from store/infrastructure errors.
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error("submission of job {job_id} failed: {message}")]
    #[diagnostic(
        code(flowsmith::runner::submission),
        help("The backend rejected the job; check its work spec and backend health.")
    )]
    Submission { job_id: JobId, message: String },

    #[error("connection to backend failed: {message}")]
    #[diagnostic(code(flowsmith::runner::connection))]
    Connection { message: String },

    #[error("no job known for handle {backend_ref}")]
    #[diagnostic(code(flowsmith::runner::unknown_handle))]
    UnknownHandle { backend_ref: String },

    #[error("result retrieval for job {job_id} failed: {message}")]
    #[diagnostic(code(flowsmith::runner::retrieval))]
    Retrieval { job_id: JobId, message: String },
}

/// Abstract execution backend.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Hand a job to the backend. Returns a handle usable for status,
    /// cancellation, output streaming, and result retrieval.
    async fn submit(&self, job_id: &JobId, spec: &WorkSpec) -> Result<JobHandle, RunnerError>;

    /// Observe the backend's view of a job. `Unknown` is a valid,
    /// non-terminal answer.
    async fn get_status(&self, handle: &JobHandle) -> Result<JobStatus, RunnerError>;

    /// Best-effort cancellation; an `Ok` return does not guarantee the job
    /// stopped.
    async fn cancel(&self, handle: &JobHandle) -> Result<(), RunnerError>;

    /// Lazily stream the job's output lines. The stream ends when the
    /// backend reports a terminal status.
    fn stream_output(&self, handle: &JobHandle) -> OutputStream;

    /// Pull results back, optionally into `destination`. `None` leaves
    /// artifacts wherever the backend keeps them.
    async fn retrieve_results(
        &self,
        handle: &JobHandle,
        destination: Option<&Path>,
    ) -> Result<RetrievedResults, RunnerError>;
}
