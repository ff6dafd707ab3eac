//! Persistent job-record boundary.
//!
//! [`JobStore`] is the single source of truth across restarts: the
//! orchestrator's in-memory state is a cache reconstructable from a
//! registered definition plus one batch status read. The trait exposes only
//! the operations the core needs — create/read, one-round-trip batch status
//! read, and status/result updates. Schema and migration mechanics belong
//! to the implementing crate; the core treats store errors as transient and
//! retries on the next reconciliation pass.
//!
//! [`InMemoryJobStore`] is the in-tree reference implementation, used by
//! tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::runner::WorkSpec;
use crate::types::{JobId, JobStatus, NodeId, RunnerKind, WorkflowId};
use crate::utils::id_generator::IdGenerator;

/// Everything needed to create a job record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    pub runner: RunnerKind,
    pub cluster: Option<String>,
    pub work: WorkSpec,
    /// Owning workflow, when the job was admitted by the orchestrator.
    pub workflow_id: Option<WorkflowId>,
    pub node_id: Option<NodeId>,
}

/// One persisted job record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub results: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Store-level failures, distinct from backend errors. All variants are
/// treated as transient by the scheduler: the failing pass is abandoned and
/// retried on the next tick.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("job not found: {job_id}")]
    #[diagnostic(code(flowsmith::store::job_not_found))]
    JobNotFound { job_id: JobId },

    #[error("job store unavailable: {message}")]
    #[diagnostic(
        code(flowsmith::store::unavailable),
        help("The store is unreachable or mid-migration; the operation will be retried.")
    )]
    Unavailable { message: String },

    #[error(transparent)]
    #[diagnostic(code(flowsmith::store::serde))]
    Serde(#[from] serde_json::Error),
}

/// Persistent job records with atomic create/update and a single-round-trip
/// batch status read.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, spec: JobSpec) -> Result<JobId, StoreError>;

    async fn get_job(&self, job_id: &JobId) -> Result<JobRecord, StoreError>;

    /// Statuses for every id the store knows about, in one round trip.
    /// Unknown ids are simply absent from the returned map.
    async fn get_job_statuses_batch(
        &self,
        job_ids: &[JobId],
    ) -> Result<FxHashMap<JobId, JobStatus>, StoreError>;

    async fn update_status(&self, job_id: &JobId, status: JobStatus) -> Result<(), StoreError>;

    async fn update_results(&self, job_id: &JobId, results: Value) -> Result<(), StoreError>;
}

/// Volatile store for tests and single-process use.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<FxHashMap<JobId, JobRecord>>,
    ids: IdGenerator,
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records, for assertions and debugging.
    #[must_use]
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.jobs.lock().values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, spec: JobSpec) -> Result<JobId, StoreError> {
        let job_id = self.ids.job_id();
        let now = Utc::now();
        let record = JobRecord {
            job_id: job_id.clone(),
            spec,
            status: JobStatus::Pending,
            results: None,
            created_at: now,
            updated_at: now,
        };
        self.jobs.lock().insert(job_id.clone(), record);
        Ok(job_id)
    }

    async fn get_job(&self, job_id: &JobId) -> Result<JobRecord, StoreError> {
        self.jobs
            .lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound {
                job_id: job_id.clone(),
            })
    }

    async fn get_job_statuses_batch(
        &self,
        job_ids: &[JobId],
    ) -> Result<FxHashMap<JobId, JobStatus>, StoreError> {
        let jobs = self.jobs.lock();
        Ok(job_ids
            .iter()
            .filter_map(|id| jobs.get(id).map(|record| (id.clone(), record.status)))
            .collect())
    }

    async fn update_status(&self, job_id: &JobId, status: JobStatus) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        let record = jobs.get_mut(job_id).ok_or_else(|| StoreError::JobNotFound {
            job_id: job_id.clone(),
        })?;
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn update_results(&self, job_id: &JobId, results: Value) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        let record = jobs.get_mut(job_id).ok_or_else(|| StoreError::JobNotFound {
            job_id: job_id.clone(),
        })?;
        record.results = Some(results);
        record.updated_at = Utc::now();
        Ok(())
    }
}
