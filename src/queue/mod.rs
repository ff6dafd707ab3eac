//! Priority-ordered admission control between ready jobs and finite
//! per-backend capacity.
//!
//! [`QueueManager`] is deliberately ignorant of workflow semantics: it sees
//! job ids, dependency sets over job ids, priorities, and `(runner,
//! cluster)` capacity slots. Dependency gating is re-verified against the
//! store at admission time even though the orchestrator only enqueues ready
//! nodes — the queue defends against an upstream bug, not just caller
//! trust.
//!
//! Locking discipline: the internal mutex is never held across the store's
//! batch status read. Each pass snapshots candidates under the lock,
//! performs the single batched I/O with the lock dropped, then re-acquires
//! to decide and admit. Terminal statuses are monotone, so a status
//! observed as completed cannot regress between the read and the decision.

use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::QueueConfig;
use crate::graph::{CircularDependencyError, DependencyGraph};
use crate::store::{JobStore, StoreError};
use crate::types::{JobId, JobStatus, Priority, RunnerKind};

/// Admission-time rejections and queue-level caller errors.
#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    #[error("job {job_id} depends on unknown job {dependency}")]
    #[diagnostic(
        code(flowsmith::queue::unknown_dependency),
        help("Dependencies must reference jobs that are queued or already recorded in the store.")
    )]
    UnknownDependency { job_id: JobId, dependency: JobId },

    #[error("job {job_id} is already queued")]
    #[diagnostic(code(flowsmith::queue::duplicate_job))]
    DuplicateJob { job_id: JobId },

    /// The incoming dependency set closes a cycle with jobs already queued.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Circular(#[from] CircularDependencyError),

    #[error("job not found in queue: {job_id}")]
    #[diagnostic(code(flowsmith::queue::job_not_found))]
    JobNotFound { job_id: JobId },

    #[error("job {job_id} is {status}, not pending")]
    #[diagnostic(code(flowsmith::queue::not_pending))]
    NotPending { job_id: JobId, status: JobStatus },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

/// One queued unit of work, owned by the queue from enqueue until terminal
/// cleanup.
#[derive(Clone, Debug)]
pub struct QueuedJob {
    pub job_id: JobId,
    pub dependencies: FxHashSet<JobId>,
    pub priority: Priority,
    pub status: JobStatus,
    pub runner: RunnerKind,
    pub cluster: Option<String>,
    /// Admission gate flipped by pause/resume; checked synchronously by
    /// `schedule`.
    pub suspended: bool,
    seq: u64,
}

type SlotKey = (RunnerKind, Option<String>);

#[derive(Default)]
struct QueueInner {
    jobs: FxHashMap<JobId, QueuedJob>,
    running: FxHashMap<SlotKey, usize>,
    next_seq: u64,
}

impl QueueInner {
    fn release_slot(&mut self, key: &SlotKey) {
        if let Some(count) = self.running.get_mut(key) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Priority queue with dependency gating and per-slot capacity.
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    inner: Mutex<QueueInner>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Admit a job into the pending set.
    ///
    /// Rejects duplicates, dependencies that are neither queued nor in the
    /// store, and dependency sets that close a cycle with already-queued
    /// jobs.
    #[instrument(skip(self, dependencies), fields(job_id = %job_id))]
    pub async fn enqueue(
        &self,
        job_id: JobId,
        dependencies: FxHashSet<JobId>,
        priority: Priority,
        runner: RunnerKind,
        cluster: Option<String>,
    ) -> Result<(), QueueError> {
        // Store lookup happens before taking the lock; jobs are never
        // deleted from the store, so the answer cannot go stale.
        let dep_ids: Vec<JobId> = dependencies.iter().cloned().collect();
        let known = self.store.get_job_statuses_batch(&dep_ids).await?;

        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job_id) {
            return Err(QueueError::DuplicateJob { job_id });
        }
        for dep in &dependencies {
            if !known.contains_key(dep) && !inner.jobs.contains_key(dep) {
                return Err(QueueError::UnknownDependency {
                    job_id,
                    dependency: dep.clone(),
                });
            }
        }

        // Cycle check over the combined edge set: everything queued plus
        // the incoming job.
        let mut graph: DependencyGraph<JobId> = DependencyGraph::new();
        for job in inner.jobs.values() {
            for dep in &job.dependencies {
                graph.add_dependency(job.job_id.clone(), dep.clone());
            }
        }
        for dep in &dependencies {
            graph.add_dependency(job_id.clone(), dep.clone());
        }
        graph.validate()?;

        let seq = inner.next_seq;
        inner.next_seq += 1;
        debug!(priority, seq, "job enqueued");
        inner.jobs.insert(
            job_id.clone(),
            QueuedJob {
                job_id,
                dependencies,
                priority,
                status: JobStatus::Pending,
                runner,
                cluster,
                suspended: false,
                seq,
            },
        );
        Ok(())
    }

    /// One admission pass: returns the job ids moved to `Running`, ordered
    /// by priority (FIFO within equal priority), bounded by per-slot
    /// capacity.
    #[instrument(skip(self))]
    pub async fn schedule(&self) -> Result<Vec<JobId>, QueueError> {
        // Snapshot candidates and their dependency ids under the lock.
        let dep_ids: Vec<JobId> = {
            let inner = self.inner.lock();
            let mut ids: FxHashSet<JobId> = FxHashSet::default();
            for job in inner.jobs.values() {
                if job.status == JobStatus::Pending && !job.suspended {
                    ids.extend(job.dependencies.iter().cloned());
                }
            }
            ids.into_iter().collect()
        };

        // One batched status lookup per pass, lock released.
        let statuses = if dep_ids.is_empty() {
            FxHashMap::default()
        } else {
            self.store.get_job_statuses_batch(&dep_ids).await?
        };

        // Decide and admit under a fresh acquisition.
        let mut inner = self.inner.lock();
        let mut candidates: Vec<(Priority, u64, JobId)> = inner
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && !job.suspended)
            .filter(|job| {
                job.dependencies
                    .iter()
                    .all(|dep| statuses.get(dep) == Some(&JobStatus::Completed))
            })
            .map(|job| (job.priority, job.seq, job.job_id.clone()))
            .collect();
        // Highest priority first; FIFO by sequence within a priority.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut admitted = Vec::new();
        for (_, _, job_id) in candidates {
            let (key, capacity) = {
                let job = inner.jobs.get(&job_id).expect("snapshotted above");
                let capacity = self.config.capacity_for(job.runner, job.cluster.as_deref());
                ((job.runner, job.cluster.clone()), capacity)
            };
            let used = inner.running.get(&key).copied().unwrap_or(0);
            if used >= capacity {
                continue;
            }
            *inner.running.entry(key).or_insert(0) += 1;
            let job = inner.jobs.get_mut(&job_id).expect("snapshotted above");
            job.status = JobStatus::Running;
            admitted.push(job_id);
        }
        if !admitted.is_empty() {
            debug!(count = admitted.len(), "jobs admitted");
        }
        Ok(admitted)
    }

    /// Remove a pending job before admission.
    pub fn dequeue(&self, job_id: &JobId) -> Result<QueuedJob, QueueError> {
        let mut inner = self.inner.lock();
        match inner.jobs.get(job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                Ok(inner.jobs.remove(job_id).expect("checked above"))
            }
            Some(job) => Err(QueueError::NotPending {
                job_id: job_id.clone(),
                status: job.status,
            }),
            None => Err(QueueError::JobNotFound {
                job_id: job_id.clone(),
            }),
        }
    }

    /// Mark a job cancelled, freeing its capacity slot if it was running.
    pub fn cancel(&self, job_id: &JobId) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(job_id).ok_or_else(|| QueueError::JobNotFound {
            job_id: job_id.clone(),
        })?;
        let was_running = job.status == JobStatus::Running;
        let key = (job.runner, job.cluster.clone());
        job.status = JobStatus::Cancelled;
        if was_running {
            inner.release_slot(&key);
        }
        Ok(())
    }

    /// Record a terminal status observed for an admitted job, freeing its
    /// capacity slot.
    pub fn mark_terminal(&self, job_id: &JobId, status: JobStatus) {
        debug_assert!(status.is_terminal());
        let mut inner = self.inner.lock();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            let was_running = job.status == JobStatus::Running;
            let key = (job.runner, job.cluster.clone());
            job.status = status;
            if was_running {
                inner.release_slot(&key);
            }
        }
    }

    pub fn get_status(&self, job_id: &JobId) -> Result<JobStatus, QueueError> {
        self.inner
            .lock()
            .jobs
            .get(job_id)
            .map(|job| job.status)
            .ok_or_else(|| QueueError::JobNotFound {
                job_id: job_id.clone(),
            })
    }

    pub fn set_priority(&self, job_id: &JobId, priority: Priority) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let job = inner.jobs.get_mut(job_id).ok_or_else(|| QueueError::JobNotFound {
            job_id: job_id.clone(),
        })?;
        job.priority = priority;
        Ok(())
    }

    /// Flip the admission gate for a set of jobs (pause/resume support).
    pub fn set_suspended(&self, job_ids: &[JobId], suspended: bool) {
        let mut inner = self.inner.lock();
        for job_id in job_ids {
            if let Some(job) = inner.jobs.get_mut(job_id) {
                job.suspended = suspended;
            }
        }
    }

    /// Drop all terminal jobs from the queue's bookkeeping.
    pub fn cleanup_terminal(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.jobs.len();
        inner.jobs.retain(|_, job| !job.status.is_terminal());
        before - inner.jobs.len()
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .count()
    }

    #[must_use]
    pub fn running_len(&self) -> usize {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .count()
    }
}
