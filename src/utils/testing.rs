//! Scripted test doubles for the runner boundary.
//!
//! [`ScriptedRunner`] is a deterministic in-process `Runner`: tests script
//! per-job behavior by job name (status sequences, submission failures,
//! result payloads) and the scheduler exercises the same code paths it
//! would against a real backend. Used by unit tests here and the
//! integration suite under `tests/`.

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::path::Path;

use crate::runner::{JobHandle, OutputStream, RetrievedResults, Runner, RunnerError, WorkSpec};
use crate::types::{JobId, JobStatus, RunnerKind};

#[derive(Default)]
struct Script {
    /// Statuses reported on successive polls; the last one repeats.
    statuses: VecDeque<JobStatus>,
    /// Remaining submissions to reject before accepting one.
    submission_failures: u32,
    /// Metrics returned by `retrieve_results`.
    results: Option<Value>,
    output_lines: Vec<String>,
}

#[derive(Default)]
struct ScriptedInner {
    scripts: FxHashMap<String, Script>,
    /// Every accepted submission, in order.
    submissions: Vec<(JobId, WorkSpec)>,
    /// job_id -> job_name for handle bookkeeping.
    names: FxHashMap<JobId, String>,
    cancelled: Vec<JobId>,
}

/// Deterministic, programmable `Runner` for tests.
#[derive(Default)]
pub struct ScriptedRunner {
    inner: Mutex<ScriptedInner>,
}

impl ScriptedRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `statuses` on successive polls of `job_name`; the final entry
    /// repeats forever. Unscripted jobs complete on the first poll.
    pub fn status_sequence(&self, job_name: &str, statuses: impl IntoIterator<Item = JobStatus>) {
        self.inner
            .lock()
            .scripts
            .entry(job_name.to_string())
            .or_default()
            .statuses = statuses.into_iter().collect();
    }

    /// Make every attempt of `job_name` fail immediately.
    pub fn always_fail(&self, job_name: &str) {
        self.status_sequence(job_name, [JobStatus::Failed]);
    }

    /// Reject the next `count` submissions of `job_name`.
    pub fn fail_submissions(&self, job_name: &str, count: u32) {
        self.inner
            .lock()
            .scripts
            .entry(job_name.to_string())
            .or_default()
            .submission_failures = count;
    }

    /// Metrics to return from `retrieve_results` for `job_name`.
    pub fn with_result(&self, job_name: &str, metrics: Value) {
        self.inner
            .lock()
            .scripts
            .entry(job_name.to_string())
            .or_default()
            .results = Some(metrics);
    }

    pub fn with_output(&self, job_name: &str, lines: impl IntoIterator<Item = String>) {
        self.inner
            .lock()
            .scripts
            .entry(job_name.to_string())
            .or_default()
            .output_lines = lines.into_iter().collect();
    }

    /// Number of accepted submissions so far (all jobs).
    #[must_use]
    pub fn submission_count(&self) -> usize {
        self.inner.lock().submissions.len()
    }

    /// Accepted submissions of one job name, in order.
    #[must_use]
    pub fn submissions_of(&self, job_name: &str) -> usize {
        self.inner
            .lock()
            .submissions
            .iter()
            .filter(|(_, spec)| spec.job_name == job_name)
            .count()
    }

    /// Job ids that received a cancel call.
    #[must_use]
    pub fn cancelled(&self) -> Vec<JobId> {
        self.inner.lock().cancelled.clone()
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn submit(&self, job_id: &JobId, spec: &WorkSpec) -> Result<JobHandle, RunnerError> {
        let mut inner = self.inner.lock();
        if let Some(script) = inner.scripts.get_mut(&spec.job_name) {
            if script.submission_failures > 0 {
                script.submission_failures -= 1;
                return Err(RunnerError::Submission {
                    job_id: job_id.clone(),
                    message: "scripted submission failure".to_string(),
                });
            }
        }
        inner.submissions.push((job_id.clone(), spec.clone()));
        inner.names.insert(job_id.clone(), spec.job_name.clone());
        Ok(JobHandle {
            job_id: job_id.clone(),
            backend_ref: format!("scripted-{}", inner.submissions.len()),
            runner: RunnerKind::Local,
        })
    }

    async fn get_status(&self, handle: &JobHandle) -> Result<JobStatus, RunnerError> {
        let mut inner = self.inner.lock();
        let name = inner.names.get(&handle.job_id).cloned().ok_or_else(|| {
            RunnerError::UnknownHandle {
                backend_ref: handle.backend_ref.clone(),
            }
        })?;
        let script = inner.scripts.entry(name).or_default();
        Ok(match script.statuses.len() {
            0 => JobStatus::Completed,
            1 => *script.statuses.front().expect("len checked"),
            _ => script.statuses.pop_front().expect("len checked"),
        })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), RunnerError> {
        self.inner.lock().cancelled.push(handle.job_id.clone());
        Ok(())
    }

    fn stream_output(&self, handle: &JobHandle) -> OutputStream {
        let inner = self.inner.lock();
        let lines = inner
            .names
            .get(&handle.job_id)
            .and_then(|name| inner.scripts.get(name))
            .map(|script| script.output_lines.clone())
            .unwrap_or_default();
        Box::pin(stream::iter(lines.into_iter().map(Ok)))
    }

    async fn retrieve_results(
        &self,
        handle: &JobHandle,
        _destination: Option<&Path>,
    ) -> Result<RetrievedResults, RunnerError> {
        let inner = self.inner.lock();
        let metrics = inner
            .names
            .get(&handle.job_id)
            .and_then(|name| inner.scripts.get(name))
            .and_then(|script| script.results.clone())
            .unwrap_or_else(|| json!({}));
        Ok(RetrievedResults {
            success: true,
            final_metrics: metrics,
            errors: Vec::new(),
            warnings: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::Map;

    fn spec(name: &str) -> WorkSpec {
        WorkSpec {
            job_name: name.to_string(),
            template: "tmpl".to_string(),
            parameters: Map::new(),
        }
    }

    #[tokio::test]
    async fn unscripted_jobs_complete_immediately() {
        let runner = ScriptedRunner::new();
        let handle = runner.submit(&"job-1".to_string(), &spec("a")).await.unwrap();
        assert_eq!(runner.get_status(&handle).await.unwrap(), JobStatus::Completed);
    }

    #[tokio::test]
    async fn status_sequences_advance_and_hold() {
        let runner = ScriptedRunner::new();
        runner.status_sequence("a", [JobStatus::Running, JobStatus::Unknown, JobStatus::Failed]);
        let handle = runner.submit(&"job-1".to_string(), &spec("a")).await.unwrap();
        assert_eq!(runner.get_status(&handle).await.unwrap(), JobStatus::Running);
        assert_eq!(runner.get_status(&handle).await.unwrap(), JobStatus::Unknown);
        assert_eq!(runner.get_status(&handle).await.unwrap(), JobStatus::Failed);
        assert_eq!(runner.get_status(&handle).await.unwrap(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn scripted_submission_failures_then_accept() {
        let runner = ScriptedRunner::new();
        runner.fail_submissions("a", 2);
        let id = "job-1".to_string();
        assert!(runner.submit(&id, &spec("a")).await.is_err());
        assert!(runner.submit(&id, &spec("a")).await.is_err());
        assert!(runner.submit(&id, &spec("a")).await.is_ok());
        assert_eq!(runner.submissions_of("a"), 1);
    }

    #[tokio::test]
    async fn output_streams_terminate() {
        let runner = ScriptedRunner::new();
        runner.with_output("a", ["line 1".to_string(), "line 2".to_string()]);
        let handle = runner.submit(&"job-1".to_string(), &spec("a")).await.unwrap();
        let lines: Vec<String> = runner
            .stream_output(&handle)
            .map(|line| line.unwrap())
            .collect()
            .await;
        assert_eq!(lines, vec!["line 1", "line 2"]);
    }
}
