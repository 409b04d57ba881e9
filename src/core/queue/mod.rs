pub mod worker;

#[cfg(test)]
mod tests;

pub use worker::{CancelRegistry, JobHandler, JobVerdict, WorkerPool, WorkerSettings};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::core::error::{JobError, JobErrorClass, RunFailure};
use crate::core::retry::backoff_delay;
use crate::core::store::{JobRecord, NewRun, Store, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Dead,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
            JobState::Dead => "dead",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            "retrying" => Some(JobState::Retrying),
            "dead" => Some(JobState::Dead),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Dead)
    }
}

pub fn can_transition(from: JobState, to: JobState) -> bool {
    match from {
        // Cancelling an unclaimed run fails its job without running it.
        JobState::Queued => matches!(to, JobState::Running | JobState::Failed),
        // Running -> Running is a reclaim after the visibility deadline lapsed.
        JobState::Running => matches!(
            to,
            JobState::Running
                | JobState::Succeeded
                | JobState::Failed
                | JobState::Retrying
                | JobState::Dead
        ),
        JobState::Retrying => matches!(to, JobState::Queued | JobState::Failed),
        JobState::Succeeded | JobState::Failed | JobState::Dead => false,
    }
}

/// What to do with a job whose attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Dead,
    Fail,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_backoff: Duration::from_millis(cfg.base_backoff_ms),
            max_backoff: Duration::from_millis(cfg.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// `attempts` counts claims so far, including the one that just failed.
    pub fn decide(&self, attempts: u32, class: JobErrorClass) -> RetryDecision {
        match class {
            JobErrorClass::Validation => RetryDecision::Fail,
            JobErrorClass::Transient if attempts >= self.max_attempts => RetryDecision::Dead,
            JobErrorClass::Transient => {
                RetryDecision::Retry(backoff_delay(attempts, self.base_backoff, self.max_backoff))
            }
        }
    }
}

/// Durable job queue over the store. Claims are transactional; a claimed job stays invisible
/// to other workers until its visibility deadline lapses.
#[derive(Clone)]
pub struct JobQueue {
    store: Store,
    policy: RetryPolicy,
    visibility: Duration,
    wakeup: Arc<Notify>,
}

impl JobQueue {
    pub fn new(store: Store, policy: RetryPolicy, visibility: Duration) -> Self {
        Self {
            store,
            policy,
            visibility,
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Persist the run together with its job and wake idle workers. Returns the job id.
    pub async fn enqueue(&self, run: &NewRun) -> Result<String> {
        let job_id = format!("job-{}", uuid::Uuid::new_v4().simple());
        self.store
            .create_run_with_job(run, &job_id, self.policy.max_attempts)
            .await?;
        info!("Queue: enqueued {} for run {}", job_id, run.run_id);
        self.wakeup.notify_waiters();
        Ok(job_id)
    }

    /// Resolves on the next enqueue. Registration happens when this is called, not when awaited.
    pub fn notified(&self) -> Notified<'_> {
        self.wakeup.notified()
    }

    pub async fn claim(&self, worker_id: &str) -> Result<Option<JobRecord>> {
        let outcome = self
            .store
            .claim_job(worker_id, self.visibility.as_millis() as i64)
            .await?;
        for job in &outcome.dead {
            warn!(
                "Queue: {} (run {}) abandoned on its final attempt, moved to dead",
                job.job_id, job.run_id
            );
        }
        if let Some(job) = &outcome.claimed {
            info!(
                "Queue: {} claimed {} (attempt {}/{})",
                worker_id, job.job_id, job.attempts, job.max_attempts
            );
        }
        Ok(outcome.claimed)
    }

    /// False means the claim was lost to another worker.
    pub async fn extend(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        self.store
            .extend_job(job_id, worker_id, self.visibility.as_millis() as i64)
            .await
    }

    pub async fn complete(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        self.store.complete_job(job_id, worker_id).await
    }

    /// Apply the retry policy to a failed attempt and return the state the job moved to.
    pub async fn fail(&self, job: &JobRecord, worker_id: &str, error: &JobError) -> Result<JobState> {
        let message = error.to_string();
        let state = match self.policy.decide(job.attempts, error.class) {
            RetryDecision::Fail => {
                self.store
                    .fail_job(&job.job_id, worker_id, &message, error.class.as_str())
                    .await?;
                JobState::Failed
            }
            RetryDecision::Dead => {
                let failure = RunFailure::JobDead {
                    attempts: job.attempts,
                    last: message.clone(),
                };
                self.store
                    .dead_letter_job(&job.job_id, worker_id, &failure.to_string())
                    .await?;
                JobState::Dead
            }
            RetryDecision::Retry(delay) => {
                self.store
                    .retry_job(
                        &job.job_id,
                        worker_id,
                        &message,
                        now_ms() + delay.as_millis() as i64,
                    )
                    .await?;
                self.wakeup.notify_waiters();
                JobState::Retrying
            }
        };
        warn!(
            "Queue: {} attempt {}/{} failed ({}): {}",
            job.job_id,
            job.attempts,
            job.max_attempts,
            state.as_str(),
            message
        );
        Ok(state)
    }

    /// Close a job whose run reached a terminal state other than completed. Never retried.
    pub async fn settle_unsuccessful(
        &self,
        job: &JobRecord,
        worker_id: &str,
        status: &str,
        reason: &str,
    ) -> Result<bool> {
        self.store
            .fail_job(&job.job_id, worker_id, &format!("run {}", status), reason)
            .await
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<JobRecord>> {
        self.store.get_job(job_id).await
    }

    pub async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRecord>> {
        self.store.list_jobs_by_state(state.as_str()).await
    }
}
