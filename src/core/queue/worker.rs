use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::JobQueue;
use crate::config::OrchestratorConfig;
use crate::core::agent_loop::RunOutcome;
use crate::core::error::JobError;
use crate::core::store::JobRecord;

/// How a job's run ended, as far as the queue is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum JobVerdict {
    Succeeded,
    /// The run reached a terminal state other than completed. The job is closed without retry.
    Unsuccessful { status: String, reason: String },
}

impl From<&RunOutcome> for JobVerdict {
    fn from(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed { .. } => JobVerdict::Succeeded,
            RunOutcome::Failed(failure) => JobVerdict::Unsuccessful {
                status: "failed".into(),
                reason: failure.reason_code().into(),
            },
            RunOutcome::Cancelled => JobVerdict::Unsuccessful {
                status: "cancelled".into(),
                reason: "cancelled".into(),
            },
            RunOutcome::AlreadyTerminal { status, .. } if status == "completed" => {
                JobVerdict::Succeeded
            }
            RunOutcome::AlreadyTerminal { status, reason } => JobVerdict::Unsuccessful {
                status: status.clone(),
                reason: reason.clone(),
            },
        }
    }
}

/// Executes the run behind a claimed job. `Err` is an infrastructure failure and goes through
/// the retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &JobRecord, cancel: CancellationToken) -> Result<JobVerdict, JobError>;
}

/// In-process cancellation tokens of runs currently executing on this node.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(&self, run_id: &str, token: CancellationToken) {
        self.lock().insert(run_id.to_string(), token);
    }

    pub fn remove(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    /// True when the run was executing here and its token got cancelled.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.lock().get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub count: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
}

impl From<&OrchestratorConfig> for WorkerSettings {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            count: cfg.worker.count.max(1),
            poll_interval: cfg.poll_interval(),
            heartbeat_interval: cfg.heartbeat_interval(),
            shutdown_grace: Duration::from_secs(cfg.worker.shutdown_grace_secs),
        }
    }
}

struct Shared {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    cancels: CancelRegistry,
    settings: WorkerSettings,
}

/// Fixed set of workers pulling jobs off the queue, one run at a time each.
pub struct WorkerPool {
    shared: Arc<Shared>,
    stop: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        handler: Arc<dyn JobHandler>,
        cancels: CancelRegistry,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue,
                handler,
                cancels,
                settings,
            }),
            stop: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let node = uuid::Uuid::new_v4().simple().to_string();
        for i in 0..self.shared.settings.count {
            let worker_id = format!("worker-{}-{}", &node[..8], i + 1);
            let shared = self.shared.clone();
            let stop = self.stop.clone();
            let span = info_span!("worker", worker_id = %worker_id);
            self.workers
                .push(tokio::spawn(worker_loop(shared, worker_id, stop).instrument(span)));
        }
        info!("Worker pool started with {} worker(s)", self.workers.len());
    }

    /// Stop claiming, give in-flight runs the grace period, then abandon them. Abandoned jobs
    /// are reclaimed once their visibility deadline lapses.
    pub async fn shutdown(&mut self) {
        self.stop.cancel();
        let grace = self.shared.settings.shutdown_grace;
        for mut handle in self.workers.drain(..) {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Worker did not stop within {}s; aborting", grace.as_secs());
                handle.abort();
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(shared: Arc<Shared>, worker_id: String, stop: CancellationToken) {
    let poll = shared.settings.poll_interval;
    while !stop.is_cancelled() {
        // Registered before claiming so an enqueue racing the claim still wakes us.
        let wakeup = shared.queue.notified();
        match shared.queue.claim(&worker_id).await {
            Ok(Some(job)) => {
                process(&shared, &worker_id, job).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => error!("Claim failed: {}", e),
        }
        tokio::select! {
            _ = wakeup => {}
            _ = tokio::time::sleep(poll) => {}
            _ = stop.cancelled() => break,
        }
    }
    debug!("Worker {} exiting", worker_id);
}

async fn process(shared: &Arc<Shared>, worker_id: &str, job: JobRecord) {
    let cancel = CancellationToken::new();
    shared.cancels.register(&job.run_id, cancel.clone());

    let lost = Arc::new(AtomicBool::new(false));
    let heartbeat_stop = CancellationToken::new();
    let heartbeat = tokio::spawn(heartbeat(
        shared.queue.clone(),
        job.clone(),
        worker_id.to_string(),
        shared.settings.heartbeat_interval,
        cancel.clone(),
        lost.clone(),
        heartbeat_stop.clone(),
    ));

    let handler = shared.handler.clone();
    let task_job = job.clone();
    let task_cancel = cancel.clone();
    let joined = tokio::spawn(async move { handler.handle(&task_job, task_cancel).await }).await;
    let result = match joined {
        Ok(result) => result,
        Err(e) => Err(JobError::transient(anyhow!("job handler panicked: {}", e))),
    };

    heartbeat_stop.cancel();
    let _ = heartbeat.await;
    shared.cancels.remove(&job.run_id);

    if lost.load(Ordering::SeqCst) {
        warn!(
            "Job {} was reclaimed by another worker; dropping this attempt's outcome",
            job.job_id
        );
        return;
    }

    let settled = match result {
        Ok(JobVerdict::Succeeded) => shared.queue.complete(&job.job_id, worker_id).await.map(|_| ()),
        Ok(JobVerdict::Unsuccessful { status, reason }) => shared
            .queue
            .settle_unsuccessful(&job, worker_id, &status, &reason)
            .await
            .map(|_| ()),
        Err(e) => shared.queue.fail(&job, worker_id, &e).await.map(|_| ()),
    };
    if let Err(e) = settled {
        // The visibility deadline will lapse and another worker retries the job.
        error!("Failed to record outcome of job {}: {}", job.job_id, e);
    }
}

/// Keeps the claim alive and mirrors persisted cancellation requests into the run's token.
async fn heartbeat(
    queue: JobQueue,
    job: JobRecord,
    worker_id: String,
    interval: Duration,
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    loop {
        match queue.store().is_cancel_requested(&job.run_id).await {
            Ok(true) if !cancel.is_cancelled() => {
                info!("Run [{}]: cancellation requested", job.run_id);
                cancel.cancel();
            }
            Ok(_) => {}
            Err(e) => warn!("Cancel check for run {} failed: {}", job.run_id, e),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.cancelled() => return,
        }

        match queue.extend(&job.job_id, &worker_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Job {}: claim lost while run {} is executing", job.job_id, job.run_id);
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => warn!("Heartbeat for job {} failed: {}", job.job_id, e),
        }
    }
}
