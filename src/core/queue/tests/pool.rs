use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::error::JobError;
use crate::core::queue::{
    CancelRegistry, JobHandler, JobQueue, JobState, JobVerdict, RetryPolicy, WorkerPool,
    WorkerSettings,
};
use crate::core::store::{JobRecord, NewRun, Store, now_ms};

async fn queue(max_attempts: u32) -> JobQueue {
    let store = Store::open_in_memory().unwrap();
    store.insert_version("v1", "agent", "{}", now_ms()).await.unwrap();
    JobQueue::new(
        store,
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        },
        Duration::from_secs(30),
    )
}

fn new_run(id: &str) -> NewRun {
    NewRun {
        run_id: id.to_string(),
        version_id: "v1".to_string(),
        input_json: "null".to_string(),
        trigger_id: None,
        trigger_json: None,
    }
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        count: 2,
        poll_interval: Duration::from_millis(10),
        heartbeat_interval: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(1),
    }
}

async fn wait_for_state(queue: &JobQueue, job_id: &str, want: JobState) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = queue.get(job_id).await.unwrap().unwrap();
        if job.state == want.as_str() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {}",
            job_id,
            job.state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Fails transiently `failures` times, then succeeds.
struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(&self, _job: &JobRecord, _cancel: CancellationToken) -> Result<JobVerdict, JobError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            return Err(JobError::transient(anyhow!("database is locked")));
        }
        Ok(JobVerdict::Succeeded)
    }
}

struct PanickingHandler {
    calls: AtomicU32,
}

#[async_trait]
impl JobHandler for PanickingHandler {
    async fn handle(&self, _job: &JobRecord, _cancel: CancellationToken) -> Result<JobVerdict, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("worker bug")
    }
}

/// Runs until cancelled.
struct WaitForCancel;

#[async_trait]
impl JobHandler for WaitForCancel {
    async fn handle(&self, _job: &JobRecord, cancel: CancellationToken) -> Result<JobVerdict, JobError> {
        cancel.cancelled().await;
        Ok(JobVerdict::Unsuccessful {
            status: "cancelled".into(),
            reason: "cancelled".into(),
        })
    }
}

#[tokio::test]
async fn enqueue_claim_complete() {
    let q = queue(3).await;
    let job_id = q.enqueue(&new_run("r1")).await.unwrap();
    let job = q.claim("w1").await.unwrap().unwrap();
    assert_eq!(job.job_id, job_id);
    assert_eq!(job.attempts, 1);
    assert!(q.extend(&job_id, "w1").await.unwrap());
    assert!(q.complete(&job_id, "w1").await.unwrap());
    assert_eq!(q.list_by_state(JobState::Succeeded).await.unwrap().len(), 1);
    assert!(q.claim("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn transient_failures_never_exceed_max_attempts() {
    let q = queue(3).await;
    let job_id = q.enqueue(&new_run("r1")).await.unwrap();
    let mut claims = 0;
    let mut last = JobState::Queued;
    while let Some(job) = q.claim("w1").await.unwrap() {
        claims += 1;
        assert!(job.attempts <= job.max_attempts);
        last = q
            .fail(&job, "w1", &JobError::transient(anyhow!("connection reset")))
            .await
            .unwrap();
    }
    assert_eq!(claims, 3);
    assert_eq!(last, JobState::Dead);

    let job = q.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.state, "dead");
    assert_eq!(job.attempts, 3);
    let run = q.store().get_run("r1").await.unwrap().unwrap();
    assert_eq!(run.status, "failed");
    assert_eq!(run.error_kind.as_deref(), Some("job_infra_error"));
    let message = run.error_message.unwrap();
    assert!(message.starts_with("job abandoned after 3 attempt(s)"), "{}", message);
    assert!(message.contains("connection reset"));
}

#[tokio::test]
async fn validation_failures_skip_retries() {
    let q = queue(3).await;
    let job_id = q.enqueue(&new_run("r1")).await.unwrap();
    let job = q.claim("w1").await.unwrap().unwrap();
    let state = q
        .fail(&job, "w1", &JobError::validation(anyhow!("version missing")))
        .await
        .unwrap();
    assert_eq!(state, JobState::Failed);
    let job = q.get(&job_id).await.unwrap().unwrap();
    assert_eq!(job.error_class.as_deref(), Some("validation"));
    assert!(q.claim("w1").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_retries_transient_failures_until_success() {
    let q = queue(3).await;
    let handler = Arc::new(FlakyHandler {
        failures: 2,
        calls: AtomicU32::new(0),
    });
    let mut pool = WorkerPool::new(q.clone(), handler.clone(), CancelRegistry::new(), settings());
    pool.start();

    let job_id = q.enqueue(&new_run("r1")).await.unwrap();
    let job = wait_for_state(&q, &job_id, JobState::Succeeded).await;
    assert_eq!(job.attempts, 3);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_is_treated_as_transient() {
    let q = queue(2).await;
    let handler = Arc::new(PanickingHandler {
        calls: AtomicU32::new(0),
    });
    let mut pool = WorkerPool::new(q.clone(), handler.clone(), CancelRegistry::new(), settings());
    pool.start();

    let job_id = q.enqueue(&new_run("r1")).await.unwrap();
    let job = wait_for_state(&q, &job_id, JobState::Dead).await;
    assert_eq!(job.attempts, 2);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn heartbeat_propagates_persisted_cancellation() {
    let q = queue(3).await;
    let cancels = CancelRegistry::new();
    let mut pool = WorkerPool::new(q.clone(), Arc::new(WaitForCancel), cancels.clone(), settings());
    pool.start();

    let job_id = q.enqueue(&new_run("r1")).await.unwrap();
    wait_for_state(&q, &job_id, JobState::Running).await;
    q.store().request_cancel("r1").await.unwrap();

    let job = wait_for_state(&q, &job_id, JobState::Failed).await;
    assert_eq!(job.error_class.as_deref(), Some("cancelled"));
    assert!(cancels.active().is_empty());
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registry_cancels_a_running_job_directly() {
    let q = queue(3).await;
    let cancels = CancelRegistry::new();
    let mut pool = WorkerPool::new(q.clone(), Arc::new(WaitForCancel), cancels.clone(), settings());
    pool.start();

    let job_id = q.enqueue(&new_run("r1")).await.unwrap();
    wait_for_state(&q, &job_id, JobState::Running).await;
    // The token is registered right after the claim commits.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cancels.cancel("r1") {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    wait_for_state(&q, &job_id, JobState::Failed).await;
    assert!(!cancels.cancel("r1"));
    pool.shutdown().await;
}
