mod executor;


pub use executor::RunExecutor;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::queue::{CancelRegistry, JobQueue};
use crate::core::store::{JobRecord, NewRun, RunEventRecord, RunRecord, Store};
use crate::core::version::VersionStore;

/// Run statuses after which nothing changes.
pub fn is_terminal_status(status: &str) -> bool {
    matches!(status, "completed" | "failed" | "cancelled")
}

/// Provenance recorded on runs started by a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMeta {
    pub trigger_id: String,
    pub name: String,
    /// `schedule` or `event`.
    pub kind: String,
    pub fired_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Value>,
}

/// Everything known about a run: record, job, transcript and event log.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub run: RunRecord,
    pub job: Option<JobRecord>,
    pub turns: Vec<Value>,
    pub events: Vec<RunEventRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelOutcome {
    NotFound,
    AlreadyTerminal { status: String },
    /// No worker had picked the run up; it went straight to `cancelled`.
    CancelledBeforeStart,
    /// The executing worker observes the request at its next suspension point.
    Requested,
}

/// Submission, status and cancellation entry point shared by the API, CLI and triggers.
#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    versions: Arc<VersionStore>,
    queue: JobQueue,
    cancels: CancelRegistry,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        versions: Arc<VersionStore>,
        queue: JobQueue,
        cancels: CancelRegistry,
    ) -> Self {
        Self {
            store,
            versions,
            queue,
            cancels,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Accept a run for asynchronous execution and return its id.
    pub async fn submit_run(
        &self,
        version_id: &str,
        input: Value,
        trigger: Option<TriggerMeta>,
    ) -> Result<String> {
        if self.versions.get(version_id).await?.is_none() {
            return Err(anyhow!("unknown agent version '{}'", version_id));
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        let trigger_json = trigger.as_ref().map(serde_json::to_string).transpose()?;
        let run = NewRun {
            run_id: run_id.clone(),
            version_id: version_id.to_string(),
            input_json: serde_json::to_string(&input)?,
            trigger_id: trigger.as_ref().map(|t| t.trigger_id.clone()),
            trigger_json,
        };
        self.queue.enqueue(&run).await?;
        info!("Run [{}] submitted for version {}", run_id, version_id);
        Ok(run_id)
    }

    pub async fn run_status(&self, run_id: &str) -> Result<Option<RunView>> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(None);
        };
        let job = self.store.get_job_for_run(run_id).await?;
        let turns = self
            .store
            .list_turns(run_id)
            .await?
            .into_iter()
            .map(|t| serde_json::from_str(&t.turn_json).unwrap_or(Value::String(t.turn_json)))
            .collect();
        let events = self.store.list_run_events(run_id).await?;
        Ok(Some(RunView {
            run,
            job,
            turns,
            events,
        }))
    }

    /// Best-effort and asynchronous: the request is persisted, so a worker on any node sees it
    /// on its next heartbeat.
    pub async fn cancel_run(&self, run_id: &str) -> Result<CancelOutcome> {
        let Some(status) = self.store.request_cancel(run_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if is_terminal_status(&status) {
            return Ok(CancelOutcome::AlreadyTerminal { status });
        }
        if self.store.cancel_unclaimed_run(run_id).await? {
            self.store
                .append_run_event(run_id, "run_finished", &json!({ "status": "cancelled", "error_kind": "cancelled", "turns": 0 }))
                .await?;
            info!("Run [{}] cancelled before a worker claimed it", run_id);
            return Ok(CancelOutcome::CancelledBeforeStart);
        }
        if self.cancels.cancel(run_id) {
            info!("Run [{}] cancellation signalled to local worker", run_id);
        } else {
            info!("Run [{}] cancellation recorded", run_id);
        }
        Ok(CancelOutcome::Requested)
    }

    /// Poll until the run is terminal. Errors on timeout or if the run does not exist.
    pub async fn wait_for_terminal(&self, run_id: &str, timeout: Duration) -> Result<RunRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let Some(run) = self.store.get_run(run_id).await? else {
                return Err(anyhow!("run '{}' not found", run_id));
            };
            if is_terminal_status(&run.status) {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "run '{}' still {} after {}s",
                    run_id,
                    run.status,
                    timeout.as_secs()
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
