use anyhow::{Result, anyhow};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{CancelPreviousMode, FireOutcome, NewTrigger, OverlapPolicy, Trigger, TriggerKind};
use crate::core::orchestrator::{CancelOutcome, Orchestrator, TriggerMeta};
use crate::core::store::{FireRecord, now_ms};

struct Inner {
    orchestrator: Orchestrator,
    mode: CancelPreviousMode,
    cron: Mutex<Option<JobScheduler>>,
    cron_jobs: Mutex<HashMap<String, Uuid>>,
    /// One evaluation at a time per trigger so overlap checks see each other's runs.
    fire_locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Turns schedules and incoming events into run submissions under each trigger's overlap policy.
#[derive(Clone)]
pub struct TriggerScheduler {
    inner: Arc<Inner>,
}

impl TriggerScheduler {
    pub fn new(orchestrator: Orchestrator, mode: CancelPreviousMode) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                mode,
                cron: Mutex::new(None),
                cron_jobs: Mutex::new(HashMap::new()),
                fire_locks: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn register(&self, new: NewTrigger) -> Result<Trigger> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(anyhow!("trigger name is required"));
        }
        match &new.kind {
            TriggerKind::Schedule { cron } => {
                Job::new_async(cron.as_str(), |_uuid, _l| Box::pin(async {}))
                    .map_err(|e| anyhow!("invalid cron expression '{}': {}", cron, e))?;
            }
            TriggerKind::Event { source, .. } if source.trim().is_empty() => {
                return Err(anyhow!("event triggers need a source"));
            }
            TriggerKind::Event { .. } => {}
        }
        if self
            .inner
            .orchestrator
            .versions()
            .get(&new.version_id)
            .await?
            .is_none()
        {
            return Err(anyhow!("unknown agent version '{}'", new.version_id));
        }

        let trigger = Trigger {
            trigger_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind: new.kind,
            version_id: new.version_id,
            overlap: new.overlap,
            input: new.input,
            enabled: new.enabled,
            created_at: now_ms(),
        };
        self.store().upsert_trigger(&trigger.to_record()?).await?;
        if trigger.enabled {
            self.schedule(&trigger).await?;
        }
        info!(
            "Trigger [{}] registered ({} / {})",
            trigger.name,
            trigger.kind.as_str(),
            trigger.overlap.as_str()
        );
        Ok(trigger)
    }

    pub async fn remove(&self, trigger_id: &str) -> Result<bool> {
        self.unschedule(trigger_id).await;
        let removed = self.store().delete_trigger(trigger_id).await?;
        if removed {
            info!("Trigger {} removed", trigger_id);
        }
        Ok(removed)
    }

    pub async fn get(&self, trigger_id: &str) -> Result<Option<Trigger>> {
        self.store()
            .get_trigger(trigger_id)
            .await?
            .map(Trigger::from_record)
            .transpose()
    }

    pub async fn list(&self) -> Result<Vec<Trigger>> {
        self.store()
            .list_triggers()
            .await?
            .into_iter()
            .map(Trigger::from_record)
            .collect()
    }

    pub async fn fires(&self, trigger_id: &str) -> Result<Vec<FireRecord>> {
        self.store().list_fires(trigger_id).await
    }

    /// Evaluate one trigger now. `event` is the payload for event triggers.
    pub async fn fire(&self, trigger_id: &str, event: Option<Value>) -> Result<FireOutcome> {
        let Some(trigger) = self.get(trigger_id).await? else {
            return Err(anyhow!("trigger '{}' not found", trigger_id));
        };
        let lock = self.fire_lock(trigger_id);
        let _guard = lock.lock().await;

        let outcome = if !trigger.enabled {
            FireOutcome::Dropped {
                reason: "trigger disabled".into(),
            }
        } else {
            self.apply_overlap(&trigger, event).await?
        };

        let detail = match &outcome {
            FireOutcome::Dropped { reason } => Some(reason.clone()),
            FireOutcome::CancelledPrevious { cancelled, .. } => Some(cancelled.join(",")),
            FireOutcome::Enqueued { .. } => None,
        };
        self.store()
            .record_fire(trigger_id, outcome.run_id(), outcome.as_str(), detail.as_deref())
            .await?;
        info!("Trigger [{}] fired: {}", trigger.name, outcome.as_str());
        Ok(outcome)
    }

    /// Fire every enabled event trigger listening on `source` whose filter accepts `payload`.
    /// A failing trigger is logged and does not stop the others.
    pub async fn fire_event(&self, source: &str, payload: Value) -> Result<Vec<(String, FireOutcome)>> {
        let mut fired = Vec::new();
        for trigger in self.list().await? {
            let TriggerKind::Event {
                source: listens_on,
                filter,
            } = &trigger.kind
            else {
                continue;
            };
            if !trigger.enabled || listens_on != source {
                continue;
            }
            if let Some(filter) = filter
                && !filter.matches(&payload)
            {
                continue;
            }
            match self.fire(&trigger.trigger_id, Some(payload.clone())).await {
                Ok(outcome) => fired.push((trigger.trigger_id.clone(), outcome)),
                Err(e) => error!("Trigger [{}] failed on event from {}: {}", trigger.name, source, e),
            }
        }
        Ok(fired)
    }

    /// Start the cron clock with every enabled schedule trigger.
    pub async fn start(&self) -> Result<()> {
        {
            let mut cron = self.inner.cron.lock().await;
            if cron.is_some() {
                return Ok(());
            }
            let scheduler = JobScheduler::new().await?;
            scheduler.start().await?;
            *cron = Some(scheduler);
        }
        let mut scheduled = 0;
        for trigger in self.list().await? {
            if trigger.enabled && matches!(trigger.kind, TriggerKind::Schedule { .. }) {
                match self.schedule(&trigger).await {
                    Ok(()) => scheduled += 1,
                    Err(e) => error!("Failed to schedule trigger [{}]: {}", trigger.name, e),
                }
            }
        }
        info!("Trigger scheduler started with {} schedule(s)", scheduled);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.inner.cron_jobs.lock().await.clear();
        if let Some(mut scheduler) = self.inner.cron.lock().await.take()
            && let Err(e) = scheduler.shutdown().await
        {
            warn!("Cron scheduler shutdown error: {}", e);
        }
    }

    fn store(&self) -> &crate::core::store::Store {
        self.inner.orchestrator.store()
    }

    fn fire_lock(&self, trigger_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .fire_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        locks
            .entry(trigger_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn apply_overlap(&self, trigger: &Trigger, event: Option<Value>) -> Result<FireOutcome> {
        let orchestrator = &self.inner.orchestrator;
        let active = self
            .store()
            .list_active_runs_for_trigger(&trigger.trigger_id)
            .await?;
        let meta = TriggerMeta {
            trigger_id: trigger.trigger_id.clone(),
            name: trigger.name.clone(),
            kind: trigger.kind.as_str().to_string(),
            fired_at: now_ms(),
            event,
        };

        match trigger.overlap {
            OverlapPolicy::Skip if !active.is_empty() => Ok(FireOutcome::Dropped {
                reason: format!("run {} still active", active[0]),
            }),
            OverlapPolicy::Skip | OverlapPolicy::Queue => {
                let run_id = orchestrator
                    .submit_run(&trigger.version_id, trigger.input.clone(), Some(meta))
                    .await?;
                Ok(FireOutcome::Enqueued { run_id })
            }
            OverlapPolicy::CancelPrevious => {
                let mut cancelled = Vec::new();
                for run_id in &active {
                    match orchestrator.cancel_run(run_id).await? {
                        CancelOutcome::NotFound | CancelOutcome::AlreadyTerminal { .. } => {}
                        CancelOutcome::CancelledBeforeStart | CancelOutcome::Requested => {
                            cancelled.push(run_id.clone())
                        }
                    }
                }
                if let CancelPreviousMode::AwaitTermination { timeout } = self.inner.mode {
                    for run_id in &cancelled {
                        if let Err(e) = orchestrator.wait_for_terminal(run_id, timeout).await {
                            warn!(
                                "Trigger [{}]: previous run did not stop in time, starting anyway: {}",
                                trigger.name, e
                            );
                        }
                    }
                }
                let run_id = orchestrator
                    .submit_run(&trigger.version_id, trigger.input.clone(), Some(meta))
                    .await?;
                if cancelled.is_empty() {
                    Ok(FireOutcome::Enqueued { run_id })
                } else {
                    Ok(FireOutcome::CancelledPrevious { run_id, cancelled })
                }
            }
        }
    }

    async fn schedule(&self, trigger: &Trigger) -> Result<()> {
        let TriggerKind::Schedule { cron } = &trigger.kind else {
            return Ok(());
        };
        let mut scheduler_guard = self.inner.cron.lock().await;
        let Some(scheduler) = scheduler_guard.as_mut() else {
            // Not started yet; `start` picks it up.
            return Ok(());
        };

        let this = self.clone();
        let trigger_id = trigger.trigger_id.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let this = this.clone();
            let trigger_id = trigger_id.clone();
            Box::pin(async move {
                if let Err(e) = this.fire(&trigger_id, None).await {
                    error!("Scheduled fire of trigger {} failed: {}", trigger_id, e);
                }
            })
        })?;
        let job_id = scheduler.add(job).await?;
        drop(scheduler_guard);

        if let Some(previous) = self
            .inner
            .cron_jobs
            .lock()
            .await
            .insert(trigger.trigger_id.clone(), job_id)
        {
            self.remove_cron_job(previous).await;
        }
        Ok(())
    }

    async fn unschedule(&self, trigger_id: &str) {
        let job_id = self.inner.cron_jobs.lock().await.remove(trigger_id);
        if let Some(job_id) = job_id {
            self.remove_cron_job(job_id).await;
        }
    }

    async fn remove_cron_job(&self, job_id: Uuid) {
        if let Some(scheduler) = self.inner.cron.lock().await.as_ref()
            && let Err(e) = scheduler.remove(&job_id).await
        {
            warn!("Failed to remove cron job {}: {}", job_id, e);
        }
    }
}
