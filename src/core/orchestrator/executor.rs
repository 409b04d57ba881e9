use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::is_terminal_status;
use crate::core::agent_loop::{ConversationLoop, RunContext, RunOutcome};
use crate::core::error::JobError;
use crate::core::queue::{JobHandler, JobVerdict};
use crate::core::store::{JobRecord, Store};
use crate::core::version::VersionStore;

/// Bridges claimed jobs to the conversation loop.
pub struct RunExecutor {
    store: Store,
    versions: Arc<VersionStore>,
    looper: Arc<ConversationLoop>,
}

impl RunExecutor {
    pub fn new(store: Store, versions: Arc<VersionStore>, looper: Arc<ConversationLoop>) -> Self {
        Self {
            store,
            versions,
            looper,
        }
    }
}

#[async_trait]
impl JobHandler for RunExecutor {
    async fn handle(&self, job: &JobRecord, cancel: CancellationToken) -> Result<JobVerdict, JobError> {
        let Some(run) = self.store.get_run(&job.run_id).await? else {
            return Err(JobError::validation(anyhow!("run {} does not exist", job.run_id)));
        };

        // Redelivered after the run already finished: only the job needs closing.
        if is_terminal_status(&run.status) {
            info!("Run [{}] already {}; closing job {}", run.run_id, run.status, job.job_id);
            return Ok(JobVerdict::from(&RunOutcome::AlreadyTerminal {
                reason: run.error_kind.unwrap_or_else(|| run.status.clone()),
                status: run.status,
            }));
        }

        let Some(version) = self.versions.get(&run.version_id).await? else {
            return Err(JobError::validation(anyhow!(
                "agent version {} does not exist",
                run.version_id
            )));
        };
        let input: Value = serde_json::from_str(&run.input_json)
            .map_err(|e| JobError::validation(anyhow!("run input is not JSON: {}", e)))?;
        let trigger = run
            .trigger_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok());

        if run.cancel_requested {
            cancel.cancel();
        }

        let ctx = RunContext {
            run_id: run.run_id,
            job_id: Some(job.job_id.clone()),
            version,
            input,
            trigger,
            cancel,
        };
        let outcome = self.looper.run(ctx).await?;
        Ok(JobVerdict::from(&outcome))
    }
}
