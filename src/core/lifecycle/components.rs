use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::LifecycleComponent;
use crate::core::queue::WorkerPool;
use crate::core::sandbox::SandboxManager;
use crate::core::triggers::TriggerScheduler;

pub struct WorkerPoolComponent {
    pool: WorkerPool,
}

impl WorkerPoolComponent {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for WorkerPoolComponent {
    fn name(&self) -> &'static str {
        "worker-pool"
    }
    async fn on_start(&mut self) -> Result<()> {
        self.pool.start();
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        self.pool.shutdown().await;
        Ok(())
    }
}

pub struct SchedulerComponent {
    scheduler: TriggerScheduler,
}

impl SchedulerComponent {
    pub fn new(scheduler: TriggerScheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for SchedulerComponent {
    fn name(&self) -> &'static str {
        "trigger-scheduler"
    }
    async fn on_start(&mut self) -> Result<()> {
        self.scheduler.start().await
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        self.scheduler.shutdown().await;
        Ok(())
    }
}

/// Idle-session reaper plus final teardown of every sandbox session.
pub struct ReaperComponent {
    sandbox: SandboxManager,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReaperComponent {
    pub fn new(sandbox: SandboxManager) -> Self {
        Self {
            sandbox,
            stop: CancellationToken::new(),
            task: None,
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for ReaperComponent {
    fn name(&self) -> &'static str {
        "sandbox-reaper"
    }
    async fn on_start(&mut self) -> Result<()> {
        self.task = Some(self.sandbox.start_reaper(self.stop.clone()));
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.sandbox.shutdown().await;
        Ok(())
    }
}
