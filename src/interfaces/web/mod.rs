mod handlers;
mod router;

pub use router::build_api_router;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::Orchestrator;
use crate::core::triggers::TriggerScheduler;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub scheduler: TriggerScheduler,
}

pub struct ApiServer {
    state: AppState,
    host: String,
    port: u16,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ApiServer {
    pub fn new(state: AppState, host: String, port: u16) -> Self {
        Self {
            state,
            host,
            port,
            stop: CancellationToken::new(),
            task: None,
        }
    }
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = build_api_router(self.state.clone());
        let stop = self.stop.clone();
        info!("API Server running at http://{addr}");
        self.task = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
            {
                error!("API Server crashed: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API Server shutting down...");
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}
