use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::core::agent_loop::{ConversationLoop, LoopSettings};
use crate::core::lifecycle::{
    LifecycleManager, ReaperComponent, SchedulerComponent, WorkerPoolComponent,
};
use crate::core::llm::ProviderRegistry;
use crate::core::orchestrator::{Orchestrator, RunExecutor};
use crate::core::queue::{CancelRegistry, JobQueue, RetryPolicy, WorkerPool, WorkerSettings};
use crate::core::sandbox::SandboxManager;
use crate::core::store::Store;
use crate::core::terminal::{GuideSection, print_banner, print_goodbye, print_warn};
use crate::core::tools::builtin::register_builtins;
use crate::core::tools::dispatcher::{DispatchPolicy, ToolDispatcher};
use crate::core::tools::script::load_tools_from_dir;
use crate::core::tools::ToolRegistry;
use crate::core::triggers::{CancelPreviousMode, TriggerScheduler};
use crate::core::version::VersionStore;
use crate::interfaces::web::{ApiServer, AppState};

pub(crate) fn parse_api_server_flags(
    args: &[String],
    start: usize,
    mut api_host: String,
    mut api_port: u16,
) -> (String, u16) {
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--api-port" => {
                if i + 1 < args.len() {
                    api_port = args[i + 1].parse().unwrap_or(api_port);
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--api-host" => {
                if i + 1 < args.len() {
                    api_host = args[i + 1].clone();
                    i += 2;
                } else {
                    i += 1;
                }
            }
            _ => i += 1,
        }
    }
    (api_host, api_port)
}

/// Build the whole orchestrator from `runloom.toml` and run it until ctrl-c.
pub async fn run_serve(data_dir: &Path, mut config: OrchestratorConfig, args: &[String]) -> Result<()> {
    let (host, port) = parse_api_server_flags(args, 2, config.api.host.clone(), config.api.port);
    config.api.host = host;
    config.api.port = port;

    tokio::fs::create_dir_all(data_dir).await?;
    let store = Store::open(data_dir.join("runloom.db")).await?;
    let versions = Arc::new(VersionStore::new(store.clone()));

    let providers = ProviderRegistry::from_endpoints(&config.provider.endpoints);
    if providers.ids().is_empty() {
        print_warn("No model providers configured; every run will fail as invalid_version.");
    }

    let mut tools = ToolRegistry::new();
    register_builtins(&mut tools)?;
    let tools_dir = config
        .tools_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("tools"));
    for spec in load_tools_from_dir(&tools_dir).await? {
        tools.register(spec);
    }
    info!("Tool registry ready: {}", tools.names().join(", "));

    let sandbox = SandboxManager::from_config(&config.sandbox)?;
    let dispatcher = ToolDispatcher::new(
        Arc::new(tools),
        sandbox.clone(),
        DispatchPolicy::from(&config.sandbox),
    );
    let looper = Arc::new(ConversationLoop::new(
        store.clone(),
        Arc::new(providers),
        dispatcher,
        LoopSettings::from(&config),
    ));

    let queue = JobQueue::new(
        store.clone(),
        RetryPolicy::from(&config.retry),
        config.visibility_timeout(),
    );
    let cancels = CancelRegistry::new();
    let orchestrator = Orchestrator::new(store.clone(), versions.clone(), queue.clone(), cancels.clone());
    let scheduler = TriggerScheduler::new(
        orchestrator.clone(),
        CancelPreviousMode::from(&config.triggers),
    );
    let pool = WorkerPool::new(
        queue,
        Arc::new(RunExecutor::new(store, versions, looper)),
        cancels,
        WorkerSettings::from(&config),
    );

    let mut lifecycle = LifecycleManager::new();
    lifecycle.attach(Arc::new(Mutex::new(ReaperComponent::new(sandbox.clone()))));
    lifecycle.attach(Arc::new(Mutex::new(WorkerPoolComponent::new(pool))));
    lifecycle.attach(Arc::new(Mutex::new(SchedulerComponent::new(scheduler.clone()))));
    if config.api.enabled {
        lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(
            AppState {
                orchestrator,
                scheduler,
            },
            config.api.host.clone(),
            config.api.port,
        ))));
    } else {
        warn!("API server disabled; runs can only be fired by triggers.");
    }

    lifecycle.start().await?;

    print_banner();
    let mut section = GuideSection::new("Orchestrator running")
        .status("Data", &data_dir.display().to_string())
        .status("Workers", &config.worker.count.to_string())
        .status("Sandbox", sandbox.backend_name());
    if config.api.enabled {
        section = section.status(
            "API",
            &format!("http://{}:{}", config.api.host, config.api.port),
        );
    }
    section.print();
    println!("\n  Press Ctrl+C to stop.\n");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    lifecycle.shutdown().await;
    print_goodbye();
    Ok(())
}
