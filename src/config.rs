use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "runloom.toml";

/// Resolve the data directory: `RUNLOOM_DATA_DIR` wins, otherwise `~/.runloom`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RUNLOOM_DATA_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".runloom")
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub triggers: TriggerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Directory scanned for script tool manifests. Relative paths resolve against the data dir.
    #[serde(default)]
    pub tools_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_max_wall_clock_secs")]
    pub max_wall_clock_secs: u64,
    #[serde(default)]
    pub max_total_tokens: Option<u64>,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_retries")]
    pub max_retries: u32,
    #[serde(default = "default_provider_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_provider_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_provider_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Providers registered at startup, keyed by the id used in `provider/model` selections.
    #[serde(default)]
    pub endpoints: Vec<ProviderEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEndpoint {
    pub id: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// When false the provider is driven through `<invoke>` markup instead of native function calling.
    #[serde(default = "default_true")]
    pub native_tools: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackendKind {
    Process,
    Wasm,
}

/// Network exposure of process-backend sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessNetwork {
    /// Every exec gets a private network namespace with no interfaces but loopback.
    Isolated,
    /// Sessions share the host network and allowlists are not enforced. Trusted tools only.
    Host,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_backend")]
    pub backend: SandboxBackendKind,
    #[serde(default = "default_true")]
    pub pooling: bool,
    #[serde(default = "default_idle_lifetime_secs")]
    pub idle_lifetime_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_max_parallel_tool_calls")]
    pub max_parallel_tool_calls: usize,
    #[serde(default = "default_provision_retries")]
    pub provision_retries: u32,
    #[serde(default = "default_call_retries")]
    pub call_retries: u32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_process_network")]
    pub process_network: ProcessNetwork,
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Scratch root for process sessions; defaults to a temp directory.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_cpu_secs")]
    pub cpu_secs: u64,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "default_disk_mb")]
    pub disk_mb: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub network_allowlist: Vec<String>,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPreviousModeKind {
    Immediate,
    AwaitTermination,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_cancel_previous_mode")]
    pub cancel_previous_mode: CancelPreviousModeKind,
    #[serde(default = "default_cancel_previous_timeout_secs")]
    pub cancel_previous_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_worker_count() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_visibility_timeout_secs() -> u64 {
    60
}
fn default_heartbeat_secs() -> u64 {
    15
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_retry_max_ms() -> u64 {
    60_000
}
fn default_max_turns() -> u32 {
    25
}
fn default_max_wall_clock_secs() -> u64 {
    15 * 60
}
fn default_provider_retries() -> u32 {
    3
}
fn default_provider_backoff_ms() -> u64 {
    500
}
fn default_provider_max_backoff_ms() -> u64 {
    20_000
}
fn default_provider_timeout_secs() -> u64 {
    120
}
fn default_backend() -> SandboxBackendKind {
    SandboxBackendKind::Process
}
fn default_process_network() -> ProcessNetwork {
    ProcessNetwork::Isolated
}
fn default_idle_lifetime_secs() -> u64 {
    120
}
fn default_max_sessions() -> usize {
    16
}
fn default_max_parallel_tool_calls() -> usize {
    4
}
fn default_provision_retries() -> u32 {
    2
}
fn default_call_retries() -> u32 {
    1
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_cpu_secs() -> u64 {
    30
}
fn default_memory_mb() -> u64 {
    512
}
fn default_disk_mb() -> u64 {
    256
}
fn default_call_timeout_secs() -> u64 {
    60
}
fn default_max_output_bytes() -> usize {
    256 * 1024
}
fn default_cancel_previous_mode() -> CancelPreviousModeKind {
    CancelPreviousModeKind::AwaitTermination
}
fn default_cancel_previous_timeout_secs() -> u64 {
    30
}
fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    17890
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_retry_base_ms(),
            max_backoff_ms: default_retry_max_ms(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_wall_clock_secs: default_max_wall_clock_secs(),
            max_total_tokens: None,
            max_cost_usd: None,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_retries: default_provider_retries(),
            base_backoff_ms: default_provider_backoff_ms(),
            max_backoff_ms: default_provider_max_backoff_ms(),
            call_timeout_secs: default_provider_timeout_secs(),
            endpoints: Vec::new(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            pooling: true,
            idle_lifetime_secs: default_idle_lifetime_secs(),
            max_sessions: default_max_sessions(),
            max_parallel_tool_calls: default_max_parallel_tool_calls(),
            provision_retries: default_provision_retries(),
            call_retries: default_call_retries(),
            failure_threshold: default_failure_threshold(),
            process_network: default_process_network(),
            limits: LimitsConfig::default(),
            scratch_root: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cpu_secs: default_cpu_secs(),
            memory_mb: default_memory_mb(),
            disk_mb: default_disk_mb(),
            timeout_secs: default_call_timeout_secs(),
            network_allowlist: Vec::new(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            cancel_previous_mode: default_cancel_previous_mode(),
            cancel_previous_timeout_secs: default_cancel_previous_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            enabled: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl OrchestratorConfig {
    pub async fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let config_path = dir.as_ref().join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            info!("No {} found, using defaults.", CONFIG_FILE_NAME);
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path).await?;
        let mut config = Self::parse(&content)?;
        config.resolve_paths(dir.as_ref());
        info!(
            "Loaded config: workers={}, backend={:?}, max_parallel_tool_calls={}, max_turns={}",
            config.worker.count,
            config.sandbox.backend,
            config.sandbox.max_parallel_tool_calls,
            config.budget.max_turns
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: OrchestratorConfig = toml::from_str(content)?;
        config.clamp();
        Ok(config)
    }

    /// Zero values for counts and intervals would stall the system; bump them to the minimum.
    fn clamp(&mut self) {
        let mut clamped = Vec::new();
        if self.worker.count == 0 {
            self.worker.count = 1;
            clamped.push("worker.count");
        }
        if self.worker.poll_interval_ms == 0 {
            self.worker.poll_interval_ms = default_poll_interval_ms();
            clamped.push("worker.poll_interval_ms");
        }
        if self.worker.visibility_timeout_secs == 0 {
            self.worker.visibility_timeout_secs = default_visibility_timeout_secs();
            clamped.push("worker.visibility_timeout_secs");
        }
        if self.worker.heartbeat_secs == 0
            || self.worker.heartbeat_secs >= self.worker.visibility_timeout_secs
        {
            self.worker.heartbeat_secs = (self.worker.visibility_timeout_secs / 3).max(1);
            clamped.push("worker.heartbeat_secs");
        }
        if self.retry.max_attempts == 0 {
            self.retry.max_attempts = 1;
            clamped.push("retry.max_attempts");
        }
        if self.sandbox.max_sessions == 0 {
            self.sandbox.max_sessions = 1;
            clamped.push("sandbox.max_sessions");
        }
        if self.sandbox.max_parallel_tool_calls == 0 {
            self.sandbox.max_parallel_tool_calls = 1;
            clamped.push("sandbox.max_parallel_tool_calls");
        }
        if self.sandbox.failure_threshold == 0 {
            self.sandbox.failure_threshold = 1;
            clamped.push("sandbox.failure_threshold");
        }
        if self.budget.max_turns == 0 {
            self.budget.max_turns = 1;
            clamped.push("budget.max_turns");
        }
        if !clamped.is_empty() {
            info!("Clamped invalid config values: {}", clamped.join(", "));
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        if let Some(dir) = &self.tools_dir
            && dir.is_relative()
        {
            self.tools_dir = Some(base.join(dir));
        }
        if let Some(file) = &self.logging.file
            && file.is_relative()
        {
            self.logging.file = Some(base.join(file));
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.visibility_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.worker.heartbeat_secs)
    }
}
