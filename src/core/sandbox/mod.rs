pub mod manager;
pub mod process;
pub mod wasm;

#[cfg(test)]
mod tests;

pub use manager::{Disposition, PoolPolicy, SandboxLease, SandboxManager};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::LimitsConfig;
use crate::core::error::SandboxError;

/// Resource envelope a session is provisioned with. Pooled sessions are only reused for
/// leases asking for identical limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub cpu_secs: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub timeout: Duration,
    pub network_allowlist: Vec<String>,
    pub max_output_bytes: usize,
}

impl From<&LimitsConfig> for SandboxLimits {
    fn from(cfg: &LimitsConfig) -> Self {
        Self {
            cpu_secs: cfg.cpu_secs,
            memory_mb: cfg.memory_mb,
            disk_mb: cfg.disk_mb,
            timeout: Duration::from_secs(cfg.timeout_secs),
            network_allowlist: cfg.network_allowlist.clone(),
            max_output_bytes: cfg.max_output_bytes,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            cpu_secs: 30,
            memory_mb: 512,
            disk_mb: 256,
            timeout: Duration::from_secs(60),
            network_allowlist: Vec::new(),
            max_output_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Provisioning,
    Ready,
    Leased,
    Terminated,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Provisioning => "provisioning",
            SessionState::Ready => "ready",
            SessionState::Leased => "leased",
            SessionState::Terminated => "terminated",
        }
    }
}

pub fn can_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Provisioning, Ready)
            | (Provisioning, Terminated)
            | (Ready, Leased)
            | (Ready, Terminated)
            | (Leased, Ready)
            | (Leased, Terminated)
    )
}

/// Registry view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub backend: &'static str,
    pub state: SessionState,
    pub owner_run: Option<String>,
    pub leases: u32,
    pub created_at: i64,
    pub last_used_at: i64,
}

/// What a backend hands back from provisioning.
#[derive(Debug, Clone)]
pub struct SessionEnv {
    pub id: String,
    pub workdir: PathBuf,
    pub limits: SandboxLimits,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    /// Program and arguments. For the wasm backend `argv[0]` is the module path.
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: HashMap<String, String>,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn stdin(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(bytes.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration_ms: u64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Isolation mechanism behind the manager. Implementations own the environment a session id
/// maps to; the manager owns state, pooling and capacity.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn provision(
        &self,
        session_id: &str,
        limits: &SandboxLimits,
    ) -> Result<SessionEnv, SandboxError>;

    async fn exec(&self, env: &SessionEnv, request: ExecRequest) -> Result<ExecOutput, SandboxError>;

    /// Wipe session state so it can be handed to an unrelated run.
    async fn reset(&self, env: &SessionEnv) -> Result<(), SandboxError>;

    async fn destroy(&self, env: &SessionEnv);
}

/// Cut `bytes` to at most `cap` bytes on a char boundary.
pub(crate) fn cap_output(bytes: &[u8], cap: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= cap {
        return (text.into_owned(), false);
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}
