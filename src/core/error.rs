use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single tool call. Always converted into a failed `ToolResult`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("invalid arguments for '{tool}': {reason}")]
    Validation { tool: String, reason: String },
    #[error("sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("{0}")]
    Handler(String),
    #[error("tool call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    Validation,
    Sandbox,
    Handler,
    Timeout,
}

impl ToolError {
    pub fn kind(&self) -> ToolErrorKind {
        match self {
            ToolError::UnknownTool(_) => ToolErrorKind::UnknownTool,
            ToolError::Validation { .. } => ToolErrorKind::Validation,
            ToolError::Sandbox(_) => ToolErrorKind::Sandbox,
            ToolError::Handler(_) => ToolErrorKind::Handler,
            ToolError::Timeout(_) => ToolErrorKind::Timeout,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SandboxError {
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    #[error("execution exceeded {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("sandbox crashed: {0}")]
    Crashed(String),
    #[error("session {0} is terminated")]
    Terminated(String),
    #[error("cancelled")]
    Cancelled,
    #[error("unsupported by {backend} backend: {what}")]
    Unsupported { backend: &'static str, what: String },
}

impl SandboxError {
    /// Errors worth a fresh session and another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::Provisioning(_)
                | SandboxError::Timeout(_)
                | SandboxError::Crashed(_)
                | SandboxError::Terminated(_)
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("provider rejected request: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Fatal(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Turns,
    WallClock,
    Tokens,
    Cost,
}

impl BudgetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetKind::Turns => "turns",
            BudgetKind::WallClock => "wall_clock",
            BudgetKind::Tokens => "tokens",
            BudgetKind::Cost => "cost",
        }
    }
}

/// Terminal reason for a run that ended `Failed`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RunFailure {
    #[error("budget exceeded: {} limit {limit} reached", kind.as_str())]
    BudgetExceeded { kind: BudgetKind, limit: String },
    #[error("model provider failed after {attempts} attempt(s): {last}")]
    ProviderExhausted { attempts: u32, last: String },
    #[error("{count} consecutive sandbox failures")]
    SandboxThreshold { count: u32 },
    #[error("invalid run configuration: {0}")]
    InvalidVersion(String),
    #[error("job abandoned after {attempts} attempt(s): {last}")]
    JobDead { attempts: u32, last: String },
}

impl RunFailure {
    pub fn reason_code(&self) -> &'static str {
        match self {
            RunFailure::BudgetExceeded { .. } => "budget_exceeded",
            RunFailure::ProviderExhausted { .. } => "provider_error",
            RunFailure::SandboxThreshold { .. } => "sandbox_error",
            RunFailure::InvalidVersion(_) => "validation_error",
            RunFailure::JobDead { .. } => "job_infra_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorClass {
    /// Infrastructure hiccup; the job is retried with backoff.
    Transient,
    /// Retrying cannot help; the job fails immediately.
    Validation,
}

impl JobErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            JobErrorClass::Transient => "transient",
            JobErrorClass::Validation => "validation",
        }
    }
}

/// Error surfaced from executing a job, classified for the retry policy.
#[derive(Debug, Error)]
#[error("{class:?} job error: {source}")]
pub struct JobError {
    pub class: JobErrorClass,
    #[source]
    pub source: anyhow::Error,
}

impl JobError {
    pub fn transient(source: impl Into<anyhow::Error>) -> Self {
        Self {
            class: JobErrorClass::Transient,
            source: source.into(),
        }
    }

    pub fn validation(source: impl Into<anyhow::Error>) -> Self {
        Self {
            class: JobErrorClass::Validation,
            source: source.into(),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(source: anyhow::Error) -> Self {
        Self::transient(source)
    }
}
