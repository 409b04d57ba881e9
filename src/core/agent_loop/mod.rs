pub mod budget;
pub mod context;
pub mod state;

#[cfg(test)]
mod tests;

pub use budget::Budget;
pub use context::{RunContext, Turn, build_messages};
pub use state::{LoopState, StateTracker, can_transition};

use anyhow::anyhow;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::config::{BudgetConfig, OrchestratorConfig};
use crate::core::error::{JobError, ProviderError, RunFailure, ToolErrorKind};
use crate::core::llm::{
    CallFormat, ModelProvider, ModelRequest, ModelResponse, ProviderRegistry, estimate_usage,
    extract_tool_calls,
};
use crate::core::retry::backoff_delay;
use crate::core::store::{RunCounters, Store};
use crate::core::tools::{DispatchScope, ToolDispatcher};

/// How a run ended. Persisted on the run before it is returned.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { output: String },
    Failed(RunFailure),
    Cancelled,
    /// The run was already terminal when the loop picked it up; nothing was executed.
    AlreadyTerminal { status: String, reason: String },
}

impl RunOutcome {
    pub fn status(&self) -> &str {
        match self {
            RunOutcome::Completed { .. } => "completed",
            RunOutcome::Failed(_) => "failed",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::AlreadyTerminal { status, .. } => status,
        }
    }

    fn state(&self) -> LoopState {
        match self {
            RunOutcome::Completed { .. } => LoopState::Completed,
            RunOutcome::Failed(_) => LoopState::Failed,
            RunOutcome::Cancelled => LoopState::Cancelled,
            RunOutcome::AlreadyTerminal { status, .. } => match status.as_str() {
                "completed" => LoopState::Completed,
                "cancelled" => LoopState::Cancelled,
                _ => LoopState::Failed,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub budget: BudgetConfig,
    pub provider_retries: u32,
    pub provider_base_backoff: Duration,
    pub provider_max_backoff: Duration,
    pub provider_call_timeout: Duration,
    /// Consecutive sandbox-failed tool results that fail the run.
    pub sandbox_failure_threshold: u32,
}

impl From<&OrchestratorConfig> for LoopSettings {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            budget: cfg.budget.clone(),
            provider_retries: cfg.provider.max_retries,
            provider_base_backoff: Duration::from_millis(cfg.provider.base_backoff_ms),
            provider_max_backoff: Duration::from_millis(cfg.provider.max_backoff_ms),
            provider_call_timeout: Duration::from_secs(cfg.provider.call_timeout_secs),
            sandbox_failure_threshold: cfg.sandbox.failure_threshold.max(1),
        }
    }
}

enum ModelCallError {
    Cancelled,
    Exhausted { attempts: u32, last: ProviderError },
}

/// Drives one run's rounds: model call, concurrent tool dispatch, persistence, repeat.
pub struct ConversationLoop {
    store: Store,
    providers: Arc<ProviderRegistry>,
    dispatcher: ToolDispatcher,
    settings: LoopSettings,
}

impl ConversationLoop {
    pub fn new(
        store: Store,
        providers: Arc<ProviderRegistry>,
        dispatcher: ToolDispatcher,
        settings: LoopSettings,
    ) -> Self {
        Self {
            store,
            providers,
            dispatcher,
            settings,
        }
    }

    /// Execute (or resume) a run to a terminal state. `Err` means infrastructure trouble: the
    /// run stays non-terminal and the job decides whether to retry.
    pub async fn run(&self, ctx: RunContext) -> Result<RunOutcome, JobError> {
        let span = info_span!(
            "run",
            run_id = %ctx.run_id,
            job_id = ctx.job_id.as_deref().unwrap_or("-"),
            version_id = %ctx.version.version_id,
        );
        self.run_inner(ctx).instrument(span).await
    }

    async fn run_inner(&self, ctx: RunContext) -> Result<RunOutcome, JobError> {
        let run_id = ctx.run_id.clone();
        let Some(record) = self.store.get_run(&run_id).await? else {
            return Err(JobError::validation(anyhow!("run {} does not exist", run_id)));
        };
        if !self.store.mark_run_running(&run_id).await? {
            let current = self.store.get_run(&run_id).await?.unwrap_or(record);
            info!(
                "Run [{}]: already {} before the loop started, nothing to do",
                run_id, current.status
            );
            return Ok(RunOutcome::AlreadyTerminal {
                reason: current.error_kind.unwrap_or_else(|| current.status.clone()),
                status: current.status,
            });
        }

        let mut tracker = StateTracker::new(&run_id);
        let mut counters = record.counters.clone();
        let mut turns: Vec<Turn> = Vec::new();
        for rec in self.store.list_turns(&run_id).await? {
            let turn: Turn = serde_json::from_str(&rec.turn_json)
                .map_err(|e| JobError::validation(anyhow!("corrupt turn {}: {}", rec.turn_index, e)))?;
            turns.push(turn);
        }
        counters.turns = turns.len() as u32;

        self.store
            .append_run_event(
                &run_id,
                "run_started",
                &json!({
                    "resumed_turns": turns.len(),
                    "job_id": ctx.job_id,
                    "trigger": ctx.trigger,
                }),
            )
            .await?;
        if !turns.is_empty() {
            info!("Run [{}]: resuming after {} persisted turn(s)", run_id, turns.len());
        }

        // The final answer was persisted but the run never reached a terminal state.
        if let Some(last) = turns.last()
            && last.tool_calls.is_empty()
        {
            let replay = ModelResponse {
                text: last.assistant_text.clone(),
                tool_calls: Vec::new(),
                usage: None,
            };
            let (output, _) = extract_tool_calls(last.format, &replay, last.index);
            info!("Run [{}]: final turn {} already persisted", run_id, last.index);
            return self
                .finish(&ctx, RunOutcome::Completed { output }, &mut counters, Duration::ZERO)
                .await;
        }

        let config = &ctx.version.config;
        let provider = match self.providers.get(&config.model.provider) {
            Some(p) => p,
            None => {
                let failure = RunFailure::InvalidVersion(format!(
                    "unknown model provider '{}'",
                    config.model.provider
                ));
                tracker.advance(LoopState::Failed);
                return self
                    .finish(&ctx, RunOutcome::Failed(failure), &mut counters, Duration::ZERO)
                    .await;
            }
        };

        let missing = self.dispatcher.registry().missing(&config.tools);
        if !missing.is_empty() {
            warn!(
                "Run [{}]: version enables unregistered tool(s): {}",
                run_id,
                missing.join(", ")
            );
        }

        let format = provider.call_format();
        let catalog = match format {
            CallFormat::Markup => self.dispatcher.registry().markup_catalog(&config.tools),
            CallFormat::Function => String::new(),
        };
        let function_tools = match format {
            CallFormat::Function => self.dispatcher.registry().function_tools(&config.tools),
            CallFormat::Markup => Vec::new(),
        };
        let budget = Budget::resolve(&self.settings.budget, &config.budget);
        let scope = DispatchScope::new(&run_id, &config.tools, ctx.cancel.clone());
        let prior_elapsed = Duration::from_millis(counters.elapsed_ms);
        let started = Instant::now();
        let mut sandbox_streak = 0u32;

        let outcome = loop {
            if ctx.cancel.is_cancelled() {
                break RunOutcome::Cancelled;
            }
            counters.elapsed_ms = (prior_elapsed + started.elapsed()).as_millis() as u64;
            if let Err(failure) = budget.check(&counters, prior_elapsed + started.elapsed()) {
                warn!("Run [{}]: {}", run_id, failure);
                break RunOutcome::Failed(failure);
            }

            tracker.advance(LoopState::AwaitingModel);
            let turn_index = turns.len() as u32;
            let request = ModelRequest {
                model: config.model.model.clone(),
                temperature: config.model.temperature,
                messages: build_messages(&ctx.version, format, &catalog, &ctx.input, &turns),
                tools: function_tools.clone(),
            };

            let response = match self.call_model(provider.as_ref(), &request, &ctx.cancel).await {
                Ok(r) => r,
                Err(ModelCallError::Cancelled) => break RunOutcome::Cancelled,
                Err(ModelCallError::Exhausted { attempts, last }) => {
                    break RunOutcome::Failed(RunFailure::ProviderExhausted {
                        attempts,
                        last: last.to_string(),
                    });
                }
            };

            let usage = response
                .usage
                .unwrap_or_else(|| estimate_usage(&request.messages, &response.text));
            counters.turns += 1;
            counters.input_tokens += usage.input_tokens;
            counters.output_tokens += usage.output_tokens;
            counters.tokens_estimated |= usage.estimated;
            if let Some(pricing) = &config.model.pricing {
                counters.cost_usd += pricing.cost(usage.input_tokens, usage.output_tokens);
            }
            counters.elapsed_ms = (prior_elapsed + started.elapsed()).as_millis() as u64;

            let (prose, calls) = extract_tool_calls(format, &response, turn_index);
            let assistant_text = match format {
                CallFormat::Function => prose.clone(),
                CallFormat::Markup => response.text.clone(),
            };

            if calls.is_empty() {
                let turn = Turn {
                    index: turn_index,
                    format,
                    assistant_text,
                    tool_calls: Vec::new(),
                    tool_results: Vec::new(),
                    usage,
                };
                self.persist_turn(&run_id, &turn, &counters).await?;
                break RunOutcome::Completed { output: prose };
            }

            if ctx.cancel.is_cancelled() {
                info!(
                    "Run [{}]: cancelled before dispatching turn {}",
                    run_id, turn_index
                );
                break RunOutcome::Cancelled;
            }
            tracker.advance(LoopState::Dispatching);
            info!(
                "Run [{}]: turn {} dispatching {} tool call(s)",
                run_id,
                turn_index,
                calls.len()
            );
            let results = self.dispatcher.dispatch_round(&scope, &calls).await;
            tracker.advance(LoopState::AwaitingToolResults);

            for result in &results {
                if result.error_kind == Some(ToolErrorKind::Sandbox) {
                    sandbox_streak += 1;
                } else {
                    sandbox_streak = 0;
                }
            }

            counters.elapsed_ms = (prior_elapsed + started.elapsed()).as_millis() as u64;
            let turn = Turn {
                index: turn_index,
                format,
                assistant_text,
                tool_calls: calls,
                tool_results: results,
                usage,
            };
            self.persist_turn(&run_id, &turn, &counters).await?;
            turns.push(turn);

            if sandbox_streak >= self.settings.sandbox_failure_threshold {
                break RunOutcome::Failed(RunFailure::SandboxThreshold {
                    count: sandbox_streak,
                });
            }
        };

        tracker.advance(outcome.state());
        self.finish(&ctx, outcome, &mut counters, prior_elapsed + started.elapsed())
            .await
    }

    async fn call_model(
        &self,
        provider: &dyn ModelProvider,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, ModelCallError> {
        let max_attempts = self.settings.provider_retries + 1;
        let timeout = self.settings.provider_call_timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                r = tokio::time::timeout(timeout, provider.complete(request)) => r,
                _ = cancel.cancelled() => return Err(ModelCallError::Cancelled),
            };
            let err = match result {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout(timeout),
            };
            if !err.is_retryable() || attempt >= max_attempts {
                warn!(
                    "Model provider {} gave up after {} attempt(s): {}",
                    provider.id(),
                    attempt,
                    err
                );
                return Err(ModelCallError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = match &err {
                ProviderError::RateLimited {
                    retry_after: Some(after),
                } => (*after).min(self.settings.provider_max_backoff),
                _ => backoff_delay(
                    attempt,
                    self.settings.provider_base_backoff,
                    self.settings.provider_max_backoff,
                ),
            };
            warn!(
                "Model provider {} attempt {}/{} failed ({}); retrying in {}ms",
                provider.id(),
                attempt,
                max_attempts,
                err,
                delay.as_millis()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ModelCallError::Cancelled),
            }
        }
    }

    async fn persist_turn(
        &self,
        run_id: &str,
        turn: &Turn,
        counters: &RunCounters,
    ) -> Result<(), JobError> {
        let turn_json = serde_json::to_string(turn).map_err(anyhow::Error::from)?;
        self.store
            .save_turn(run_id, turn.index, &turn_json, counters)
            .await?;
        for result in &turn.tool_results {
            self.store
                .append_run_event(
                    run_id,
                    "tool_result",
                    &json!({
                        "turn": turn.index,
                        "call_id": result.call_id,
                        "tool": result.tool_name,
                        "success": result.success,
                        "error_kind": result.error_kind,
                        "duration_ms": result.metadata.duration_ms,
                    }),
                )
                .await?;
        }
        self.store
            .append_run_event(
                run_id,
                "turn_completed",
                &json!({
                    "turn": turn.index,
                    "tool_calls": turn.tool_calls.len(),
                    "input_tokens": turn.usage.input_tokens,
                    "output_tokens": turn.usage.output_tokens,
                }),
            )
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        ctx: &RunContext,
        outcome: RunOutcome,
        counters: &mut RunCounters,
        elapsed: Duration,
    ) -> Result<RunOutcome, JobError> {
        // Leases of this run are released by the dispatcher; anything left is torn down here.
        let stray = self.dispatcher.sandbox().terminate_run(&ctx.run_id);
        if stray > 0 {
            warn!("Run [{}]: {} sandbox session(s) still leased at finish", ctx.run_id, stray);
        }

        if !elapsed.is_zero() {
            counters.elapsed_ms = elapsed.as_millis() as u64;
        }
        let (output, kind, message) = match &outcome {
            RunOutcome::Completed { output } => (Some(output.as_str()), None, None),
            RunOutcome::Failed(failure) => (None, Some(failure.reason_code()), Some(failure.to_string())),
            RunOutcome::Cancelled => (None, Some("cancelled"), Some("cancelled by request".to_string())),
            RunOutcome::AlreadyTerminal { reason, .. } => (None, Some(reason.as_str()), None),
        };
        let applied = self
            .store
            .finish_run(
                &ctx.run_id,
                outcome.status(),
                output,
                kind,
                message.as_deref(),
                counters,
            )
            .await?;
        if !applied {
            warn!(
                "Run [{}]: already terminal, outcome {} not recorded",
                ctx.run_id,
                outcome.status()
            );
        }
        self.store
            .append_run_event(
                &ctx.run_id,
                "run_finished",
                &json!({
                    "status": outcome.status(),
                    "error_kind": kind,
                    "turns": counters.turns,
                    "elapsed_ms": counters.elapsed_ms,
                }),
            )
            .await?;
        info!(
            "Run [{}] finished: {} after {} turn(s)",
            ctx.run_id,
            outcome.status(),
            counters.turns
        );
        Ok(outcome)
    }
}
