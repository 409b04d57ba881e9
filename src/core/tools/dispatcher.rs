use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use super::{ToolContext, ToolRegistry, ToolResult, ToolResultMeta, ToolSpec};
use crate::config::SandboxConfig;
use crate::core::error::{SandboxError, ToolError};
use crate::core::llm::ToolCall;
use crate::core::sandbox::{Disposition, SandboxManager};

#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Concurrent calls per round; the rest queue.
    pub max_parallel: usize,
    /// Extra attempts, each on a fresh session, after a retryable sandbox failure.
    pub call_retries: u32,
}

impl From<&SandboxConfig> for DispatchPolicy {
    fn from(cfg: &SandboxConfig) -> Self {
        Self {
            max_parallel: cfg.max_parallel_tool_calls.max(1),
            call_retries: cfg.call_retries,
        }
    }
}

/// Per-run inputs to a dispatch round.
#[derive(Clone)]
pub struct DispatchScope {
    pub run_id: String,
    pub enabled: Arc<HashSet<String>>,
    pub cancel: CancellationToken,
}

impl DispatchScope {
    pub fn new(run_id: &str, enabled: &[String], cancel: CancellationToken) -> Self {
        Self {
            run_id: run_id.to_string(),
            enabled: Arc::new(enabled.iter().cloned().collect()),
            cancel,
        }
    }
}

/// Runs the tool calls of one round concurrently and hands back results in call order.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    sandbox: SandboxManager,
    policy: DispatchPolicy,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>, sandbox: SandboxManager, policy: DispatchPolicy) -> Self {
        Self {
            registry,
            sandbox,
            policy,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn sandbox(&self) -> &SandboxManager {
        &self.sandbox
    }

    /// Exactly one result per call, in the order the calls were issued. Calls still waiting for
    /// a slot when the run is cancelled are not started.
    pub async fn dispatch_round(&self, scope: &DispatchScope, calls: &[ToolCall]) -> Vec<ToolResult> {
        let slots_gate = Arc::new(Semaphore::new(self.policy.max_parallel.max(1)));
        let mut set = JoinSet::new();

        for (idx, call) in calls.iter().cloned().enumerate() {
            let this = self.clone();
            let scope = scope.clone();
            let gate = slots_gate.clone();
            let span = info_span!("tool_call", run_id = %scope.run_id, call_id = %call.id, tool = %call.name);
            set.spawn(
                async move {
                    let permit = tokio::select! {
                        biased;
                        _ = scope.cancel.cancelled() => None,
                        permit = gate.acquire_owned() => permit.ok(),
                    };
                    let result = match permit {
                        Some(_permit) => this.dispatch_one(&scope, &call).await,
                        None => ToolResult::failed(
                            &call,
                            &ToolError::Sandbox(SandboxError::Cancelled),
                            ToolResultMeta::default(),
                        ),
                    };
                    (idx, result)
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<ToolResult>> = (0..calls.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!("Tool task for run {} aborted: {}", scope.run_id, e),
            }
        }

        slots
            .into_iter()
            .zip(calls)
            .map(|(slot, call)| {
                slot.unwrap_or_else(|| {
                    ToolResult::failed(
                        call,
                        &ToolError::Handler("tool handler panicked".into()),
                        ToolResultMeta::default(),
                    )
                })
            })
            .collect()
    }

    async fn dispatch_one(&self, scope: &DispatchScope, call: &ToolCall) -> ToolResult {
        let started = Instant::now();
        let meta = |attempts: u32, sandbox_id: Option<String>| ToolResultMeta {
            duration_ms: started.elapsed().as_millis() as u64,
            sandbox_id,
            attempts,
        };

        let spec = match self.registry.get(&call.name) {
            Some(spec) if scope.enabled.contains(&call.name) => spec,
            _ => {
                return ToolResult::failed(call, &ToolError::UnknownTool(call.name.clone()), meta(0, None));
            }
        };
        let args = match spec.prepare_args(call) {
            Ok(args) => args,
            Err(e) => {
                debug!("Rejected arguments for {}: {}", call.name, e);
                return ToolResult::failed(call, &e, meta(0, None));
            }
        };

        if !spec.needs_sandbox {
            let ctx = ToolContext {
                run_id: &scope.run_id,
                call_id: &call.id,
                sandbox: None,
                cancel: &scope.cancel,
            };
            return match run_handler(&spec, args, ctx).await {
                Ok(output) => ToolResult::ok(call, output, meta(1, None)),
                Err(e) => ToolResult::failed(call, &e, meta(1, None)),
            };
        }

        let limits = spec
            .limits
            .clone()
            .unwrap_or_else(|| self.sandbox.default_limits().clone());
        let max_attempts = self.policy.call_retries + 1;
        let mut last_err = ToolError::Sandbox(SandboxError::Provisioning("not attempted".into()));
        let mut last_sandbox = None;

        for attempt in 1..=max_attempts {
            let lease = match self.sandbox.lease(&scope.run_id, &limits, &scope.cancel).await {
                Ok(lease) => lease,
                Err(e) => {
                    let retry = e.is_retryable() && !scope.cancel.is_cancelled();
                    last_err = ToolError::Sandbox(e);
                    if retry && attempt < max_attempts {
                        continue;
                    }
                    return ToolResult::failed(call, &last_err, meta(attempt, None));
                }
            };
            let sandbox_id = lease.id().to_string();
            last_sandbox = Some(sandbox_id.clone());

            let ctx = ToolContext {
                run_id: &scope.run_id,
                call_id: &call.id,
                sandbox: Some(&lease),
                cancel: &scope.cancel,
            };
            let outcome = run_handler(&spec, args.clone(), ctx).await;

            let keep = matches!(outcome, Ok(_) | Err(ToolError::Handler(_)))
                && !scope.cancel.is_cancelled();
            lease
                .release(if keep {
                    Disposition::Reuse
                } else {
                    Disposition::Destroy
                })
                .await;

            match outcome {
                Ok(output) => return ToolResult::ok(call, output, meta(attempt, Some(sandbox_id))),
                Err(ToolError::Sandbox(e))
                    if e.is_retryable() && attempt < max_attempts && !scope.cancel.is_cancelled() =>
                {
                    warn!(
                        "Sandbox failure on {} (attempt {}/{}): {}",
                        call.name, attempt, max_attempts, e
                    );
                    last_err = ToolError::Sandbox(e);
                }
                Err(e) => return ToolResult::failed(call, &e, meta(attempt, Some(sandbox_id))),
            }
        }
        ToolResult::failed(call, &last_err, meta(max_attempts, last_sandbox))
    }
}

async fn run_handler(
    spec: &ToolSpec,
    args: serde_json::Value,
    ctx: ToolContext<'_>,
) -> Result<serde_json::Value, ToolError> {
    match tokio::time::timeout(spec.timeout, spec.handler.call(args, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(ToolError::Timeout(spec.timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::CallFormat;
    use crate::config::ProcessNetwork;
    use crate::core::sandbox::process::ProcessBackend;
    use crate::core::sandbox::{PoolPolicy, SandboxLimits, SessionState};
    use crate::core::tools::testing::*;
    use crate::core::tools::{ParamKind, ToolParam};
    use serde_json::json;
    use std::time::Duration;

    fn sandbox() -> SandboxManager {
        SandboxManager::new(
            Arc::new(ProcessBackend::new(None, ProcessNetwork::Host).unwrap()),
            PoolPolicy {
                pooling: true,
                idle_lifetime: Duration::from_secs(60),
                max_sessions: 8,
                provision_retries: 0,
            },
            SandboxLimits::default(),
        )
    }

    fn dispatcher(registry: ToolRegistry, max_parallel: usize) -> ToolDispatcher {
        ToolDispatcher::new(
            Arc::new(registry),
            sandbox(),
            DispatchPolicy {
                max_parallel,
                call_retries: 1,
            },
        )
    }

    fn call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
            format: CallFormat::Function,
            turn: 1,
        }
    }

    fn scope(enabled: &[&str]) -> DispatchScope {
        let enabled: Vec<String> = enabled.iter().map(|s| s.to_string()).collect();
        DispatchScope::new("run-1", &enabled, CancellationToken::new())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn results_follow_issue_order_not_completion_order() {
        let handler = Arc::new(
            EchoHandler::new()
                .delay("a", Duration::from_millis(150))
                .delay("b", Duration::from_millis(10)),
        );
        let mut registry = ToolRegistry::new();
        registry.register(query_tool("search", handler.clone()));
        let d = dispatcher(registry, 4);

        let calls = vec![
            call("a", "search", json!({"query": "slow"})),
            call("b", "search", json!({"query": "fast"})),
        ];
        let results = d.dispatch_round(&scope(&["search"]), &calls).await;

        assert_eq!(*handler.finished.lock().unwrap(), vec!["b", "a"]);
        let ids: Vec<_> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[0].output["echo"]["query"], "slow");
    }

    #[tokio::test]
    async fn every_call_gets_exactly_one_result() {
        let mut registry = ToolRegistry::new();
        registry.register(query_tool("search", Arc::new(EchoHandler::new())));
        registry.register(query_tool("boom", Arc::new(PanickingHandler)));
        registry.register(query_tool(
            "broken",
            Arc::new(FailingHandler(ToolError::Handler("upstream 500".into()))),
        ));
        registry.register(query_tool("disabled", Arc::new(EchoHandler::new())));
        let d = dispatcher(registry, 2);

        let calls = vec![
            call("1", "search", json!({"query": "x"})),
            call("2", "missing", json!({})),
            call("3", "search", json!({"wrong": true})),
            call("4", "boom", json!({"query": "x"})),
            call("5", "broken", json!({"query": "x"})),
            call("6", "disabled", json!({"query": "x"})),
        ];
        let results = d
            .dispatch_round(&scope(&["search", "boom", "broken"]), &calls)
            .await;

        assert_eq!(results.len(), calls.len());
        let ids: Vec<_> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3", "4", "5", "6"]);
        assert!(results[0].success);
        use crate::core::error::ToolErrorKind::*;
        let kinds: Vec<_> = results[1..].iter().map(|r| r.error_kind).collect();
        assert_eq!(
            kinds,
            vec![
                Some(UnknownTool),
                Some(Validation),
                Some(Handler),
                Some(Handler),
                Some(UnknownTool)
            ]
        );
        assert_eq!(results[4].error.as_deref(), Some("upstream 500"));
    }

    #[tokio::test]
    async fn sandboxed_tools_release_their_sessions() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolSpec::builder("shell", "runs in a sandbox")
                .param(ToolParam::required("query", ParamKind::String, ""))
                .sandboxed()
                .build(Arc::new(EchoHandler::new()))
                .unwrap(),
        );
        let d = dispatcher(registry, 2);
        let results = d
            .dispatch_round(
                &scope(&["shell"]),
                &[
                    call("a", "shell", json!({"query": "1"})),
                    call("b", "shell", json!({"query": "2"})),
                ],
            )
            .await;
        assert!(results.iter().all(|r| r.success), "{:?}", results);
        assert!(results.iter().all(|r| r.metadata.sandbox_id.is_some()));
        assert!(d.sandbox().leased_by_run("run-1").is_empty());
        assert!(
            d.sandbox()
                .session_states()
                .iter()
                .all(|s| s.state != SessionState::Leased)
        );
    }

    #[tokio::test]
    async fn handler_timeouts_become_failed_results() {
        let mut registry = ToolRegistry::new();
        registry.register(
            ToolSpec::builder("slow", "")
                .param(ToolParam::required("query", ParamKind::String, ""))
                .timeout(Duration::from_millis(30))
                .build(Arc::new(EchoHandler::new().delay("t", Duration::from_secs(5))))
                .unwrap(),
        );
        let d = dispatcher(registry, 1);
        let results = d
            .dispatch_round(&scope(&["slow"]), &[call("t", "slow", json!({"query": "x"}))])
            .await;
        assert_eq!(
            results[0].error_kind,
            Some(crate::core::error::ToolErrorKind::Timeout)
        );
    }

    #[tokio::test]
    async fn queued_calls_are_skipped_after_cancellation() {
        let handler = Arc::new(EchoHandler::new().delay("first", Duration::from_millis(100)));
        let mut registry = ToolRegistry::new();
        registry.register(query_tool("search", handler.clone()));
        let d = dispatcher(registry, 1);
        let scope = scope(&["search"]);

        let cancel = scope.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let results = d
            .dispatch_round(
                &scope,
                &[
                    call("first", "search", json!({"query": "a"})),
                    call("second", "search", json!({"query": "b"})),
                ],
            )
            .await;
        // The in-flight call finishes; the queued one never starts.
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(*handler.finished.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn nothing_starts_once_the_run_is_cancelled() {
        let handler = Arc::new(EchoHandler::new());
        let mut registry = ToolRegistry::new();
        registry.register(query_tool("search", handler.clone()));
        let d = dispatcher(registry, 4);
        let scope = scope(&["search"]);
        scope.cancel.cancel();

        let results = d
            .dispatch_round(
                &scope,
                &[
                    call("a", "search", json!({"query": "a"})),
                    call("b", "search", json!({"query": "b"})),
                ],
            )
            .await;
        assert!(results.iter().all(|r| !r.success));
        assert!(
            results
                .iter()
                .all(|r| r.error_kind == Some(crate::core::error::ToolErrorKind::Sandbox))
        );
        assert!(handler.finished.lock().unwrap().is_empty());
    }
}
