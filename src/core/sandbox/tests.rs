use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::manager::PoolPolicy;
use super::*;
use crate::core::error::SandboxError;

/// Backend that only records calls. `fail_provisions` makes the first N provisions fail.
#[derive(Default)]
struct FakeBackend {
    provisions: AtomicU32,
    destroys: AtomicU32,
    resets: AtomicU32,
    fail_provisions: AtomicU32,
}

#[async_trait]
impl SandboxBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn provision(
        &self,
        session_id: &str,
        limits: &SandboxLimits,
    ) -> Result<SessionEnv, SandboxError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        if self
            .fail_provisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SandboxError::Provisioning("injected".into()));
        }
        Ok(SessionEnv {
            id: session_id.to_string(),
            workdir: PathBuf::from("/nonexistent").join(session_id),
            limits: limits.clone(),
        })
    }

    async fn exec(&self, _env: &SessionEnv, request: ExecRequest) -> Result<ExecOutput, SandboxError> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: request.argv.join(" "),
            stderr: String::new(),
            truncated: false,
            duration_ms: 0,
        })
    }

    async fn reset(&self, _env: &SessionEnv) -> Result<(), SandboxError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self, _env: &SessionEnv) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

fn manager(backend: Arc<FakeBackend>, max_sessions: usize, pooling: bool) -> SandboxManager {
    SandboxManager::new(
        backend,
        PoolPolicy {
            pooling,
            idle_lifetime: Duration::from_secs(60),
            max_sessions,
            provision_retries: 2,
        },
        SandboxLimits::default(),
    )
}

fn state_of(mgr: &SandboxManager, id: &str) -> SessionState {
    mgr.session(id).map(|s| s.state).unwrap()
}

#[test]
fn session_state_machine() {
    use SessionState::*;
    assert!(can_transition(Provisioning, Ready));
    assert!(can_transition(Ready, Leased));
    assert!(can_transition(Leased, Ready));
    assert!(can_transition(Leased, Terminated));
    assert!(!can_transition(Terminated, Ready));
    assert!(!can_transition(Provisioning, Leased));
    assert!(!can_transition(Ready, Provisioning));
}

#[tokio::test]
async fn released_sessions_are_pooled_and_reused() {
    let backend = Arc::new(FakeBackend::default());
    let mgr = manager(backend.clone(), 4, true);
    let cancel = CancellationToken::new();
    let limits = SandboxLimits::default();

    let lease = mgr.lease("run-1", &limits, &cancel).await.unwrap();
    let id = lease.id().to_string();
    assert_eq!(state_of(&mgr, &id), SessionState::Leased);
    let out = lease.exec(ExecRequest::new(["echo", "hi"])).await.unwrap();
    assert_eq!(out.stdout, "echo hi");
    lease.release(Disposition::Reuse).await;

    assert_eq!(state_of(&mgr, &id), SessionState::Ready);
    assert_eq!(mgr.idle_count(), 1);
    assert_eq!(backend.resets.load(Ordering::SeqCst), 1);

    let again = mgr.lease("run-2", &limits, &cancel).await.unwrap();
    assert_eq!(again.id(), id);
    let info = mgr.session(&id).unwrap();
    assert_eq!(info.leases, 2);
    assert_eq!(info.owner_run.as_deref(), Some("run-2"));
    assert_eq!(backend.provisions.load(Ordering::SeqCst), 1);
    again.release(Disposition::Destroy).await;
    assert_eq!(state_of(&mgr, &id), SessionState::Terminated);
}

#[tokio::test]
async fn pooling_disabled_destroys_on_release() {
    let backend = Arc::new(FakeBackend::default());
    let mgr = manager(backend.clone(), 2, false);
    let lease = mgr
        .lease("run", &SandboxLimits::default(), &CancellationToken::new())
        .await
        .unwrap();
    let id = lease.id().to_string();
    lease.release(Disposition::Reuse).await;
    assert_eq!(state_of(&mgr, &id), SessionState::Terminated);
    assert_eq!(mgr.idle_count(), 0);
    assert_eq!(backend.destroys.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn provisioning_is_retried() {
    let backend = Arc::new(FakeBackend::default());
    backend.fail_provisions.store(2, Ordering::SeqCst);
    let mgr = manager(backend.clone(), 2, true);
    let lease = mgr
        .lease("run", &SandboxLimits::default(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(backend.provisions.load(Ordering::SeqCst), 3);
    let states: Vec<_> = mgr.session_states().into_iter().map(|s| s.state).collect();
    assert_eq!(
        states.iter().filter(|s| **s == SessionState::Terminated).count(),
        2
    );
    lease.release(Disposition::Destroy).await;

    backend.fail_provisions.store(5, Ordering::SeqCst);
    let err = mgr
        .lease("run", &SandboxLimits::default(), &CancellationToken::new())
        .await
        .err()
        .expect("lease should fail once provisioning retries run out");
    assert!(matches!(err, SandboxError::Provisioning(_)));
}

#[tokio::test]
async fn full_pool_evicts_idle_sessions_with_other_limits() {
    let backend = Arc::new(FakeBackend::default());
    let mgr = manager(backend.clone(), 1, true);
    let cancel = CancellationToken::new();

    let small = SandboxLimits {
        memory_mb: 64,
        ..Default::default()
    };
    let first = mgr.lease("run", &small, &cancel).await.unwrap();
    let first_id = first.id().to_string();
    first.release(Disposition::Reuse).await;

    let second = mgr
        .lease("run", &SandboxLimits::default(), &cancel)
        .await
        .unwrap();
    assert_ne!(second.id(), first_id);
    assert_eq!(state_of(&mgr, &first_id), SessionState::Terminated);
    second.release(Disposition::Destroy).await;
}

#[tokio::test]
async fn waiting_for_capacity_is_cancellable() {
    let backend = Arc::new(FakeBackend::default());
    let mgr = manager(backend, 1, true);
    let held = mgr
        .lease("run-a", &SandboxLimits::default(), &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let waiter = {
        let mgr = mgr.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            mgr.lease("run-b", &SandboxLimits::default(), &cancel)
                .await
                .map(|_| ())
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let res = waiter.await.unwrap();
    assert!(matches!(res, Err(SandboxError::Cancelled)));
    held.release(Disposition::Destroy).await;
}

#[tokio::test]
async fn terminate_run_prevents_pooling() {
    let backend = Arc::new(FakeBackend::default());
    let mgr = manager(backend, 2, true);
    let lease = mgr
        .lease("run-x", &SandboxLimits::default(), &CancellationToken::new())
        .await
        .unwrap();
    let id = lease.id().to_string();
    assert_eq!(mgr.leased_by_run("run-x").len(), 1);
    assert_eq!(mgr.terminate_run("run-x"), 1);
    assert!(matches!(
        lease.exec(ExecRequest::new(["true"])).await,
        Err(SandboxError::Terminated(_))
    ));
    lease.release(Disposition::Reuse).await;
    assert_eq!(state_of(&mgr, &id), SessionState::Terminated);
    assert!(mgr.leased_by_run("run-x").is_empty());
}

#[tokio::test]
async fn dropped_lease_is_terminated() {
    let backend = Arc::new(FakeBackend::default());
    let mgr = manager(backend.clone(), 2, true);
    let lease = mgr
        .lease("run", &SandboxLimits::default(), &CancellationToken::new())
        .await
        .unwrap();
    let id = lease.id().to_string();
    drop(lease);
    assert_eq!(state_of(&mgr, &id), SessionState::Terminated);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.destroys.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn reaper_and_shutdown_clear_idle_sessions() {
    let backend = Arc::new(FakeBackend::default());
    let mgr = SandboxManager::new(
        backend.clone(),
        PoolPolicy {
            pooling: true,
            idle_lifetime: Duration::ZERO,
            max_sessions: 4,
            provision_retries: 0,
        },
        SandboxLimits::default(),
    );
    let cancel = CancellationToken::new();
    let lease = mgr.lease("run", &SandboxLimits::default(), &cancel).await.unwrap();
    lease.release(Disposition::Reuse).await;
    assert_eq!(mgr.idle_count(), 1);
    assert_eq!(mgr.reap_idle().await, 1);
    assert_eq!(mgr.idle_count(), 0);

    let mgr = manager(backend, 4, true);
    let lease = mgr.lease("run", &SandboxLimits::default(), &cancel).await.unwrap();
    let id = lease.id().to_string();
    lease.release(Disposition::Reuse).await;
    mgr.shutdown().await;
    assert_eq!(state_of(&mgr, &id), SessionState::Terminated);
    assert!(mgr.lease("run", &SandboxLimits::default(), &cancel).await.is_err());
}
