use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::ProcessBackend;
use super::wasm::WasmBackend;
use super::{
    ExecOutput, ExecRequest, SandboxBackend, SandboxLimits, SessionEnv, SessionInfo, SessionState,
    can_transition,
};
use crate::config::{SandboxBackendKind, SandboxConfig};
use crate::core::error::SandboxError;
use crate::core::store::now_ms;

/// Terminated sessions kept in the registry for inspection.
const TERMINATED_HISTORY: usize = 1024;

/// What to do with a session when its lease ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Wipe and return to the idle pool (if pooling is enabled).
    Reuse,
    Destroy,
}

#[derive(Debug, Clone)]
pub struct PoolPolicy {
    pub pooling: bool,
    pub idle_lifetime: Duration,
    pub max_sessions: usize,
    pub provision_retries: u32,
}

impl From<&SandboxConfig> for PoolPolicy {
    fn from(cfg: &SandboxConfig) -> Self {
        Self {
            pooling: cfg.pooling,
            idle_lifetime: Duration::from_secs(cfg.idle_lifetime_secs),
            max_sessions: cfg.max_sessions.max(1),
            provision_retries: cfg.provision_retries,
        }
    }
}

struct Entry {
    info: SessionInfo,
    /// Set by `terminate_run`; the session is destroyed instead of pooled on release.
    doomed: bool,
}

struct IdleSession {
    env: SessionEnv,
    permit: OwnedSemaphorePermit,
    since: Instant,
}

struct Inner {
    backend: Arc<dyn SandboxBackend>,
    policy: PoolPolicy,
    default_limits: SandboxLimits,
    /// One permit per live (idle or leased) session.
    capacity: Arc<Semaphore>,
    sessions: Mutex<HashMap<String, Entry>>,
    terminated: Mutex<VecDeque<String>>,
    idle: Mutex<Vec<IdleSession>>,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn register(&self, id: &str, run_id: &str) {
        let now = now_ms();
        lock(&self.sessions).insert(
            id.to_string(),
            Entry {
                info: SessionInfo {
                    id: id.to_string(),
                    backend: self.backend.name(),
                    state: SessionState::Provisioning,
                    owner_run: Some(run_id.to_string()),
                    leases: 0,
                    created_at: now,
                    last_used_at: now,
                },
                doomed: false,
            },
        );
    }

    fn transition(&self, id: &str, to: SessionState) -> bool {
        let mut sessions = lock(&self.sessions);
        let Some(entry) = sessions.get_mut(id) else {
            return false;
        };
        let from = entry.info.state;
        if !can_transition(from, to) {
            warn!(
                "Sandbox [{}]: ignored transition {} -> {}",
                id,
                from.as_str(),
                to.as_str()
            );
            return false;
        }
        entry.info.state = to;
        entry.info.last_used_at = now_ms();
        match to {
            SessionState::Leased => entry.info.leases += 1,
            SessionState::Ready => entry.info.owner_run = None,
            SessionState::Terminated => {
                drop(sessions);
                self.remember_terminated(id);
            }
            SessionState::Provisioning => {}
        }
        true
    }

    fn remember_terminated(&self, id: &str) {
        let mut history = lock(&self.terminated);
        history.push_back(id.to_string());
        while history.len() > TERMINATED_HISTORY {
            if let Some(old) = history.pop_front() {
                lock(&self.sessions).remove(&old);
            }
        }
    }

    fn assign(&self, id: &str, run_id: &str) {
        if let Some(entry) = lock(&self.sessions).get_mut(id) {
            entry.info.owner_run = Some(run_id.to_string());
        }
    }

    fn touch(&self, id: &str) {
        if let Some(entry) = lock(&self.sessions).get_mut(id) {
            entry.info.last_used_at = now_ms();
        }
    }

    fn is_doomed(&self, id: &str) -> bool {
        lock(&self.sessions).get(id).is_some_and(|e| e.doomed)
    }

    fn take_idle(&self, limits: &SandboxLimits) -> Option<IdleSession> {
        let mut idle = lock(&self.idle);
        let pos = idle.iter().rposition(|s| &s.env.limits == limits)?;
        Some(idle.remove(pos))
    }

    fn take_oldest_idle(&self) -> Option<IdleSession> {
        let mut idle = lock(&self.idle);
        if idle.is_empty() {
            None
        } else {
            Some(idle.remove(0))
        }
    }

    async fn terminate(&self, env: SessionEnv) {
        self.transition(&env.id, SessionState::Terminated);
        self.backend.destroy(&env).await;
        debug!("Sandbox [{}]: destroyed", env.id);
    }

    async fn release(
        &self,
        env: SessionEnv,
        permit: Option<OwnedSemaphorePermit>,
        disposition: Disposition,
    ) {
        let reusable = disposition == Disposition::Reuse
            && self.policy.pooling
            && !self.closed.load(Ordering::SeqCst)
            && !self.is_doomed(&env.id);

        let permit = match permit {
            Some(permit) if reusable => permit,
            other => {
                self.terminate(env).await;
                drop(other);
                return;
            }
        };

        match self.backend.reset(&env).await {
            Ok(()) if self.transition(&env.id, SessionState::Ready) => {
                let leftover = {
                    let mut idle = lock(&self.idle);
                    if self.closed.load(Ordering::SeqCst) {
                        Some((env, permit))
                    } else {
                        idle.push(IdleSession {
                            env,
                            permit,
                            since: Instant::now(),
                        });
                        None
                    }
                };
                if let Some((env, permit)) = leftover {
                    self.terminate(env).await;
                    drop(permit);
                }
            }
            Ok(()) => {
                self.terminate(env).await;
                drop(permit);
            }
            Err(e) => {
                warn!("Sandbox [{}]: reset failed, destroying: {}", env.id, e);
                self.terminate(env).await;
                drop(permit);
            }
        }
    }
}

/// Provisions, pools and tears down sandbox sessions. Cheap to clone.
#[derive(Clone)]
pub struct SandboxManager {
    inner: Arc<Inner>,
}

impl SandboxManager {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        policy: PoolPolicy,
        default_limits: SandboxLimits,
    ) -> Self {
        info!(
            "Sandbox manager: backend={} pooling={} max_sessions={}",
            backend.name(),
            policy.pooling,
            policy.max_sessions
        );
        Self {
            inner: Arc::new(Inner {
                backend,
                capacity: Arc::new(Semaphore::new(policy.max_sessions.max(1))),
                policy,
                default_limits,
                sessions: Mutex::new(HashMap::new()),
                terminated: Mutex::new(VecDeque::new()),
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(cfg: &SandboxConfig) -> Result<Self> {
        let backend: Arc<dyn SandboxBackend> = match cfg.backend {
            SandboxBackendKind::Process => Arc::new(ProcessBackend::new(
                cfg.scratch_root.clone(),
                cfg.process_network,
            )?),
            SandboxBackendKind::Wasm => Arc::new(WasmBackend::new(cfg.scratch_root.clone())?),
        };
        Ok(Self::new(
            backend,
            PoolPolicy::from(cfg),
            SandboxLimits::from(&cfg.limits),
        ))
    }

    pub fn default_limits(&self) -> &SandboxLimits {
        &self.inner.default_limits
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Lease an exclusive session for `run_id`, reusing a pooled one with matching limits when
    /// possible. Waits for capacity; the wait is abandoned if `cancel` fires.
    pub async fn lease(
        &self,
        run_id: &str,
        limits: &SandboxLimits,
        cancel: &CancellationToken,
    ) -> Result<SandboxLease, SandboxError> {
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(SandboxError::Provisioning(
                    "sandbox manager is shut down".into(),
                ));
            }
            if cancel.is_cancelled() {
                return Err(SandboxError::Cancelled);
            }

            if let Some(idle) = self.inner.take_idle(limits) {
                self.inner.assign(&idle.env.id, run_id);
                if self.inner.transition(&idle.env.id, SessionState::Leased) {
                    debug!("Sandbox [{}]: reused for run {}", idle.env.id, run_id);
                    return Ok(SandboxLease::new(
                        self.inner.clone(),
                        idle.env,
                        idle.permit,
                        run_id,
                    ));
                }
                self.inner.terminate(idle.env).await;
                continue;
            }

            let permit = match self.inner.capacity.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    // Full: make room by evicting an idle session with other limits.
                    if let Some(victim) = self.inner.take_oldest_idle() {
                        self.inner.terminate(victim.env).await;
                        drop(victim.permit);
                        continue;
                    }
                    tokio::select! {
                        permit = self.inner.capacity.clone().acquire_owned() => permit.map_err(|_| {
                            SandboxError::Provisioning("sandbox manager is shut down".into())
                        })?,
                        _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
                    }
                }
            };
            return self.provision(run_id, limits, permit).await;
        }
    }

    async fn provision(
        &self,
        run_id: &str,
        limits: &SandboxLimits,
        permit: OwnedSemaphorePermit,
    ) -> Result<SandboxLease, SandboxError> {
        let attempts = self.inner.policy.provision_retries + 1;
        let mut last_err = None;
        for attempt in 1..=attempts {
            let id = format!("sbx-{}", uuid::Uuid::new_v4().simple());
            self.inner.register(&id, run_id);
            match self.inner.backend.provision(&id, limits).await {
                Ok(env) => {
                    self.inner.transition(&id, SessionState::Ready);
                    self.inner.assign(&id, run_id);
                    self.inner.transition(&id, SessionState::Leased);
                    info!("Sandbox [{}]: provisioned for run {}", id, run_id);
                    return Ok(SandboxLease::new(self.inner.clone(), env, permit, run_id));
                }
                Err(e) => {
                    warn!(
                        "Sandbox [{}]: provisioning attempt {}/{} failed: {}",
                        id, attempt, attempts, e
                    );
                    self.inner.transition(&id, SessionState::Terminated);
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| SandboxError::Provisioning("no provisioning attempt made".into())))
    }

    /// Mark every session still leased to `run_id` for destruction on release. Returns how
    /// many were marked.
    pub fn terminate_run(&self, run_id: &str) -> usize {
        let mut sessions = lock(&self.inner.sessions);
        let mut marked = 0;
        for entry in sessions.values_mut() {
            if entry.info.state == SessionState::Leased
                && entry.info.owner_run.as_deref() == Some(run_id)
            {
                entry.doomed = true;
                marked += 1;
            }
        }
        if marked > 0 {
            warn!(
                "Sandbox: {} session(s) of run {} marked for termination",
                marked, run_id
            );
        }
        marked
    }

    /// Destroy pooled sessions idle for longer than the configured lifetime.
    pub async fn reap_idle(&self) -> usize {
        let lifetime = self.inner.policy.idle_lifetime;
        let expired: Vec<IdleSession> = {
            let mut idle = lock(&self.inner.idle);
            let (keep, expired) = idle
                .drain(..)
                .partition(|s: &IdleSession| s.since.elapsed() < lifetime);
            *idle = keep;
            expired
        };
        let count = expired.len();
        for session in expired {
            self.inner.terminate(session.env).await;
            drop(session.permit);
        }
        if count > 0 {
            info!("Sandbox reaper: terminated {} idle session(s)", count);
        }
        count
    }

    pub fn start_reaper(&self, stop: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let every = (manager.inner.policy.idle_lifetime / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.reap_idle().await;
                    }
                    _ = stop.cancelled() => break,
                }
            }
        })
    }

    /// Stop pooling, destroy idle sessions and fail pending lease waits. Leased sessions are
    /// destroyed as their leases end.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.capacity.close();
        let idle: Vec<IdleSession> = lock(&self.inner.idle).drain(..).collect();
        for session in idle {
            self.inner.terminate(session.env).await;
            drop(session.permit);
        }
        info!("Sandbox manager shut down");
    }

    pub fn session_states(&self) -> Vec<SessionInfo> {
        let mut out: Vec<SessionInfo> = lock(&self.inner.sessions)
            .values()
            .map(|e| e.info.clone())
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    pub fn session(&self, id: &str) -> Option<SessionInfo> {
        lock(&self.inner.sessions).get(id).map(|e| e.info.clone())
    }

    pub fn leased_by_run(&self, run_id: &str) -> Vec<SessionInfo> {
        self.session_states()
            .into_iter()
            .filter(|s| {
                s.state == SessionState::Leased && s.owner_run.as_deref() == Some(run_id)
            })
            .collect()
    }

    pub fn idle_count(&self) -> usize {
        lock(&self.inner.idle).len()
    }
}

/// Exclusive handle on a session. Call `release`; a lease dropped without release is
/// terminated in the background.
pub struct SandboxLease {
    inner: Arc<Inner>,
    env: Option<SessionEnv>,
    permit: Option<OwnedSemaphorePermit>,
    run_id: String,
}

impl SandboxLease {
    fn new(inner: Arc<Inner>, env: SessionEnv, permit: OwnedSemaphorePermit, run_id: &str) -> Self {
        Self {
            inner,
            env: Some(env),
            permit: Some(permit),
            run_id: run_id.to_string(),
        }
    }

    fn env(&self) -> Result<&SessionEnv, SandboxError> {
        self.env
            .as_ref()
            .ok_or_else(|| SandboxError::Terminated("released".into()))
    }

    pub fn id(&self) -> &str {
        self.env.as_ref().map(|e| e.id.as_str()).unwrap_or_default()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn workdir(&self) -> Option<&Path> {
        self.env.as_ref().map(|e| e.workdir.as_path())
    }

    pub fn limits(&self) -> Option<&SandboxLimits> {
        self.env.as_ref().map(|e| &e.limits)
    }

    pub async fn exec(&self, request: ExecRequest) -> Result<ExecOutput, SandboxError> {
        let env = self.env()?;
        if self.inner.is_doomed(&env.id) {
            return Err(SandboxError::Terminated(env.id.clone()));
        }
        self.inner.touch(&env.id);
        let timeout = env.limits.timeout;
        // Backends enforce the timeout themselves; this bounds a backend that hangs anyway.
        match tokio::time::timeout(
            timeout + Duration::from_secs(1),
            self.inner.backend.exec(env, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout(timeout)),
        }
    }

    pub async fn release(mut self, disposition: Disposition) {
        let Some(env) = self.env.take() else {
            return;
        };
        let permit = self.permit.take();
        self.inner.release(env, permit, disposition).await;
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        let Some(env) = self.env.take() else {
            return;
        };
        warn!(
            "Sandbox [{}]: lease for run {} dropped without release",
            env.id, self.run_id
        );
        self.inner.transition(&env.id, SessionState::Terminated);
        let inner = self.inner.clone();
        let permit = self.permit.take();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                inner.backend.destroy(&env).await;
                drop(permit);
            });
        }
    }
}
