use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::{
    sync::{Mutex, oneshot},
    task::JoinHandle,
};
use uuid::Uuid;

use crate::engine::{
    error::{EngineError, EngineResult},
    metrics::MetricsRegistry,
    models::{DebugState, SourceFile},
    workspace::{Workspace, WorkspaceManager, WorkspaceOwner},
};

struct DebugSession {
    workspace: Option<Workspace>,
    snapshots: Vec<DebugState>,
    current_step: usize,
    running: bool,
    last_access: Instant,
}

impl DebugSession {
    fn is_closed(&self) -> bool {
        self.workspace.is_none()
    }

    fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    /// Moves by `count` steps, clamped to the captured snapshots.
    fn step(&mut self, count: i64) {
        let max = self.snapshots.len() as i64;
        self.current_step = (self.current_step as i64).saturating_add(count).clamp(0, max) as usize;
    }

    /// Step 0 is the initial machine; step `k` is the snapshot taken after
    /// the `k`th instruction.
    fn state(&self) -> DebugState {
        let mut state = self
            .current_step
            .checked_sub(1)
            .and_then(|i| self.snapshots.get(i))
            .cloned()
            .unwrap_or_else(DebugState::initial);
        state.step_number = self.current_step;
        state.total_steps = self.snapshots.len();
        state.running = self.running;
        state
    }
}

struct RegistryInner {
    sessions: DashMap<String, Arc<Mutex<DebugSession>>>,
    workspaces: WorkspaceManager,
    idle_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

/// Owns every live debug session. Each session sits behind its own lock, so
/// a sweep never tears one down while a step holds it.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

pub struct SweeperHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "session sweeper ended abnormally");
        }
    }
}

impl SessionRegistry {
    pub fn new(
        workspaces: WorkspaceManager,
        idle_timeout: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                workspaces,
                idle_timeout,
                metrics,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub async fn start(&self, files: Vec<SourceFile>) -> EngineResult<(String, DebugState)> {
        let id = Uuid::new_v4().to_string();
        let workspace = self
            .inner
            .workspaces
            .allocate(WorkspaceOwner::Session(id.clone()))
            .await?;
        if let Err(err) = workspace.write_files(&files).await {
            self.inner.workspaces.release(workspace).await;
            return Err(err.into());
        }

        tracing::info!(
            session_id = %id,
            workspace = %workspace.root().display(),
            files = files.len(),
            "debug session started"
        );
        let session = DebugSession {
            workspace: Some(workspace),
            snapshots: Vec::new(),
            current_step: 0,
            running: true,
            last_access: Instant::now(),
        };
        let state = session.state();
        self.inner
            .sessions
            .insert(id.clone(), Arc::new(Mutex::new(session)));
        self.inner.metrics.session_opened();
        Ok((id, state))
    }

    /// Moves the session by `count` steps. The session is touched before the
    /// count is checked, so a rejected step still counts as activity.
    pub async fn step(&self, id: &str, count: Option<i64>) -> EngineResult<DebugState> {
        let session = self.lookup(id)?;
        let mut session = session.lock().await;
        if session.is_closed() {
            return Err(EngineError::NotFound("debug session"));
        }
        session.touch();
        let count = count.ok_or_else(|| {
            EngineError::InvalidRequest(
                "count must be an integer (positive = forward, negative = backward)".to_string(),
            )
        })?;
        session.step(count);
        Ok(session.state())
    }

    pub async fn state(&self, id: &str) -> EngineResult<DebugState> {
        let session = self.lookup(id)?;
        let mut session = session.lock().await;
        if session.is_closed() {
            return Err(EngineError::NotFound("debug session"));
        }
        session.touch();
        Ok(session.state())
    }

    /// Idempotent: unknown or already closed ids are a no-op.
    pub async fn close(&self, id: &str) {
        let Some((_, session)) = self.inner.sessions.remove(id) else {
            return;
        };
        let workspace = session.lock().await.workspace.take();
        if let Some(workspace) = workspace {
            self.inner.workspaces.release(workspace).await;
            self.inner.metrics.session_closed();
            tracing::info!(session_id = %id, "debug session closed");
        }
    }

    pub async fn close_all(&self) {
        let ids: Vec<String> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    /// Reclaims sessions idle for longer than the threshold as of `now`.
    /// Sessions whose lock is held by an in-flight call are skipped until the
    /// next sweep.
    pub async fn sweep_expired_at(&self, now: Instant) -> usize {
        let candidates: Vec<(String, Arc<Mutex<DebugSession>>)> = self
            .inner
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut reclaimed = 0;
        for (id, session) in candidates {
            let workspace = {
                let Ok(mut guard) = session.try_lock() else {
                    continue;
                };
                if guard.is_closed()
                    || now.saturating_duration_since(guard.last_access) < self.inner.idle_timeout
                {
                    continue;
                }
                self.inner
                    .sessions
                    .remove_if(&id, |_, current| Arc::ptr_eq(current, &session));
                guard.workspace.take()
            };
            if let Some(workspace) = workspace {
                self.inner.workspaces.release(workspace).await;
                self.inner.metrics.session_expired();
                tracing::info!(session_id = %id, "debug session expired");
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// One periodic task sweeps every session; stopping it is a single call.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let registry = self.clone();
        let (stop, mut stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let reclaimed = registry.sweep_expired_at(Instant::now()).await;
                        if reclaimed > 0 {
                            tracing::debug!(reclaimed, remaining = registry.len(), "idle sweep");
                        }
                    }
                }
            }
        });
        SweeperHandle { stop, task }
    }

    fn lookup(&self, id: &str) -> EngineResult<Arc<Mutex<DebugSession>>> {
        self.inner
            .sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound("debug session"))
    }
}
