use std::{
    process::ExitStatus,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    process::Child,
    sync::{Mutex, Semaphore},
    task::JoinHandle,
};

use crate::engine::{
    artifacts,
    config::InterpreterConfig,
    error::{EngineError, EngineResult},
    metrics::MetricsRegistry,
    models::{ArtifactMap, ExecutionResult, ExecutionStatus},
    sandbox::{RunSpec, SandboxBackend, TIMEOUT_MESSAGE, build_command},
    workspace::{Workspace, WorkspaceManager, WorkspaceOwner},
};

/// How long to keep draining pipes after the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

pub struct ProcessSandbox {
    workspaces: WorkspaceManager,
    interpreter: InterpreterConfig,
    max_output_bytes: usize,
    admission: Option<Arc<Semaphore>>,
    metrics: Arc<MetricsRegistry>,
}

enum Termination {
    Exited(ExitStatus),
    TimedOut,
    WaitFailed(std::io::Error),
}

impl ProcessSandbox {
    pub fn new(
        workspaces: WorkspaceManager,
        interpreter: InterpreterConfig,
        max_output_bytes: usize,
        max_concurrent_runs: usize,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let admission = (max_concurrent_runs > 0).then(|| Arc::new(Semaphore::new(max_concurrent_runs)));
        Self {
            workspaces,
            interpreter,
            max_output_bytes,
            admission,
            metrics,
        }
    }

    async fn run_in(&self, workspace: &Workspace, spec: &RunSpec) -> EngineResult<ExecutionResult> {
        let started = Instant::now();
        let sources = workspace.write_files(&spec.files).await?;
        let mut cmd = build_command(&self.interpreter, workspace.root(), &sources);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.metrics.run_spawn_failed();
                tracing::warn!(
                    interpreter = %self.interpreter.command,
                    error = %err,
                    "failed to spawn interpreter"
                );
                return Ok(ExecutionResult {
                    status: ExecutionStatus::Failed,
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    artifacts: ArtifactMap::new(),
                    error: Some(format!("{}: {err}", self.interpreter.command)),
                    duration_ms: started.elapsed().as_millis(),
                });
            }
        };
        let pid = child.id();
        self.metrics.run_started();
        tracing::debug!(pid, workspace = %workspace.root().display(), "interpreter spawned");

        let stdout = child.stdout.take().context("missing stdout pipe")?;
        let stderr = child.stderr.take().context("missing stderr pipe")?;
        let limit = self.max_output_bytes;
        let stdout_buf = OutputBuffer::default();
        let stderr_buf = OutputBuffer::default();
        let stdout_task = tokio::spawn(read_limited(stdout, limit, stdout_buf.clone()));
        let stderr_task = tokio::spawn(read_limited(stderr, limit, stderr_buf.clone()));

        let termination = wait_or_kill(&mut child, pid, Duration::from_millis(spec.timeout_ms)).await;

        let stdout = drain(stdout_task, stdout_buf).await;
        let stderr = drain(stderr_task, stderr_buf).await;
        let duration_ms = started.elapsed().as_millis();

        let (status, exit_code, error) = match termination {
            Termination::Exited(exit) => {
                self.metrics.run_completed();
                (ExecutionStatus::Completed, exit.code(), None)
            }
            Termination::TimedOut => {
                self.metrics.run_timed_out();
                tracing::warn!(pid, timeout_ms = spec.timeout_ms, "interpreter timed out");
                (ExecutionStatus::TimedOut, None, Some(TIMEOUT_MESSAGE.to_string()))
            }
            Termination::WaitFailed(err) => {
                return Err(EngineError::Internal(format!(
                    "failed to wait for interpreter: {err}"
                )));
            }
        };

        let artifacts = artifacts::collect(workspace.root()).await?;
        tracing::info!(
            pid,
            status = ?status,
            exit_code,
            duration_ms = duration_ms as u64,
            "interpreter finished"
        );

        Ok(ExecutionResult {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
            artifacts,
            error,
            duration_ms,
        })
    }
}

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, spec: RunSpec) -> EngineResult<ExecutionResult> {
        let _permit = match &self.admission {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| EngineError::Internal("admission gate closed".to_string()))?,
            ),
            None => None,
        };

        let workspace = self.workspaces.allocate(WorkspaceOwner::Job).await?;
        let outcome = self.run_in(&workspace, &spec).await;
        self.workspaces.release(workspace).await;
        outcome
    }
}

/// Races natural exit against the deadline. Whichever way the child ends,
/// its process group is killed before the pipes are drained, so nothing it
/// spawned outlives the job.
async fn wait_or_kill(child: &mut Child, pid: Option<u32>, timeout: Duration) -> Termination {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            kill_group(pid);
            Termination::Exited(status)
        }
        Ok(Err(err)) => {
            kill_tree(child, pid).await;
            Termination::WaitFailed(err)
        }
        Err(_) => {
            kill_tree(child, pid).await;
            Termination::TimedOut
        }
    }
}

/// SIGKILLs every process in the child's group. A group that is already
/// empty is not an error.
fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::{
            errno::Errno,
            sys::signal::{Signal, killpg},
            unistd::Pid,
        };

        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => tracing::warn!(pid, error = %err, "failed to kill process group"),
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    // Reaps the direct child; a no-op kill if the group signal already landed.
    if let Err(err) = child.kill().await {
        tracing::warn!(error = %err, "failed to kill interpreter");
    }
}

/// Bytes captured from one stream so far. Readers append as they go, so an
/// abandoned reader still leaves its partial output behind.
#[derive(Clone, Default)]
struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    async fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().await)
    }
}

async fn drain(mut task: JoinHandle<()>, buffer: OutputBuffer) -> Vec<u8> {
    if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
        // A descendant escaped the process group and still holds the pipe.
        task.abort();
        tracing::debug!("output reader abandoned after grace period");
    }
    buffer.take().await
}

async fn read_limited<R>(mut reader: R, limit: usize, buffer: OutputBuffer)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut out = buffer.0.lock().await;
                if out.len() < limit {
                    let remaining = limit - out.len();
                    out.extend_from_slice(&chunk[..remaining.min(n)]);
                }
            }
        }
    }
}
