mod interpreter;
mod process;

use async_trait::async_trait;

use crate::engine::{
    error::{EngineError, EngineResult},
    models::{ExecutionResult, ExecutionStatus, SourceFile},
};

pub use interpreter::build_command;
pub use process::ProcessSandbox;

pub const TIMEOUT_MESSAGE: &str = "Execution timed out";

#[derive(Debug, Clone)]
pub struct RunSpec {
    pub files: Vec<SourceFile>,
    pub timeout_ms: u64,
}

/// Runs the interpreter over a set of files. `Err` is reserved for failures
/// to prepare the run; timeouts and spawn failures come back as results.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, spec: RunSpec) -> EngineResult<ExecutionResult>;
}

impl ExecutionResult {
    /// Turns an unfinished run into the matching error, for callers that
    /// only want completed output.
    pub fn completed_or_err(self, timeout_ms: u64) -> EngineResult<ExecutionResult> {
        match self.status {
            ExecutionStatus::Completed => Ok(self),
            ExecutionStatus::TimedOut => Err(EngineError::SandboxTimeout(timeout_ms)),
            ExecutionStatus::Failed => Err(EngineError::SandboxSpawn(
                self.error.unwrap_or_else(|| "interpreter failed".to_string()),
            )),
        }
    }
}
