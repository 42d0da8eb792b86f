use crate::engine::{
    diff::diff,
    error::EngineResult,
    models::{ArtifactMap, DiffReport, ExecutionStatus, GradeResponse, SourceFile},
    sandbox::{RunSpec, SandboxBackend},
};

const EMULATOR_ERROR: &str = "Emulator exited with an error";

/// Full grading outcome. Holds the per-line diff, so only the report and the
/// instructor read path may see it whole.
#[derive(Debug, Clone)]
pub struct GradeOutcome {
    pub success: bool,
    pub actual_output: String,
    pub matched: bool,
    pub diff: DiffReport,
    pub error: Option<String>,
    pub artifacts: ArtifactMap,
}

impl GradeOutcome {
    pub fn student_view(&self) -> GradeResponse {
        GradeResponse {
            success: self.success,
            actual_output: self.actual_output.clone(),
            matched: self.matched,
            error: self.error.clone(),
        }
    }

    fn failed(error: String, artifacts: ArtifactMap) -> Self {
        Self {
            success: false,
            actual_output: String::new(),
            matched: false,
            diff: DiffReport::default(),
            error: Some(error),
            artifacts,
        }
    }
}

pub async fn grade(
    sandbox: &dyn SandboxBackend,
    files: Vec<SourceFile>,
    expected_output: &str,
    timeout_ms: u64,
) -> EngineResult<GradeOutcome> {
    let result = sandbox.execute(RunSpec { files, timeout_ms }).await?;

    if result.status != ExecutionStatus::Completed {
        let error = result
            .error
            .unwrap_or_else(|| EMULATOR_ERROR.to_string());
        return Ok(GradeOutcome::failed(error, result.artifacts));
    }

    // Only a non-zero exit with no stdout at all is a hard failure; partial
    // output from a crashing program is still graded.
    if result.exit_code != Some(0) && result.stdout.is_empty() {
        let error = if result.stderr.is_empty() {
            EMULATOR_ERROR.to_string()
        } else {
            result.stderr
        };
        return Ok(GradeOutcome::failed(error, result.artifacts));
    }

    let actual = result.stdout.trim().to_string();
    let expected = expected_output.trim().to_string();
    let report = diff(&expected, &actual);

    Ok(GradeOutcome {
        success: true,
        matched: report.matched(),
        actual_output: actual,
        diff: report,
        error: (!result.stderr.is_empty()).then_some(result.stderr),
        artifacts: result.artifacts,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::engine::{
        error::EngineError,
        models::{Artifact, ExecutionResult},
    };

    /// Replays a canned result and remembers what it was asked to run.
    pub(crate) struct CannedSandbox {
        result: ExecutionResult,
        pub(crate) seen: Mutex<Vec<RunSpec>>,
    }

    impl CannedSandbox {
        pub(crate) fn new(result: ExecutionResult) -> Self {
            Self {
                result,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SandboxBackend for CannedSandbox {
        fn name(&self) -> &'static str {
            "canned"
        }

        async fn execute(&self, spec: RunSpec) -> EngineResult<ExecutionResult> {
            self.seen.lock().unwrap().push(spec);
            Ok(self.result.clone())
        }
    }

    pub(crate) fn completed(stdout: &str, stderr: &str, exit_code: i32) -> ExecutionResult {
        ExecutionResult {
            status: ExecutionStatus::Completed,
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            artifacts: ArtifactMap::from([(
                "lstFiles".to_string(),
                vec![Artifact {
                    name: "program.lst".into(),
                    content: "0000 halt".into(),
                }],
            )]),
            error: None,
            duration_ms: 3,
        }
    }

    fn files() -> Vec<SourceFile> {
        vec![SourceFile {
            name: "program.a".into(),
            contents: "halt".into(),
        }]
    }

    #[tokio::test]
    async fn matching_output_passes() {
        let sandbox = CannedSandbox::new(completed("4\n", "", 0));
        let outcome = grade(&sandbox, files(), "4\n", 1_000).await.unwrap();

        assert!(outcome.success);
        assert!(outcome.matched);
        assert_eq!(outcome.actual_output, "4");
        assert_eq!(outcome.diff.len(), 1);
        assert!(outcome.error.is_none());
        assert_eq!(sandbox.seen.lock().unwrap()[0].timeout_ms, 1_000);
    }

    #[tokio::test]
    async fn non_zero_exit_with_output_is_still_graded() {
        let sandbox = CannedSandbox::new(completed("4\n", "runtime error", 1));
        let outcome = grade(&sandbox, files(), "4\n5\n", 1_000).await.unwrap();

        assert!(outcome.success);
        assert!(!outcome.matched);
        assert_eq!(outcome.error.as_deref(), Some("runtime error"));
        assert_eq!(outcome.diff.len(), 2);
    }

    #[tokio::test]
    async fn non_zero_exit_without_output_is_a_hard_failure() {
        let sandbox = CannedSandbox::new(completed("", "", 2));
        let outcome = grade(&sandbox, files(), "4", 1_000).await.unwrap();

        assert!(!outcome.success);
        assert!(!outcome.matched);
        assert!(outcome.diff.is_empty());
        assert_eq!(outcome.error.as_deref(), Some(EMULATOR_ERROR));
        assert!(outcome.artifacts.contains_key("lstFiles"));
    }

    #[tokio::test]
    async fn timeout_is_a_failed_grade() {
        let mut result = completed("partial", "", 0);
        result.status = ExecutionStatus::TimedOut;
        result.exit_code = None;
        result.error = Some("Execution timed out".into());
        let sandbox = CannedSandbox::new(result);

        let outcome = grade(&sandbox, files(), "4", 1_000).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.actual_output, "");
        assert_eq!(outcome.error.as_deref(), Some("Execution timed out"));
    }

    #[tokio::test]
    async fn student_view_omits_expected_output() {
        let sandbox = CannedSandbox::new(completed("4\n", "", 0));
        let outcome = grade(&sandbox, files(), "secret\n", 1_000).await.unwrap();
        let json = serde_json::to_value(outcome.student_view()).unwrap();

        assert_eq!(
            json.as_object().unwrap().keys().collect::<Vec<_>>(),
            ["actualOutput", "error", "matched", "success"]
        );
        assert!(!json.to_string().contains("secret"));
    }

    #[test]
    fn completed_or_err_maps_timeouts() {
        let mut result = completed("", "", 0);
        result.status = ExecutionStatus::TimedOut;
        assert!(matches!(
            result.completed_or_err(250),
            Err(EngineError::SandboxTimeout(250))
        ));
    }
}
