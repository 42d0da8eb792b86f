use std::{
    collections::HashSet,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::engine::{
    error::{EngineError, EngineResult},
    grader::{GradeOutcome, grade},
    metrics::MetricsRegistry,
    models::{ArtifactMap, DiffReport, SourceFile, SubmissionRecord},
    sandbox::SandboxBackend,
    store::{GradeStore, NewSubmission},
};

pub const REPORT_NAME: &str = "report.txt";

#[derive(Debug, Clone)]
pub struct SubmitInput {
    pub assignment_id: u64,
    pub student_name: String,
    pub student_email: Option<String>,
    pub files: Vec<SourceFile>,
}

/// Grades a submission, bundles it into a zip archive and records it.
pub struct SubmissionPackager {
    sandbox: Arc<dyn SandboxBackend>,
    store: GradeStore,
    submissions_dir: PathBuf,
    timeout_ms: u64,
    metrics: Arc<MetricsRegistry>,
}

impl SubmissionPackager {
    pub fn new(
        sandbox: Arc<dyn SandboxBackend>,
        store: GradeStore,
        submissions_dir: PathBuf,
        timeout_ms: u64,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            sandbox,
            store,
            submissions_dir,
            timeout_ms,
            metrics,
        }
    }

    pub async fn submit(&self, input: SubmitInput) -> EngineResult<(SubmissionRecord, GradeOutcome)> {
        let assignment = self
            .store
            .get_assignment(input.assignment_id)
            .ok_or(EngineError::NotFound("assignment"))?;

        let outcome = grade(
            self.sandbox.as_ref(),
            input.files.clone(),
            &assignment.expected_output,
            self.timeout_ms,
        )
        .await?;

        let report = render_report(&ReportContext {
            student_name: &input.student_name,
            student_email: input.student_email.as_deref(),
            assignment_title: &assignment.title,
            submitted_at: Utc::now(),
            outcome: &outcome,
        });

        let archive_path = self
            .submissions_dir
            .join(assignment.id.to_string())
            .join(format!("{}.zip", Uuid::new_v4()));
        let entries = archive_entries(&input.files, &outcome.artifacts, report);
        let target = archive_path.clone();
        tokio::task::spawn_blocking(move || write_archive_atomic(&target, &entries))
            .await
            .map_err(|err| EngineError::Packaging(err.to_string()))?
            .inspect_err(|_| self.metrics.packaging_failed())?;

        let diff_report = encode_diff_report(&outcome)?;
        let record = self
            .store
            .insert_submission(NewSubmission {
                assignment_id: assignment.id,
                student_name: input.student_name,
                student_email: input.student_email,
                source_code: stored_source(&input.files),
                actual_output: outcome.actual_output.clone(),
                matched: outcome.matched,
                diff_report,
                archive_path: archive_path.clone(),
            })
            .await
            .inspect_err(|err| {
                // Left for the out-of-band orphan sweep.
                tracing::warn!(
                    archive = %archive_path.display(),
                    error = %err,
                    "submission not recorded; archive orphaned"
                );
            })?;

        self.metrics.submission_recorded();
        tracing::info!(
            submission_id = record.id,
            assignment_id = record.assignment_id,
            matched = record.matched,
            archive = %record.archive_path.display(),
            "submission recorded"
        );
        Ok((record, outcome))
    }
}

fn encode_diff_report(outcome: &GradeOutcome) -> EngineResult<Option<String>> {
    if !outcome.success {
        return Ok(None);
    }
    serde_json::to_string::<DiffReport>(&outcome.diff)
        .map(Some)
        .map_err(|err| EngineError::Internal(err.to_string()))
}

fn stored_source(files: &[SourceFile]) -> String {
    match files {
        [single] => single.contents.clone(),
        many => serde_json::to_string(&many.iter().map(|f| &f.contents).collect::<Vec<_>>())
            .unwrap_or_default(),
    }
}

/// Sources first, then artifacts, then the report. An artifact whose name is
/// already taken (sources are `.a` files too) is skipped.
fn archive_entries(files: &[SourceFile], artifacts: &ArtifactMap, report: String) -> Vec<(String, String)> {
    let mut seen: HashSet<String> = HashSet::from([REPORT_NAME.to_string()]);
    let mut entries = Vec::new();

    for file in files {
        if seen.insert(file.name.clone()) {
            entries.push((file.name.clone(), file.contents.clone()));
        }
    }
    for artifact in artifacts.values().flatten() {
        if seen.insert(artifact.name.clone()) {
            entries.push((artifact.name.clone(), artifact.content.clone()));
        }
    }
    entries.push((REPORT_NAME.to_string(), report));
    entries
}

/// Writes to a sibling temp file and renames into place, so the target either
/// holds a complete archive or does not exist.
fn write_archive_atomic(path: &Path, entries: &[(String, String)]) -> EngineResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| EngineError::Packaging("archive path has no parent".to_string()))?;
    std::fs::create_dir_all(parent)
        .map_err(|err| EngineError::Packaging(format!("{}: {err}", parent.display())))?;

    let partial = path.with_extension("zip.partial");
    let written = write_zip(&partial, entries).and_then(|()| {
        std::fs::rename(&partial, path).map_err(|err| err.to_string())
    });

    if let Err(err) = written {
        if let Err(cleanup) = std::fs::remove_file(&partial) {
            if cleanup.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %partial.display(), error = %cleanup, "failed to remove partial archive");
            }
        }
        return Err(EngineError::Packaging(err));
    }
    Ok(())
}

fn write_zip(path: &Path, entries: &[(String, String)]) -> Result<(), String> {
    let file = std::fs::File::create(path).map_err(|err| err.to_string())?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for (name, contents) in entries {
        zip.start_file(name.as_str(), options)
            .map_err(|err| err.to_string())?;
        zip.write_all(contents.as_bytes())
            .map_err(|err| err.to_string())?;
    }
    let file = zip.finish().map_err(|err| err.to_string())?;
    file.sync_all().map_err(|err| err.to_string())
}

pub struct ReportContext<'a> {
    pub student_name: &'a str,
    pub student_email: Option<&'a str>,
    pub assignment_title: &'a str,
    pub submitted_at: DateTime<Utc>,
    pub outcome: &'a GradeOutcome,
}

/// Plain-text grading report. The only artifact allowed to carry the
/// expected output and per-line diff.
pub fn render_report(ctx: &ReportContext<'_>) -> String {
    let outcome = ctx.outcome;
    let mut lines = vec![
        "ILCC Submission Report".to_string(),
        "======================".to_string(),
        format!("Student: {}", ctx.student_name),
    ];
    if let Some(email) = ctx.student_email.filter(|e| !e.is_empty()) {
        lines.push(format!("Email: {email}"));
    }
    lines.push(format!("Assignment: {}", ctx.assignment_title));
    lines.push(format!(
        "Submitted: {}",
        ctx.submitted_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    ));
    lines.push(String::new());
    lines.push(format!("Result: {}", if outcome.matched { "PASS" } else { "FAIL" }));
    lines.push(String::new());

    if let Some(error) = outcome.error.as_deref().filter(|e| !e.is_empty()) {
        lines.extend(["Errors:".to_string(), "-------".to_string(), error.to_string(), String::new()]);
    }

    lines.push("Actual Output:".to_string());
    lines.push("--------------".to_string());
    lines.push(if outcome.actual_output.is_empty() {
        "(no output)".to_string()
    } else {
        outcome.actual_output.clone()
    });
    lines.push(String::new());

    if !outcome.diff.is_empty() {
        lines.push("Diff:".to_string());
        lines.push("-----".to_string());
        for line in outcome.diff.lines() {
            let status = format!("{:?}", line.status).to_ascii_uppercase();
            lines.push(format!(
                "Line {}: {:<8} | Expected: {} | Actual: {}",
                line.line_num,
                status,
                quoted_or_none(line.expected.as_deref()),
                quoted_or_none(line.actual.as_deref()),
            ));
        }
    }

    lines.join("\n")
}

fn quoted_or_none(value: Option<&str>) -> String {
    value.map_or_else(|| "(none)".to_string(), |v| format!("\"{v}\""))
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::engine::{
        grader::tests::{CannedSandbox, completed},
        models::{Artifact, AssignmentInput, ExecutionResult, ExecutionStatus},
        sandbox::TIMEOUT_MESSAGE,
    };

    async fn setup(
        submissions_dir: PathBuf,
        stdout: &str,
    ) -> (SubmissionPackager, GradeStore, u64) {
        let mut result = completed(stdout, "", 0);
        result.artifacts.insert(
            "aFiles".into(),
            vec![Artifact {
                name: "main.a".into(),
                content: "halt".into(),
            }],
        );
        setup_with(submissions_dir, result).await
    }

    async fn setup_with(
        submissions_dir: PathBuf,
        result: ExecutionResult,
    ) -> (SubmissionPackager, GradeStore, u64) {
        let store = GradeStore::in_memory();
        let assignment = store
            .create_assignment(AssignmentInput {
                title: Some("Lab 3".into()),
                expected_output: Some("4\n5\n".into()),
                description: None,
                due_date: None,
                created_by: None,
            })
            .await
            .unwrap();
        let packager = SubmissionPackager::new(
            Arc::new(CannedSandbox::new(result)),
            store.clone(),
            submissions_dir,
            1_000,
            Arc::new(MetricsRegistry::new()),
        );
        (packager, store, assignment.id)
    }

    fn input(assignment_id: u64) -> SubmitInput {
        SubmitInput {
            assignment_id,
            student_name: "Ada Lovelace".into(),
            student_email: Some("ada@example.edu".into()),
            files: vec![SourceFile {
                name: "main.a".into(),
                contents: "halt".into(),
            }],
        }
    }

    fn archive_names(path: &Path) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn archive_holds_sources_artifacts_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let (packager, store, assignment_id) = setup(dir.path().to_path_buf(), "4\n").await;

        let (record, outcome) = packager.submit(input(assignment_id)).await.unwrap();

        assert!(!outcome.matched);
        assert_eq!(
            archive_names(&record.archive_path),
            ["main.a", "program.lst", "report.txt"]
        );
        assert!(record.archive_path.starts_with(dir.path().join(assignment_id.to_string())));

        let mut archive =
            zip::ZipArchive::new(std::fs::File::open(&record.archive_path).unwrap()).unwrap();
        let mut report = String::new();
        archive
            .by_name(REPORT_NAME)
            .unwrap()
            .read_to_string(&mut report)
            .unwrap();
        assert!(report.contains("Student: Ada Lovelace"));
        assert!(report.contains("Result: FAIL"));
        assert!(report.contains("Line 2: MISSING  | Expected: \"5\" | Actual: (none)"));

        let stored = store.get_submission(record.id).unwrap();
        assert_eq!(stored.source_code, "halt");
        assert!(store.submission_detail(record.id).unwrap().diff_lines.len() == 2);
    }

    #[tokio::test]
    async fn timed_out_run_is_still_recorded_and_archived() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = completed("partial", "", 0);
        result.status = ExecutionStatus::TimedOut;
        result.exit_code = None;
        result.error = Some(TIMEOUT_MESSAGE.into());
        let (packager, store, assignment_id) = setup_with(dir.path().to_path_buf(), result).await;

        let (record, outcome) = packager.submit(input(assignment_id)).await.unwrap();

        assert!(!outcome.success);
        assert!(!outcome.matched);
        let stored = store.get_submission(record.id).unwrap();
        assert!(stored.diff_report.is_none());
        assert_eq!(stored.actual_output, "");
        assert!(store.submission_detail(record.id).unwrap().diff_lines.is_empty());

        assert_eq!(
            archive_names(&record.archive_path),
            ["main.a", "program.lst", "report.txt"]
        );
        let mut archive =
            zip::ZipArchive::new(std::fs::File::open(&record.archive_path).unwrap()).unwrap();
        let mut report = String::new();
        archive
            .by_name(REPORT_NAME)
            .unwrap()
            .read_to_string(&mut report)
            .unwrap();
        assert!(report.contains("Result: FAIL"));
        assert!(report.contains(&format!("Errors:\n-------\n{TIMEOUT_MESSAGE}\n")));
        assert!(report.contains("(no output)"));
        assert!(!report.contains("Diff:"));
    }

    #[tokio::test]
    async fn unknown_assignment_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (packager, _, _) = setup(dir.path().to_path_buf(), "4\n").await;
        assert!(matches!(
            packager.submit(input(404)).await,
            Err(EngineError::NotFound("assignment"))
        ));
    }

    #[tokio::test]
    async fn packaging_failure_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, "not a directory").unwrap();
        let (packager, store, assignment_id) = setup(blocker, "4\n5\n").await;

        let result = packager.submit(input(assignment_id)).await;

        assert!(matches!(result, Err(EngineError::Packaging(_))));
        assert!(store.list_submissions(None).is_empty());
    }

    #[test]
    fn failed_zip_write_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.zip");
        // The partial path is occupied by a directory, so File::create fails.
        std::fs::create_dir(target.with_extension("zip.partial")).unwrap();

        let result = write_archive_atomic(&target, &[("a".into(), "b".into())]);
        assert!(matches!(result, Err(EngineError::Packaging(_))));
        assert!(!target.exists());
    }

    #[test]
    fn report_omits_optional_sections() {
        let outcome = GradeOutcome {
            success: false,
            actual_output: String::new(),
            matched: false,
            diff: DiffReport::default(),
            error: None,
            artifacts: ArtifactMap::new(),
        };
        let report = render_report(&ReportContext {
            student_name: "Bob",
            student_email: None,
            assignment_title: "Lab",
            submitted_at: Utc::now(),
            outcome: &outcome,
        });
        assert!(!report.contains("Email:"));
        assert!(!report.contains("Errors:"));
        assert!(!report.contains("Diff:"));
        assert!(report.contains("(no output)"));
    }

    #[test]
    fn multiple_sources_are_stored_as_json_array() {
        let files = vec![
            SourceFile {
                name: "a.a".into(),
                contents: "one".into(),
            },
            SourceFile {
                name: "b.a".into(),
                contents: "two".into(),
            },
        ];
        assert_eq!(stored_source(&files), r#"["one","two"]"#);
    }
}
