use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};

/// Source text as submitted: one program or a list of files to link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SourceInput {
    Single(String),
    Multiple(Vec<String>),
}

impl SourceInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            SourceInput::Single(text) => vec![text],
            SourceInput::Multiple(texts) => texts,
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            SourceInput::Single(text) => text.is_empty(),
            SourceInput::Multiple(texts) => texts.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

/// Pairs sources with their file names, defaulting to `program.a` for a
/// single file and `file{i}.a` for several.
pub fn source_files(
    sources: SourceInput,
    file_names: Option<Vec<String>>,
) -> EngineResult<Vec<SourceFile>> {
    if sources.is_blank() {
        return Err(EngineError::InvalidRequest("source is empty".to_string()));
    }
    let sources = sources.into_vec();
    let names = match file_names {
        Some(names) => {
            if names.len() != sources.len() {
                return Err(EngineError::InvalidRequest(format!(
                    "fileNames has {} entries but {} sources were given",
                    names.len(),
                    sources.len()
                )));
            }
            names
        }
        None if sources.len() == 1 => vec!["program.a".to_string()],
        None => (0..sources.len()).map(|i| format!("file{i}.a")).collect(),
    };

    let mut seen = std::collections::HashSet::new();
    for name in &names {
        validate_file_name(name)?;
        if !seen.insert(name.as_str()) {
            return Err(EngineError::InvalidRequest(format!(
                "duplicate file name: {name}"
            )));
        }
    }

    Ok(names
        .into_iter()
        .zip(sources)
        .map(|(name, contents)| SourceFile { name, contents })
        .collect())
}

fn validate_file_name(name: &str) -> EngineResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(EngineError::InvalidRequest(format!(
            "invalid file name: {name:?}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub content: String,
}

/// Category key (e.g. `lstFiles`) to the artifacts in that category.
pub type ArtifactMap = BTreeMap<String, Vec<Artifact>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub artifacts: ArtifactMap,
    pub error: Option<String>,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiffStatus {
    Match,
    Mismatch,
    Missing,
    Extra,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiffLine {
    pub line_num: usize,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub status: DiffStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct DiffReport(pub Vec<DiffLine>);

impl DiffReport {
    pub fn matched(&self) -> bool {
        self.0.iter().all(|line| line.status == DiffStatus::Match)
    }

    pub fn lines(&self) -> &[DiffLine] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub id: u64,
    pub title: String,
    pub description: Option<String>,
    pub expected_output: String,
    pub due_date: Option<String>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentInput {
    pub title: Option<String>,
    pub expected_output: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<String>,
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentSummary {
    pub id: u64,
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<String>,
    pub submission_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Graded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    pub id: u64,
    pub assignment_id: u64,
    pub student_name: String,
    pub student_email: Option<String>,
    /// Raw text for a single file, a JSON array of texts for several.
    pub source_code: String,
    pub actual_output: String,
    pub matched: bool,
    /// Serialized [`DiffReport`]; `None` when grading produced no report.
    pub diff_report: Option<String>,
    pub archive_path: PathBuf,
    pub status: SubmissionStatus,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionSummary {
    pub id: u64,
    pub assignment_id: u64,
    pub assignment_title: Option<String>,
    pub student_name: String,
    pub student_email: Option<String>,
    pub matched: bool,
    pub submitted_at: DateTime<Utc>,
    pub status: SubmissionStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionDetail {
    pub id: u64,
    pub assignment_id: u64,
    pub assignment_title: Option<String>,
    pub student_name: String,
    pub student_email: Option<String>,
    pub source_code: String,
    pub actual_output: String,
    pub expected_output: Option<String>,
    pub matched: bool,
    pub diff_lines: Vec<DiffLine>,
    pub submitted_at: DateTime<Utc>,
    pub status: SubmissionStatus,
    pub download_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunRequest {
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRequest {
    pub code: Option<SourceInput>,
    pub assignment_id: Option<u64>,
    pub file_names: Option<Vec<String>>,
}

/// Student-facing grade result. Never carries the expected output or diff.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeResponse {
    pub success: bool,
    pub actual_output: String,
    pub matched: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub assignment_id: Option<u64>,
    pub student_name: Option<String>,
    pub student_email: Option<String>,
    pub source_code: Option<SourceInput>,
    pub file_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub submission_id: u64,
    pub matched: bool,
    pub actual_output: String,
    pub error: Option<String>,
    pub download_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugStartRequest {
    pub source_code: Option<SourceInput>,
    pub file_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugStartResponse {
    pub session_id: String,
    pub state: DebugState,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepRequest {
    pub count: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugStateResponse {
    pub state: DebugState,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flags {
    pub n: u8,
    pub z: u8,
    pub c: u8,
    pub v: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryChange {
    pub address: String,
    pub before: String,
    pub after: String,
}

/// Machine state captured at one step of a debug session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DebugState {
    pub step_number: usize,
    pub total_steps: usize,
    pub pc: String,
    pub ir: String,
    pub registers: BTreeMap<String, i32>,
    pub flags: Flags,
    pub memory_changes: Vec<MemoryChange>,
    pub output: String,
    pub running: bool,
}

impl DebugState {
    pub fn initial() -> Self {
        Self {
            step_number: 0,
            total_steps: 0,
            pc: format_word(0),
            ir: format_word(0),
            registers: (0..8).map(|i| (format!("r{i}"), 0)).collect(),
            flags: Flags::default(),
            memory_changes: Vec::new(),
            output: String::new(),
            running: true,
        }
    }
}

pub fn format_word(word: u16) -> String {
    format!("0x{word:04x}")
}
