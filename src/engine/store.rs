use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::engine::{
    error::{EngineError, EngineResult},
    models::{
        Assignment, AssignmentInput, AssignmentSummary, DiffReport, SubmissionDetail,
        SubmissionRecord, SubmissionStatus, SubmissionSummary,
    },
};

/// One line of the JSON-lines journal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
enum JournalEntry {
    Assignment(Assignment),
    AssignmentDeleted(u64),
    Submission(SubmissionRecord),
}

#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub assignment_id: u64,
    pub student_name: String,
    pub student_email: Option<String>,
    pub source_code: String,
    pub actual_output: String,
    pub matched: bool,
    pub diff_report: Option<String>,
    pub archive_path: PathBuf,
}

/// Keyed record store for assignments and submissions, optionally journaled
/// to disk and replayed on open.
#[derive(Clone)]
pub struct GradeStore {
    assignments: Arc<DashMap<u64, Assignment>>,
    submissions: Arc<DashMap<u64, SubmissionRecord>>,
    next_assignment_id: Arc<AtomicU64>,
    next_submission_id: Arc<AtomicU64>,
    journal_path: Option<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl GradeStore {
    pub fn in_memory() -> Self {
        Self {
            assignments: Arc::new(DashMap::new()),
            submissions: Arc::new(DashMap::new()),
            next_assignment_id: Arc::new(AtomicU64::new(1)),
            next_submission_id: Arc::new(AtomicU64::new(1)),
            journal_path: None,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn open(journal_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut store = Self::in_memory();
        let Some(path) = journal_path else {
            return Ok(store);
        };

        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                for (idx, line) in contents.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let entry: JournalEntry = serde_json::from_str(line).with_context(|| {
                        format!("corrupt journal entry at {}:{}", path.display(), idx + 1)
                    })?;
                    store.replay(entry);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        }

        tracing::info!(
            path = %path.display(),
            assignments = store.assignments.len(),
            submissions = store.submissions.len(),
            "record store loaded"
        );
        store.journal_path = Some(path);
        Ok(store)
    }

    fn replay(&self, entry: JournalEntry) {
        match entry {
            JournalEntry::Assignment(assignment) => {
                self.next_assignment_id
                    .fetch_max(assignment.id + 1, Ordering::Relaxed);
                self.assignments.insert(assignment.id, assignment);
            }
            JournalEntry::AssignmentDeleted(id) => {
                self.assignments.remove(&id);
            }
            JournalEntry::Submission(record) => {
                self.next_submission_id
                    .fetch_max(record.id + 1, Ordering::Relaxed);
                self.submissions.insert(record.id, record);
            }
        }
    }

    async fn append(&self, entry: &JournalEntry) -> EngineResult<()> {
        let Some(path) = &self.journal_path else {
            return Ok(());
        };
        let mut line = serde_json::to_string(entry)
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|err| EngineError::Storage(format!("{}: {err}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| EngineError::Storage(err.to_string()))?;
        Ok(())
    }

    pub fn get_assignment(&self, id: u64) -> Option<Assignment> {
        self.assignments.get(&id).map(|e| e.value().clone())
    }

    pub fn list_assignments(&self) -> Vec<AssignmentSummary> {
        let mut all: Vec<Assignment> = self.assignments.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        all.into_iter()
            .map(|a| AssignmentSummary {
                submission_count: self.submission_count(a.id),
                id: a.id,
                title: a.title,
                description: a.description,
                due_date: a.due_date,
            })
            .collect()
    }

    pub async fn create_assignment(&self, input: AssignmentInput) -> EngineResult<Assignment> {
        let (title, expected_output) = required_assignment_fields(&input)?;
        let assignment = Assignment {
            id: self.next_assignment_id.fetch_add(1, Ordering::Relaxed),
            title,
            description: input.description,
            expected_output,
            due_date: input.due_date,
            created_by: input.created_by,
            created_at: Utc::now(),
        };
        self.append(&JournalEntry::Assignment(assignment.clone()))
            .await?;
        self.assignments.insert(assignment.id, assignment.clone());
        Ok(assignment)
    }

    pub async fn update_assignment(
        &self,
        id: u64,
        input: AssignmentInput,
    ) -> EngineResult<Assignment> {
        let (title, expected_output) = required_assignment_fields(&input)?;
        let existing = self
            .get_assignment(id)
            .ok_or(EngineError::NotFound("assignment"))?;
        let updated = Assignment {
            title,
            expected_output,
            description: input.description,
            due_date: input.due_date,
            created_by: input.created_by,
            ..existing
        };
        self.append(&JournalEntry::Assignment(updated.clone()))
            .await?;
        self.assignments.insert(id, updated.clone());
        Ok(updated)
    }

    pub async fn delete_assignment(&self, id: u64) -> EngineResult<()> {
        if self.assignments.contains_key(&id) {
            self.append(&JournalEntry::AssignmentDeleted(id)).await?;
            self.assignments.remove(&id);
        }
        Ok(())
    }

    /// Commits a submission. The journal write happens first so a failed
    /// write leaves no in-memory row behind.
    pub async fn insert_submission(&self, new: NewSubmission) -> EngineResult<SubmissionRecord> {
        let record = SubmissionRecord {
            id: self.next_submission_id.fetch_add(1, Ordering::Relaxed),
            assignment_id: new.assignment_id,
            student_name: new.student_name,
            student_email: new.student_email,
            source_code: new.source_code,
            actual_output: new.actual_output,
            matched: new.matched,
            diff_report: new.diff_report,
            archive_path: new.archive_path,
            status: SubmissionStatus::Graded,
            submitted_at: Utc::now(),
        };
        self.append(&JournalEntry::Submission(record.clone()))
            .await?;
        self.submissions.insert(record.id, record.clone());
        Ok(record)
    }

    pub fn get_submission(&self, id: u64) -> Option<SubmissionRecord> {
        self.submissions.get(&id).map(|e| e.value().clone())
    }

    pub fn list_submissions(&self, assignment_id: Option<u64>) -> Vec<SubmissionSummary> {
        let mut records: Vec<SubmissionRecord> = self
            .submissions
            .iter()
            .filter(|e| assignment_id.is_none_or(|id| e.value().assignment_id == id))
            .map(|e| e.value().clone())
            .collect();
        records.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then(b.id.cmp(&a.id)));
        records
            .into_iter()
            .map(|s| SubmissionSummary {
                assignment_title: self.get_assignment(s.assignment_id).map(|a| a.title),
                id: s.id,
                assignment_id: s.assignment_id,
                student_name: s.student_name,
                student_email: s.student_email,
                matched: s.matched,
                submitted_at: s.submitted_at,
                status: s.status,
            })
            .collect()
    }

    /// Instructor view of a submission, including the expected output and
    /// the stored diff.
    pub fn submission_detail(&self, id: u64) -> EngineResult<SubmissionDetail> {
        let record = self
            .get_submission(id)
            .ok_or(EngineError::NotFound("submission"))?;
        let diff = decode_diff_report(record.diff_report.as_deref())?;
        let assignment = self.get_assignment(record.assignment_id);

        Ok(SubmissionDetail {
            download_url: download_url(record.id),
            id: record.id,
            assignment_id: record.assignment_id,
            assignment_title: assignment.as_ref().map(|a| a.title.clone()),
            student_name: record.student_name,
            student_email: record.student_email,
            source_code: record.source_code,
            actual_output: record.actual_output,
            expected_output: assignment.map(|a| a.expected_output),
            matched: record.matched,
            diff_lines: diff.0,
            submitted_at: record.submitted_at,
            status: record.status,
        })
    }

    fn submission_count(&self, assignment_id: u64) -> usize {
        self.submissions
            .iter()
            .filter(|e| e.value().assignment_id == assignment_id)
            .count()
    }
}

pub fn download_url(submission_id: u64) -> String {
    format!("/api/submit/{submission_id}/download")
}

/// An absent payload is an empty report; anything unparseable is corruption.
pub fn decode_diff_report(payload: Option<&str>) -> EngineResult<DiffReport> {
    match payload {
        None => Ok(DiffReport::default()),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|err| EngineError::Storage(format!("corrupt diff report: {err}"))),
    }
}

fn required_assignment_fields(input: &AssignmentInput) -> EngineResult<(String, String)> {
    match (&input.title, &input.expected_output) {
        (Some(title), Some(expected)) if !title.trim().is_empty() && !expected.is_empty() => {
            Ok((title.clone(), expected.clone()))
        }
        _ => Err(EngineError::InvalidRequest(
            "missing required fields: title, expectedOutput".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::models::{DiffLine, DiffStatus};

    fn input(title: &str, expected: &str) -> AssignmentInput {
        AssignmentInput {
            title: Some(title.into()),
            expected_output: Some(expected.into()),
            description: None,
            due_date: None,
            created_by: Some("prof".into()),
        }
    }

    fn submission(assignment_id: u64, diff_report: Option<String>) -> NewSubmission {
        NewSubmission {
            assignment_id,
            student_name: "Ada".into(),
            student_email: None,
            source_code: "halt".into(),
            actual_output: "4".into(),
            matched: true,
            diff_report,
            archive_path: PathBuf::from("/tmp/a.zip"),
        }
    }

    #[tokio::test]
    async fn assignment_crud_round_trip() {
        let store = GradeStore::in_memory();
        let created = store.create_assignment(input("Lab 1", "4\n")).await.unwrap();
        assert_eq!(created.id, 1);

        let updated = store
            .update_assignment(created.id, input("Lab 1b", "5\n"))
            .await
            .unwrap();
        assert_eq!(updated.title, "Lab 1b");
        assert_eq!(updated.created_at, created.created_at);

        store.delete_assignment(created.id).await.unwrap();
        assert!(store.get_assignment(created.id).is_none());
        store.delete_assignment(created.id).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_incomplete_assignments() {
        let store = GradeStore::in_memory();
        let mut missing = input("Lab", "4");
        missing.expected_output = None;
        assert!(matches!(
            store.create_assignment(missing).await,
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            store.update_assignment(99, input("Lab", "4")).await,
            Err(EngineError::NotFound("assignment"))
        ));
    }

    #[tokio::test]
    async fn lists_submissions_per_assignment_with_counts() {
        let store = GradeStore::in_memory();
        let a = store.create_assignment(input("A", "1")).await.unwrap();
        let b = store.create_assignment(input("B", "2")).await.unwrap();
        store.insert_submission(submission(a.id, None)).await.unwrap();
        store.insert_submission(submission(a.id, None)).await.unwrap();
        store.insert_submission(submission(b.id, None)).await.unwrap();

        assert_eq!(store.list_submissions(None).len(), 3);
        let for_a = store.list_submissions(Some(a.id));
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].assignment_title.as_deref(), Some("A"));

        let counts: Vec<_> = store
            .list_assignments()
            .into_iter()
            .map(|s| (s.id, s.submission_count))
            .collect();
        assert!(counts.contains(&(a.id, 2)));
        assert!(counts.contains(&(b.id, 1)));
    }

    #[tokio::test]
    async fn detail_decodes_stored_diff_and_flags_corruption() {
        let store = GradeStore::in_memory();
        let a = store.create_assignment(input("A", "4")).await.unwrap();
        let report = DiffReport(vec![DiffLine {
            line_num: 1,
            expected: Some("4".into()),
            actual: Some("4".into()),
            status: DiffStatus::Match,
        }]);
        let good = store
            .insert_submission(submission(a.id, Some(serde_json::to_string(&report).unwrap())))
            .await
            .unwrap();
        let absent = store.insert_submission(submission(a.id, None)).await.unwrap();
        let corrupt = store
            .insert_submission(submission(a.id, Some("{not json".into())))
            .await
            .unwrap();

        let detail = store.submission_detail(good.id).unwrap();
        assert_eq!(detail.diff_lines, report.0);
        assert_eq!(detail.expected_output.as_deref(), Some("4"));
        assert!(store.submission_detail(absent.id).unwrap().diff_lines.is_empty());
        assert!(matches!(
            store.submission_detail(corrupt.id),
            Err(EngineError::Storage(_))
        ));
        assert!(matches!(
            store.submission_detail(999),
            Err(EngineError::NotFound("submission"))
        ));
    }

    #[tokio::test]
    async fn journal_is_replayed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.jsonl");

        let store = GradeStore::open(Some(path.clone())).await.unwrap();
        let kept = store.create_assignment(input("Kept", "1")).await.unwrap();
        let dropped = store.create_assignment(input("Dropped", "2")).await.unwrap();
        store.delete_assignment(dropped.id).await.unwrap();
        store.insert_submission(submission(kept.id, None)).await.unwrap();

        let reopened = GradeStore::open(Some(path)).await.unwrap();
        assert_eq!(reopened.get_assignment(kept.id).unwrap().title, "Kept");
        assert!(reopened.get_assignment(dropped.id).is_none());
        assert_eq!(reopened.list_submissions(None).len(), 1);

        let next = reopened.create_assignment(input("Next", "3")).await.unwrap();
        assert_eq!(next.id, dropped.id + 1);
    }

    #[tokio::test]
    async fn journal_failure_surfaces_as_storage_error_without_a_row() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened for append.
        let store = GradeStore::open(Some(dir.path().to_path_buf())).await;
        assert!(store.is_err());

        let mut store = GradeStore::in_memory();
        store.journal_path = Some(dir.path().to_path_buf());
        let result = store.insert_submission(submission(1, None)).await;
        assert!(matches!(result, Err(EngineError::Storage(_))));
        assert!(store.list_submissions(None).is_empty());
    }
}
