//! Job record and its state machine.
//!
//! ```text
//! queued -> running -> succeeded
//!                   \-> failed
//! ```
//!
//! Every job passes through `running`, even when the conversion rejects the
//! input immediately: `started_at` marks the moment a worker took ownership.
//! `succeeded` and `failed` are terminal; once reached, the record is frozen.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

/// Highest progress value a running job may report. `100` is reserved for
/// success so that a poller seeing `100` knows the result exists.
pub const MAX_RUNNING_PROGRESS: u8 = 99;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether the lifecycle ever moves from `self` to `target`.
    pub fn can_transition_to(self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Why a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// The converter reported an error for this document.
    Conversion,
    /// The converter does not handle this document format.
    UnsupportedFormat,
    /// The per-job wall-clock budget elapsed.
    Timeout,
    /// Reading the input or writing the output failed.
    Storage,
    /// The conversion task panicked.
    Panic,
    /// The process stopped while the job was running.
    Interrupted,
}

impl JobErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversion => "conversion",
            Self::UnsupportedFormat => "unsupported_format",
            Self::Timeout => "timeout",
            Self::Storage => "storage",
            Self::Panic => "panic",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Classified failure stored on a failed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Extra output produced alongside the Markdown result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub location: String,
    pub size_bytes: u64,
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Immutable facts known when a job is created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub input_location: String,
    pub checksum: String,
    pub token_digest: String,
}

/// Durable metadata for one job, persisted as `jobs/{id}/job.json`.
///
/// Fields are only changed through the transition methods, which enforce the
/// state machine and stamp timestamps exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    id: JobId,
    filename: String,
    content_type: String,
    size_bytes: u64,
    status: JobStatus,
    progress: u8,
    error: Option<JobError>,
    created_at: Timestamp,
    updated_at: Timestamp,
    started_at: Option<Timestamp>,
    completed_at: Option<Timestamp>,
    failed_at: Option<Timestamp>,
    input_location: String,
    output_location: Option<String>,
    artifacts: Vec<Artifact>,
    checksum: String,
    token_digest: String,
}

impl JobRecord {
    /// Create a record in `queued` state with progress 0.
    pub fn new(job: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: job.id,
            filename: job.filename,
            content_type: job.content_type,
            size_bytes: job.size_bytes,
            status: JobStatus::Queued,
            progress: 0,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            input_location: job.input_location,
            output_location: None,
            artifacts: Vec::new(),
            checksum: job.checksum,
            token_digest: job.token_digest,
        }
    }

    // -- Accessors ---------------------------------------------------------

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn error(&self) -> Option<&JobError> {
        self.error.as_ref()
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn updated_at(&self) -> Timestamp {
        self.updated_at
    }

    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<Timestamp> {
        self.completed_at
    }

    pub fn failed_at(&self) -> Option<Timestamp> {
        self.failed_at
    }

    pub fn input_location(&self) -> &str {
        &self.input_location
    }

    pub fn output_location(&self) -> Option<&str> {
        self.output_location.as_deref()
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn token_digest(&self) -> &str {
        &self.token_digest
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    // -- Transitions -------------------------------------------------------

    /// `queued -> running`: a worker took ownership.
    pub fn start(&mut self) -> Result<(), CoreError> {
        let now = self.transition(JobStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    /// Record conversion progress while running.
    ///
    /// Values are clamped to [`MAX_RUNNING_PROGRESS`]; anything not above the
    /// current value is ignored. Returns `true` when the record changed and
    /// should be persisted.
    pub fn report_progress(&mut self, percent: u8) -> Result<bool, CoreError> {
        if self.status != JobStatus::Running {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: JobStatus::Running,
            });
        }
        let percent = percent.min(MAX_RUNNING_PROGRESS);
        if percent <= self.progress {
            return Ok(false);
        }
        self.progress = percent;
        self.updated_at = self.stamp();
        Ok(true)
    }

    /// `running -> succeeded`: progress is fixed at 100.
    pub fn succeed(
        &mut self,
        output_location: String,
        artifacts: Vec<Artifact>,
    ) -> Result<(), CoreError> {
        let now = self.transition(JobStatus::Succeeded)?;
        self.progress = 100;
        self.output_location = Some(output_location);
        self.artifacts = artifacts;
        self.completed_at = Some(now);
        Ok(())
    }

    /// `running -> failed`: progress stays at the last reported value.
    pub fn fail(&mut self, error: JobError) -> Result<(), CoreError> {
        let now = self.transition(JobStatus::Failed)?;
        self.error = Some(error);
        self.failed_at = Some(now);
        Ok(())
    }

    fn transition(&mut self, to: JobStatus) -> Result<Timestamp, CoreError> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        let now = self.stamp();
        self.status = to;
        self.updated_at = now;
        Ok(now)
    }

    /// Current time, never earlier than the last update so timestamps stay
    /// in causal order even if the wall clock steps backwards.
    fn stamp(&self) -> Timestamp {
        Utc::now().max(self.updated_at)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn new_record() -> JobRecord {
        JobRecord::new(NewJob {
            id: uuid::Uuid::new_v4(),
            filename: "report.pdf".into(),
            content_type: "application/pdf".into(),
            size_bytes: 1024,
            input_location: "jobs/x/input/original.pdf".into(),
            checksum: "abc".into(),
            token_digest: "$argon2id$v=19$m=8,t=1,p=1$c2FsdA$aGFzaA".into(),
        })
    }

    #[test]
    fn new_record_is_queued_with_zero_progress() {
        let record = new_record();
        assert_eq!(record.status(), JobStatus::Queued);
        assert_eq!(record.progress(), 0);
        assert!(record.error().is_none());
        assert!(record.started_at().is_none());
        assert_eq!(record.created_at(), record.updated_at());
    }

    #[test]
    fn success_path_stamps_timestamps_in_order() {
        let mut record = new_record();
        record.start().unwrap();
        assert!(record.report_progress(40).unwrap());
        record
            .succeed("jobs/x/output/result.md".into(), Vec::new())
            .unwrap();

        assert_eq!(record.status(), JobStatus::Succeeded);
        assert_eq!(record.progress(), 100);
        let started = record.started_at().unwrap();
        let completed = record.completed_at().unwrap();
        assert!(record.created_at() <= started);
        assert!(started <= completed);
        assert!(record.failed_at().is_none());
        assert_eq!(record.output_location(), Some("jobs/x/output/result.md"));
    }

    #[test]
    fn failure_keeps_last_progress() {
        let mut record = new_record();
        record.start().unwrap();
        record.report_progress(30).unwrap();
        record
            .fail(JobError::new(JobErrorKind::Timeout, "took too long"))
            .unwrap();

        assert_eq!(record.status(), JobStatus::Failed);
        assert_eq!(record.progress(), 30);
        assert_eq!(record.error().unwrap().kind, JobErrorKind::Timeout);
        assert!(record.failed_at().is_some());
        assert!(record.completed_at().is_none());
    }

    #[test]
    fn cannot_skip_running() {
        let mut record = new_record();
        assert_matches!(
            record.succeed("out".into(), Vec::new()),
            Err(CoreError::InvalidTransition {
                from: JobStatus::Queued,
                to: JobStatus::Succeeded
            })
        );
        assert_matches!(
            record.fail(JobError::new(JobErrorKind::Conversion, "bad")),
            Err(CoreError::InvalidTransition { .. })
        );
        assert_eq!(record.status(), JobStatus::Queued);
    }

    #[test]
    fn terminal_records_are_frozen() {
        let mut record = new_record();
        record.start().unwrap();
        record.succeed("out".into(), Vec::new()).unwrap();
        let snapshot = record.clone();

        assert!(record.start().is_err());
        assert!(record.report_progress(50).is_err());
        assert!(record
            .fail(JobError::new(JobErrorKind::Conversion, "late"))
            .is_err());
        assert_eq!(record, snapshot);
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let mut record = new_record();
        record.start().unwrap();

        assert!(record.report_progress(50).unwrap());
        assert!(!record.report_progress(20).unwrap());
        assert_eq!(record.progress(), 50);

        assert!(record.report_progress(100).unwrap());
        assert_eq!(record.progress(), MAX_RUNNING_PROGRESS);
        assert!(!record.report_progress(100).unwrap());
    }

    #[test]
    fn progress_rejected_before_running() {
        let mut record = new_record();
        assert!(record.report_progress(10).is_err());
        assert_eq!(record.progress(), 0);
    }

    #[test]
    fn serializes_with_snake_case_fields() {
        let record = new_record();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "queued");
        assert_eq!(json["progress"], 0);
        assert!(json["error"].is_null());
        assert!(json["output_location"].is_null());
        assert!(json["token_digest"].is_string());

        let back: JobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
