use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Convert GeoTIFF inputs into PNG images with georeference side-files
    GeotiffToPng,
    /// Any task type this worker does not know how to run
    #[serde(other)]
    Unsupported,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::GeotiffToPng => write!(f, "geotiff_to_png"),
            TaskType::Unsupported => write!(f, "unsupported"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Claimed,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Claimed => write!(f, "claimed"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A job as returned by a successful claim.
///
/// The input payload stays as raw JSON here; it is parsed into
/// [`JobOptions`](crate::pipeline::JobOptions) and validated when the
/// pipeline starts, so a malformed payload fails the job rather than the claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub input_payload: serde_json::Value,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            task_type,
            input_payload: serde_json::Value::Null,
            status: JobStatus::Claimed,
            worker_id: None,
            lease_expires_at: None,
        }
    }
}

/// Category of a job-level failure, sent as `kind` in the error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnsupportedTaskType,
    InvalidPayload,
    InputListingFailed,
    NoValidInputFiles,
    WorkspaceUnavailable,
    ProcessingFailed,
    UploadFailed,
    DeadlineExceeded,
    LeaseLost,
    Cancelled,
    Internal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::UnsupportedTaskType => "unsupported_task_type",
            FailureKind::InvalidPayload => "invalid_payload",
            FailureKind::InputListingFailed => "input_listing_failed",
            FailureKind::NoValidInputFiles => "no_valid_input_files",
            FailureKind::WorkspaceUnavailable => "workspace_unavailable",
            FailureKind::ProcessingFailed => "processing_failed",
            FailureKind::UploadFailed => "upload_failed",
            FailureKind::DeadlineExceeded => "deadline_exceeded",
            FailureKind::LeaseLost => "lease_lost",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured failure report delivered with the `fail` transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub kind: FailureKind,
    pub message: String,
    pub trace: String,
    pub worker_id: String,
    pub failed_at: DateTime<Utc>,
    /// Supervisor state the job was in when it failed
    pub state: String,
}
