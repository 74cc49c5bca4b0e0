use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Serialize, Serializer};

use super::stages::RasterMetadata;

/// One processing step applied to a single input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Metadata,
    Convert,
    Georeference,
    Thumbnail,
    Statistics,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Metadata => "metadata",
            Stage::Convert => "convert",
            Stage::Georeference => "georeference",
            Stage::Thumbnail => "thumbnail",
            Stage::Statistics => "statistics",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutcome {
    pub stage: Stage,
    #[serde(serialize_with = "file_name_opt")]
    pub artifact: Option<PathBuf>,
    #[serde(rename = "elapsedMs", serialize_with = "millis")]
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything that happened to one input file.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    pub input_file: String,
    pub remote_key: String,
    pub stages: Vec<StageOutcome>,
    #[serde(serialize_with = "file_names")]
    pub artifacts: Vec<PathBuf>,
    pub errors: Vec<String>,
    /// True iff the convert stage produced its image
    pub success: bool,
    /// Set when the file never ran (cancellation) or the runner panicked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RasterMetadata>,
}

impl FileOutcome {
    pub fn new(input_file: impl Into<String>, remote_key: impl Into<String>) -> Self {
        Self {
            input_file: input_file.into(),
            remote_key: remote_key.into(),
            stages: Vec::new(),
            artifacts: Vec::new(),
            errors: Vec::new(),
            success: false,
            skipped: None,
            metadata: None,
        }
    }

    /// An outcome for a file that produced nothing, with `reason` recorded.
    pub fn skipped(
        input_file: impl Into<String>,
        remote_key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let reason = reason.into();
        let mut outcome = Self::new(input_file, remote_key);
        outcome.errors.push(reason.clone());
        outcome.skipped = Some(reason);
        outcome
    }

    pub(crate) fn record(&mut self, outcome: StageOutcome) {
        if let Some(ref path) = outcome.artifact {
            if !self.artifacts.contains(path) {
                self.artifacts.push(path.clone());
            }
        }
        if let Some(ref error) = outcome.error {
            self.errors.push(format!("{} failed: {}", outcome.stage, error));
        }
        if outcome.stage == Stage::Convert {
            self.success = outcome.succeeded();
        }
        self.stages.push(outcome);
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Aggregate over every raster input of a job.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub files: Vec<FileOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(rename = "elapsedMs", serialize_with = "millis")]
    pub elapsed: Duration,
}

impl BatchOutcome {
    pub(crate) fn push(&mut self, outcome: FileOutcome) {
        if outcome.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.files.push(outcome);
    }

    /// Every produced artifact path across all files, in production order.
    pub fn artifacts(&self) -> impl Iterator<Item = &Path> {
        self.files
            .iter()
            .flat_map(|f| f.artifacts.iter().map(PathBuf::as_path))
    }

    pub fn artifact_count(&self) -> usize {
        self.files.iter().map(|f| f.artifacts.len()).sum()
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn file_name_opt<S: Serializer>(path: &Option<PathBuf>, s: S) -> Result<S::Ok, S::Error> {
    match path {
        Some(p) => s.serialize_some(&display_name(p)),
        None => s.serialize_none(),
    }
}

fn file_names<S: Serializer>(paths: &[PathBuf], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(paths.iter().map(|p| display_name(p)))
}

fn millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}
