//! Artifact upload and output payload assembly.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::lease::{Job, LeaseClient, LeaseError, TaskType, UploadRequest};
use crate::pipeline::BatchOutcome;
use crate::staging::{StagingReport, ValidationRecord};

/// Content type for an artifact, by extension.
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "json" => "application/json",
        "txt" | "pgw" => "text/plain",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

/// Storage key for an output artifact of `job_id`.
pub fn artifact_key(job_id: &str, file_name: &str) -> String {
    format!(
        "geo-jobs/{}/output/{}-{}",
        job_id,
        Uuid::new_v4().simple(),
        file_name
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedArtifact {
    pub file_name: String,
    pub key: String,
    pub size: u64,
    pub content_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub uploaded: Vec<UploadedArtifact>,
    /// `(file name, reason)` for every artifact that did not make it
    pub failures: Vec<(String, String)>,
}

impl PublishReport {
    pub fn keys(&self) -> Vec<String> {
        self.uploaded.iter().map(|u| u.key.clone()).collect()
    }

    pub fn attempted(&self) -> usize {
        self.uploaded.len() + self.failures.len()
    }
}

/// Uploads a job's artifacts and builds the payload sent with `complete`.
#[derive(Debug, Clone)]
pub struct ResultPublisher {
    client: LeaseClient,
}

impl ResultPublisher {
    pub fn new(client: LeaseClient) -> Self {
        Self { client }
    }

    /// Upload every artifact in `batch`, including those of files that only
    /// partially succeeded, then assemble the output payload.
    ///
    /// A failed upload is logged and left out of the key list; deciding
    /// whether that fails the job is up to the caller.
    pub async fn publish(
        &self,
        job: &Job,
        worker_id: &str,
        staging: &StagingReport,
        batch: &BatchOutcome,
    ) -> (OutputPayload, PublishReport) {
        let mut report = PublishReport::default();

        for path in batch.artifacts() {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());

            match self.upload_one(&job.id, path, &file_name).await {
                Ok(uploaded) => {
                    tracing::info!(job_id = %job.id, file = %file_name, key = %uploaded.key, "Uploaded artifact");
                    report.uploaded.push(uploaded);
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, file = %file_name, error = %e, "Artifact upload failed");
                    report.failures.push((file_name, e.to_string()));
                }
            }
        }

        tracing::info!(
            job_id = %job.id,
            uploaded = report.uploaded.len(),
            failed = report.failures.len(),
            "Published artifacts"
        );

        let payload = OutputPayload::assemble(job, worker_id, staging, batch, &report, Utc::now());
        (payload, report)
    }

    async fn upload_one(
        &self,
        job_id: &str,
        path: &Path,
        file_name: &str,
    ) -> Result<UploadedArtifact, LeaseError> {
        let size = tokio::fs::metadata(path).await?.len();
        let content_type = content_type_for(file_name);
        let key = artifact_key(job_id, file_name);

        let ticket = self
            .client
            .upload_url(&UploadRequest {
                file_key: key.clone(),
                file_name: file_name.to_string(),
                file_size: size,
                content_type: content_type.to_string(),
            })
            .await?;
        tracing::debug!(
            job_id,
            key = %ticket.file_key,
            expires_in = ?ticket.expires_in,
            "Upload URL issued"
        );
        self.client
            .upload(&ticket.upload_url, path, content_type)
            .await?;

        let key = if ticket.file_key.is_empty() {
            key
        } else {
            ticket.file_key
        };
        Ok(UploadedArtifact {
            file_name: file_name.to_string(),
            key,
            size,
            content_type: content_type.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadSummary {
    pub total_input_files: usize,
    pub geotiff_files: usize,
    pub successfully_processed: usize,
    pub failed: usize,
    pub total_output_files: usize,
    pub uploaded_files: usize,
    pub rejected_files: usize,
}

/// The `outputPayload` of a completed job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    pub task_type: TaskType,
    pub processed_at: DateTime<Utc>,
    pub worker_id: String,
    pub processing_results: BatchOutcome,
    pub summary: PayloadSummary,
    pub input_validation: Vec<ValidationRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub uploaded: Vec<UploadedArtifact>,
}

impl OutputPayload {
    /// Build the payload from the job's outcomes. Pure: equal inputs give an
    /// equal payload.
    pub fn assemble(
        job: &Job,
        worker_id: &str,
        staging: &StagingReport,
        batch: &BatchOutcome,
        published: &PublishReport,
        processed_at: DateTime<Utc>,
    ) -> Self {
        let summary = PayloadSummary {
            total_input_files: staging.total(),
            geotiff_files: staging.raster_count(),
            successfully_processed: batch.succeeded,
            failed: batch.failed,
            total_output_files: batch.artifact_count(),
            uploaded_files: published.uploaded.len(),
            rejected_files: staging.rejected.len(),
        };

        Self {
            task_type: job.task_type,
            processed_at,
            worker_id: worker_id.to_string(),
            processing_results: batch.clone(),
            summary,
            input_validation: staging
                .validation_records()
                .into_iter()
                .cloned()
                .collect(),
            uploaded: published.uploaded.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FileOutcome, Stage, StageOutcome};
    use crate::staging::FileDescriptor;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("a.png"), "image/png");
        assert_eq!(content_type_for("a.PGW"), "text/plain");
        assert_eq!(content_type_for("a_metadata.json"), "application/json");
        assert_eq!(content_type_for("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("a.tiff"), "image/tiff");
        assert_eq!(content_type_for("a.bin"), "application/octet-stream");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn artifact_key_format() {
        let key = artifact_key("J1", "scene.png");
        let rest = key.strip_prefix("geo-jobs/J1/output/").unwrap();
        let (id, name) = rest.split_at(32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, "-scene.png");
        assert_ne!(key, artifact_key("J1", "scene.png"));
    }

    fn descriptor(name: &str, valid: bool) -> FileDescriptor {
        FileDescriptor {
            file_name: name.to_string(),
            remote_key: format!("in/{}", name),
            local_path: PathBuf::from(name),
            size: 10,
            validation: ValidationRecord {
                file_name: name.to_string(),
                valid,
                file_size: 10,
                ..Default::default()
            },
        }
    }

    #[test]
    fn assemble_is_deterministic_and_counts() {
        let job = Job::new("J1", TaskType::GeotiffToPng);
        let staging = StagingReport {
            accepted: vec![descriptor("a.tif", true), descriptor("aoi.json", true)],
            rejected: vec![descriptor("empty.tif", false)],
        };

        let mut file = FileOutcome::new("a.tif", "in/a.tif");
        for (stage, artifact) in [
            (Stage::Metadata, "a_metadata.json"),
            (Stage::Convert, "a.png"),
            (Stage::Georeference, "a.pgw"),
        ] {
            file.record(StageOutcome {
                stage,
                artifact: Some(PathBuf::from(artifact)),
                elapsed: Duration::from_millis(1),
                error: None,
            });
        }
        let mut batch = BatchOutcome::default();
        batch.push(file);

        let published = PublishReport {
            uploaded: vec![UploadedArtifact {
                file_name: "a.png".into(),
                key: "geo-jobs/J1/output/x-a.png".into(),
                size: 5,
                content_type: "image/png".into(),
            }],
            failures: vec![
                ("a.pgw".into(), "boom".into()),
                ("a_metadata.json".into(), "boom".into()),
            ],
        };

        let at = Utc::now();
        let first = OutputPayload::assemble(&job, "w-1", &staging, &batch, &published, at);
        let second = OutputPayload::assemble(&job, "w-1", &staging, &batch, &published, at);
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );

        assert_eq!(
            first.summary,
            PayloadSummary {
                total_input_files: 3,
                geotiff_files: 1,
                successfully_processed: 1,
                failed: 0,
                total_output_files: 3,
                uploaded_files: 1,
                rejected_files: 1,
            }
        );
        assert_eq!(first.input_validation.len(), 3);
        assert_eq!(published.keys(), vec!["geo-jobs/J1/output/x-a.png"]);
        assert_eq!(published.attempted(), 3);

        let value = serde_json::to_value(&first).unwrap();
        assert_eq!(value["taskType"], "geotiff_to_png");
        assert_eq!(value["summary"]["uploadedFiles"], 1);
        assert_eq!(value["processingResults"]["succeeded"], 1);
    }
}
