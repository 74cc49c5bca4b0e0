use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::workspace::Workspace;
use crate::error::JobFailure;
use crate::lease::{FailureKind, LeaseClient, RemoteFile};
use crate::raster::Dataset;

const RASTER_EXTENSIONS: &[&str] = &[".tif", ".tiff", ".geotiff"];
const AUXILIARY_EXTENSIONS: &[&str] = &[".zip", ".geojson", ".json"];

const LARGE_DIMENSION: u32 = 20_000;
const MANY_BANDS: u16 = 10;

/// Outcome of checking one input before it is used.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRecord {
    pub file_name: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub file_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bands: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_crs: Option<bool>,
    /// Non-fatal observations about an accepted input
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl ValidationRecord {
    fn rejected(file_name: &str, file_size: u64, error: impl Into<String>) -> Self {
        Self {
            file_name: file_name.to_string(),
            valid: false,
            error: Some(error.into()),
            file_size,
            ..Default::default()
        }
    }
}

/// A declared input file and where it ended up locally.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub file_name: String,
    pub remote_key: String,
    /// Target path inside the workspace; rejected files are removed from it
    pub local_path: PathBuf,
    pub size: u64,
    pub validation: ValidationRecord,
}

impl FileDescriptor {
    pub fn is_valid(&self) -> bool {
        self.validation.valid
    }

    /// Whether the pipeline should process this file.
    pub fn is_raster(&self) -> bool {
        self.is_valid() && is_raster_name(&self.file_name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StagingReport {
    pub accepted: Vec<FileDescriptor>,
    pub rejected: Vec<FileDescriptor>,
}

impl StagingReport {
    pub fn total(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }

    pub fn raster_count(&self) -> usize {
        self.accepted.iter().filter(|f| f.is_raster()).count()
    }

    /// Validation records of every declared input, accepted first.
    pub fn validation_records(&self) -> Vec<&ValidationRecord> {
        self.accepted
            .iter()
            .chain(&self.rejected)
            .map(|f| &f.validation)
            .collect()
    }
}

/// Downloads and validates a job's declared inputs into its workspace.
#[derive(Debug, Clone)]
pub struct FileStager {
    client: LeaseClient,
    max_file_size: u64,
}

impl FileStager {
    pub fn new(client: LeaseClient, max_file_size: u64) -> Self {
        Self {
            client,
            max_file_size,
        }
    }

    /// Stage every input of `job_id` into `workspace`.
    ///
    /// Individual bad inputs are recorded as rejected. The call itself fails
    /// only when the listing cannot be fetched or nothing was accepted.
    pub async fn stage(
        &self,
        job_id: &str,
        workspace: &Workspace,
    ) -> Result<StagingReport, JobFailure> {
        let listing = self
            .client
            .input_files(job_id)
            .await
            .map_err(|e| JobFailure::from_error(FailureKind::InputListingFailed, &e))?;

        tracing::info!(job_id, files = listing.len(), "Staging input files");

        let input_dir = workspace.input_dir();
        let mut used_names = HashSet::new();
        let mut report = StagingReport::default();

        for (index, remote) in listing.into_iter().enumerate() {
            let local_name = local_file_name(&remote.file_name, index, &mut used_names);
            let dest = input_dir.join(&local_name);
            let descriptor = self.stage_one(job_id, remote, dest).await;

            if descriptor.is_valid() {
                report.accepted.push(descriptor);
            } else {
                tracing::warn!(
                    job_id,
                    file = %descriptor.file_name,
                    reason = descriptor.validation.error.as_deref().unwrap_or("unknown"),
                    "Rejected input file"
                );
                report.rejected.push(descriptor);
            }
        }

        tracing::info!(
            job_id,
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            rasters = report.raster_count(),
            "Staging finished"
        );

        if report.accepted.is_empty() {
            return Err(JobFailure::new(
                FailureKind::NoValidInputFiles,
                format!(
                    "no valid input files ({} declared, {} rejected)",
                    report.total(),
                    report.rejected.len()
                ),
            ));
        }
        Ok(report)
    }

    async fn stage_one(&self, job_id: &str, remote: RemoteFile, dest: PathBuf) -> FileDescriptor {
        let remote_key = remote
            .file_key
            .clone()
            .unwrap_or_else(|| remote.file_name.clone());
        let rejected = |reason: String, size: u64| FileDescriptor {
            file_name: remote.file_name.clone(),
            remote_key: remote_key.clone(),
            local_path: dest.clone(),
            size,
            validation: ValidationRecord::rejected(&remote.file_name, size, reason),
        };

        if let Some(ref error) = remote.error {
            return rejected(format!("listing error: {}", error), 0);
        }
        let Some(ref url) = remote.download_url else {
            return rejected("no download URL".to_string(), 0);
        };

        tracing::debug!(job_id, file = %remote.file_name, "Downloading input");
        if let Err(e) = self.client.download(url, &dest, self.max_file_size).await {
            return rejected(format!("download failed: {}", e), 0);
        }

        let path = dest.clone();
        let name = remote.file_name.clone();
        let max = self.max_file_size;
        let validation =
            match tokio::task::spawn_blocking(move || validate_file(&path, &name, max)).await {
                Ok(v) => v,
                Err(e) => ValidationRecord::rejected(
                    &remote.file_name,
                    0,
                    format!("validation task failed: {}", e),
                ),
            };

        if !validation.valid {
            if let Err(e) = tokio::fs::remove_file(&dest).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %dest.display(), error = %e, "Failed to remove rejected input");
                }
            }
        }

        FileDescriptor {
            file_name: remote.file_name.clone(),
            remote_key,
            local_path: dest,
            size: validation.file_size,
            validation,
        }
    }
}

/// Check a staged file: presence, size bounds, extension allow-list and,
/// for rasters, that the header opens with positive dimensions.
pub fn validate_file(path: &Path, file_name: &str, max_file_size: u64) -> ValidationRecord {
    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return ValidationRecord::rejected(file_name, 0, "File does not exist"),
    };
    if size == 0 {
        return ValidationRecord::rejected(file_name, 0, "File is empty");
    }
    if size > max_file_size {
        return ValidationRecord::rejected(
            file_name,
            size,
            format!("File too large: {} > {}", size, max_file_size),
        );
    }

    let extension = extension_of(file_name);
    let allowed = RASTER_EXTENSIONS
        .iter()
        .chain(AUXILIARY_EXTENSIONS)
        .any(|e| *e == extension);
    if !allowed {
        let mut record =
            ValidationRecord::rejected(file_name, size, format!("Invalid extension: {}", extension));
        record.extension = Some(extension);
        return record;
    }

    let mut record = ValidationRecord {
        file_name: file_name.to_string(),
        valid: true,
        file_size: size,
        extension: Some(extension.clone()),
        ..Default::default()
    };

    if RASTER_EXTENSIONS.contains(&extension.as_str()) {
        match Dataset::open(path) {
            Ok(dataset) => {
                record.dimensions = Some([dataset.width, dataset.height]);
                record.bands = Some(dataset.bands);
                record.data_type = Some(dataset.data_type.clone());
                record.has_crs = Some(dataset.epsg.is_some());
                record.issues = raster_issues(&dataset);
            }
            Err(e) => {
                record.valid = false;
                record.error = Some(format!("Invalid GeoTIFF file: {}", e));
            }
        }
    }
    record
}

fn raster_issues(dataset: &Dataset) -> Vec<String> {
    let mut issues = Vec::new();
    if dataset.width > LARGE_DIMENSION || dataset.height > LARGE_DIMENSION {
        issues.push("Very large image dimensions may cause memory issues".to_string());
    }
    if dataset.bands > MANY_BANDS {
        issues.push("High number of bands may slow processing".to_string());
    }
    if dataset.epsg.is_none() {
        issues.push("No coordinate reference system (CRS) found".to_string());
    }
    if dataset.transform.is_none() {
        issues.push("No affine georeferencing found".to_string());
    }
    issues
}

fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

pub fn is_raster_name(file_name: &str) -> bool {
    RASTER_EXTENSIONS.contains(&extension_of(file_name).as_str())
}

/// Final path component of a listed name, made unique within the workspace.
fn local_file_name(listed: &str, index: usize, used: &mut HashSet<String>) -> String {
    let base = Path::new(listed)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .unwrap_or_else(|| format!("input_{}", index + 1));

    let name = if used.contains(&base) {
        format!("{}_{}", index + 1, base)
    } else {
        base
    };
    used.insert(name.clone());
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_names_are_sanitised_and_unique() {
        let mut used = HashSet::new();
        assert_eq!(local_file_name("../../etc/passwd", 0, &mut used), "passwd");
        assert_eq!(local_file_name("dir/scene.tif", 1, &mut used), "scene.tif");
        assert_eq!(local_file_name("other/scene.tif", 2, &mut used), "3_scene.tif");
        assert_eq!(local_file_name("..", 3, &mut used), "input_4");
    }

    #[test]
    fn extensions_are_case_insensitive() {
        assert!(is_raster_name("A.TIF"));
        assert!(is_raster_name("b.geotiff"));
        assert!(!is_raster_name("c.json"));
        assert_eq!(extension_of("noext"), "");
    }

    #[test]
    fn validation_rejections() {
        let dir = tempfile::tempdir().unwrap();

        let missing = validate_file(&dir.path().join("gone.tif"), "gone.tif", 1024);
        assert_eq!(missing.error.as_deref(), Some("File does not exist"));

        let empty = dir.path().join("empty.tif");
        std::fs::write(&empty, b"").unwrap();
        let record = validate_file(&empty, "empty.tif", 1024);
        assert!(!record.valid);
        assert_eq!(record.error.as_deref(), Some("File is empty"));

        let big = dir.path().join("big.json");
        std::fs::write(&big, vec![b'x'; 2048]).unwrap();
        let record = validate_file(&big, "big.json", 1024);
        assert_eq!(record.error.as_deref(), Some("File too large: 2048 > 1024"));

        let exe = dir.path().join("tool.exe");
        std::fs::write(&exe, b"MZ").unwrap();
        let record = validate_file(&exe, "tool.exe", 1024);
        assert_eq!(record.error.as_deref(), Some("Invalid extension: .exe"));

        let fake = dir.path().join("fake.tif");
        std::fs::write(&fake, b"not a tiff at all").unwrap();
        let record = validate_file(&fake, "fake.tif", 1024);
        assert!(!record.valid);
        assert!(record.error.unwrap().starts_with("Invalid GeoTIFF file"));
    }

    #[test]
    fn auxiliary_files_are_accepted_but_not_raster() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aoi.geojson");
        std::fs::write(&path, br#"{"type":"FeatureCollection","features":[]}"#).unwrap();

        let record = validate_file(&path, "aoi.geojson", 1024);
        assert!(record.valid);
        assert_eq!(record.extension.as_deref(), Some(".geojson"));

        let descriptor = FileDescriptor {
            file_name: "aoi.geojson".into(),
            remote_key: "in/aoi.geojson".into(),
            local_path: path,
            size: record.file_size,
            validation: record,
        };
        assert!(descriptor.is_valid());
        assert!(!descriptor.is_raster());
    }
}
