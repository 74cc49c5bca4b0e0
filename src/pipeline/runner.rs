use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::options::PipelineOptions;
use super::outcome::{FileOutcome, Stage, StageOutcome};
use super::stages::{self, RasterMetadata};
use crate::error::{Result, WorkerError};
use crate::raster::{Band, Dataset, RasterError};
use crate::staging::FileDescriptor;

/// Runs the ordered stages over one input file.
///
/// Stages are independent: a failing stage is recorded and the next one
/// still runs. The only exception is an input that cannot be opened at all,
/// in which case every planned stage is recorded with that error.
#[derive(Debug, Clone)]
pub struct PipelineRunner {
    options: PipelineOptions,
}

impl PipelineRunner {
    pub fn new(options: PipelineOptions) -> Self {
        Self { options }
    }

    /// Stages this runner will attempt, in order.
    pub fn planned_stages(&self) -> Vec<Stage> {
        let mut planned = vec![Stage::Metadata, Stage::Convert, Stage::Georeference];
        if self.options.thumbnail_size.is_some() {
            planned.push(Stage::Thumbnail);
        }
        if self.options.include_statistics {
            planned.push(Stage::Statistics);
        }
        planned
    }

    /// Process `file` into `output_dir`. Blocking; call from a blocking
    /// thread. `cancel` is checked before each stage.
    pub fn run(
        &self,
        file: &FileDescriptor,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> FileOutcome {
        tracing::info!(file = %file.file_name, output_dir = %output_dir.display(), "Processing file");

        let created = std::fs::create_dir_all(output_dir).map_err(WorkerError::from);
        // The workspace may already be gone if the job was abandoned meanwhile.
        if cancel.is_cancelled() {
            if created.is_ok() {
                remove_output_dir(output_dir);
            }
            return FileOutcome::skipped(&file.file_name, &file.remote_key, "cancelled");
        }

        let mut outcome = FileOutcome::new(&file.file_name, &file.remote_key);
        let opened =
            created.and_then(|_| Dataset::open(&file.local_path).map_err(WorkerError::from));
        let dataset = match opened {
            Ok(dataset) => dataset,
            Err(e) => {
                tracing::warn!(file = %file.file_name, error = %e, "Cannot open input");
                for stage in self.planned_stages() {
                    outcome.record(StageOutcome {
                        stage,
                        artifact: None,
                        elapsed: Duration::ZERO,
                        error: Some(e.to_string()),
                    });
                }
                return outcome;
            }
        };

        let stem = file_stem(&file.file_name);
        let opts = &self.options;
        let mut band = BandCache::new(&dataset);
        let mut record: Option<RasterMetadata> = None;
        let mut metadata_path: Option<PathBuf> = None;

        for stage in self.planned_stages() {
            if cancel.is_cancelled() {
                outcome.errors.push(format!("cancelled before {}", stage));
                outcome.skipped = Some("cancelled".to_string());
                break;
            }

            let result = timed(stage, || match stage {
                Stage::Metadata => {
                    let path = output_dir.join(format!("{}_metadata.json", stem));
                    let rec = stages::extract_metadata(
                        &dataset,
                        opts.reproject_bounds,
                        opts.compression_quality,
                    );
                    let written = stages::write_metadata(&rec, &path);
                    record = Some(rec);
                    written?;
                    metadata_path = Some(path.clone());
                    Ok(Some(path))
                }
                Stage::Convert => {
                    let path = output_dir.join(format!("{}.png", stem));
                    let (w, h) = stages::convert(
                        band.get()?,
                        &path,
                        opts.max_size,
                        opts.preserve_transparency,
                    )?;
                    tracing::debug!(file = %file.file_name, width = w, height = h, "Wrote image");
                    Ok(Some(path))
                }
                Stage::Georeference => {
                    let path = output_dir.join(format!("{}.pgw", stem));
                    stages::write_world_file(&dataset, &path)?;
                    Ok(Some(path))
                }
                Stage::Thumbnail => {
                    let size = opts.thumbnail_size.unwrap_or_default();
                    let path = output_dir.join(format!("{}_thumbnail.png", stem));
                    stages::thumbnail(band.get()?, &path, size, opts.preserve_transparency)?;
                    Ok(Some(path))
                }
                Stage::Statistics => {
                    let stats = stages::statistics(band.get()?)?;
                    if let Some(rec) = record.as_mut() {
                        rec.statistics = Some(stats);
                        if let Some(ref path) = metadata_path {
                            stages::write_metadata(rec, path)?;
                        }
                    }
                    Ok(None)
                }
            });
            outcome.record(result);
        }

        outcome.metadata = record;
        tracing::info!(
            file = %file.file_name,
            success = outcome.success,
            artifacts = outcome.artifacts.len(),
            errors = outcome.errors.len(),
            "File processed"
        );
        outcome
    }
}

/// Band 1, decoded on first use and shared by the stages that need pixels.
struct BandCache<'a> {
    dataset: &'a Dataset,
    band: Option<std::result::Result<Band, String>>,
}

impl<'a> BandCache<'a> {
    fn new(dataset: &'a Dataset) -> Self {
        Self {
            dataset,
            band: None,
        }
    }

    fn get(&mut self) -> Result<&Band> {
        let dataset = self.dataset;
        let loaded = self
            .band
            .get_or_insert_with(|| dataset.read_band1().map_err(|e| e.to_string()));
        loaded
            .as_ref()
            .map_err(|e| RasterError::Unreadable(e.clone()).into())
    }
}

fn timed(stage: Stage, f: impl FnOnce() -> Result<Option<PathBuf>>) -> StageOutcome {
    let started = Instant::now();
    let result = f();
    let elapsed = started.elapsed();
    match result {
        Ok(artifact) => StageOutcome {
            stage,
            artifact,
            elapsed,
            error: None,
        },
        Err(e) => {
            tracing::warn!(stage = %stage, error = %e, "Stage failed");
            StageOutcome {
                stage,
                artifact: None,
                elapsed,
                error: Some(e.to_string()),
            }
        }
    }
}

fn remove_output_dir(output_dir: &Path) {
    match std::fs::remove_dir_all(output_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(output_dir = %output_dir.display(), error = %e, "Failed to remove output directory")
        }
    }
}

/// File name without its final extension.
pub fn file_stem(file_name: &str) -> String {
    Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string())
}
