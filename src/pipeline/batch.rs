use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::outcome::{BatchOutcome, FileOutcome};
use super::runner::{file_stem, PipelineRunner};
use crate::staging::FileDescriptor;

/// Runs the pipeline over every raster input of a job, one file at a time.
#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    runner: PipelineRunner,
}

impl BatchCoordinator {
    pub fn new(runner: PipelineRunner) -> Self {
        Self { runner }
    }

    /// Process each raster in `files` into `output_root/file_<n>_<stem>`.
    ///
    /// Non-raster inputs are skipped. A file that panics is recorded as
    /// failed and the batch moves on. Once `cancel` fires, remaining files are
    /// recorded as skipped.
    pub fn run_batch(
        &self,
        files: &[FileDescriptor],
        output_root: &Path,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        run_each(files, output_root, cancel, |file, output_dir| {
            self.runner.run(file, output_dir, cancel)
        })
    }
}

/// Drive `process` over each raster with per-file panic isolation.
fn run_each<F>(
    files: &[FileDescriptor],
    output_root: &Path,
    cancel: &CancellationToken,
    process: F,
) -> BatchOutcome
where
    F: Fn(&FileDescriptor, &Path) -> FileOutcome,
{
    let started = Instant::now();
    let rasters: Vec<&FileDescriptor> = files.iter().filter(|f| f.is_raster()).collect();
    let total = rasters.len();
    let mut batch = BatchOutcome::default();

    for (index, file) in rasters.into_iter().enumerate() {
        if cancel.is_cancelled() {
            batch.push(FileOutcome::skipped(
                &file.file_name,
                &file.remote_key,
                "cancelled",
            ));
            continue;
        }

        tracing::info!(
            file = %file.file_name,
            position = index + 1,
            total,
            "Starting file"
        );
        let output_dir =
            output_root.join(format!("file_{}_{}", index + 1, file_stem(&file.file_name)));

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| process(file, &output_dir)))
            .unwrap_or_else(|payload| {
                let reason = format!("processing panicked: {}", panic_message(&*payload));
                tracing::error!(file = %file.file_name, reason, "File processing panicked");
                FileOutcome::skipped(&file.file_name, &file.remote_key, reason)
            });
        batch.push(outcome);
    }

    batch.elapsed = started.elapsed();
    tracing::info!(
        succeeded = batch.succeeded,
        failed = batch.failed,
        artifacts = batch.artifact_count(),
        elapsed_ms = batch.elapsed.as_millis() as u64,
        "Batch finished"
    );
    batch
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
