use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatSender, HeartbeatStats};
use crate::config::WorkerConfig;
use crate::error::JobFailure;
use crate::lease::{ErrorRecord, FailureKind, Job, LeaseClient, LeaseError, TaskType};
use crate::pipeline::{BatchCoordinator, JobOptions, PipelineOptions, PipelineRunner};
use crate::publish::{OutputPayload, ResultPublisher};
use crate::staging::{FileStager, Workspace};

/// Where a supervised job currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Claimed,
    Staging,
    Processing,
    Publishing,
    Completed,
    Failed,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SupervisorState::Claimed => "claimed",
            SupervisorState::Staging => "staging",
            SupervisorState::Processing => "processing",
            SupervisorState::Publishing => "publishing",
            SupervisorState::Completed => "completed",
            SupervisorState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// How a job ended.
#[derive(Debug, Clone)]
pub struct JobResolution {
    pub job_id: String,
    /// `Completed` or `Failed`
    pub state: SupervisorState,
    pub failure: Option<JobFailure>,
    pub artifact_keys: Vec<String>,
    /// Whether the terminal transition reached the queue
    pub delivered: bool,
    pub heartbeats: HeartbeatStats,
    pub elapsed: Duration,
}

impl JobResolution {
    pub fn is_completed(&self) -> bool {
        self.state == SupervisorState::Completed
    }
}

type WorkResult = Result<(OutputPayload, Vec<String>), JobFailure>;

/// Owns one job from claim to terminal transition.
///
/// On every path: the heartbeat task is stopped and joined before the single
/// `complete` or `fail` call, and the workspace is removed afterwards.
#[derive(Debug, Clone)]
pub struct JobSupervisor {
    config: Arc<WorkerConfig>,
    client: LeaseClient,
}

impl JobSupervisor {
    pub fn new(config: Arc<WorkerConfig>, client: LeaseClient) -> Self {
        Self { config, client }
    }

    pub async fn supervise(&self, job: Job, shutdown: CancellationToken) -> JobResolution {
        let started = Instant::now();
        tracing::info!(job_id = %job.id, task_type = %job.task_type, "Supervising job");

        let (state_tx, state_rx) = watch::channel(SupervisorState::Claimed);
        let mut workspace: Option<Workspace> = None;
        let mut heartbeats = HeartbeatStats::default();

        let result = self
            .drive(&job, &shutdown, &state_tx, &mut workspace, &mut heartbeats)
            .await;
        let last_state = *state_rx.borrow();

        let mut resolution = self.resolve(&job, result, last_state).await;
        resolution.heartbeats = heartbeats;

        if let Some(mut ws) = workspace {
            if let Err(e) = ws.cleanup() {
                tracing::warn!(job_id = %job.id, path = %ws.root().display(), error = %e, "Workspace cleanup failed");
            }
        }

        resolution.elapsed = started.elapsed();
        tracing::info!(
            job_id = %job.id,
            state = %resolution.state,
            delivered = resolution.delivered,
            heartbeats = resolution.heartbeats.sent,
            elapsed_ms = resolution.elapsed.as_millis() as u64,
            "Job resolved"
        );
        resolution
    }

    /// Everything up to, but not including, the terminal call.
    async fn drive(
        &self,
        job: &Job,
        shutdown: &CancellationToken,
        state: &watch::Sender<SupervisorState>,
        workspace: &mut Option<Workspace>,
        heartbeats: &mut HeartbeatStats,
    ) -> WorkResult {
        let options = self.prepare(job)?;

        state.send_replace(SupervisorState::Staging);
        let ws: &Workspace = workspace.insert(
            Workspace::create(&self.config.temp_dir, &job.id)
                .map_err(|e| JobFailure::from_error(FailureKind::WorkspaceUnavailable, &e))?,
        );

        let heartbeat = HeartbeatSender::new(
            self.client.clone(),
            &job.id,
            &self.config.worker_id,
            self.config.heartbeat_interval(),
            self.config.lease_timeout(),
        )
        .spawn();
        let work_cancel = shutdown.child_token();
        let deadline = self.config.max_processing_time();

        let result = tokio::select! {
            r = tokio::time::timeout(deadline, self.execute(job, options, ws, state, &work_cancel)) => {
                r.unwrap_or_else(|_| Err(JobFailure::new(
                    FailureKind::DeadlineExceeded,
                    format!("processing exceeded {}ms", deadline.as_millis()),
                )))
            }
            _ = shutdown.cancelled() => {
                Err(JobFailure::new(FailureKind::Cancelled, "worker shutting down"))
            }
            _ = heartbeat.lease_lost() => {
                Err(JobFailure::new(
                    FailureKind::LeaseLost,
                    format!(
                        "no heartbeat accepted for longer than {}ms",
                        self.config.lease_timeout_ms
                    ),
                ))
            }
        };

        // Blocking work left behind by an abandoned future stops at its next check.
        work_cancel.cancel();
        *heartbeats = heartbeat.stop().await;
        match result {
            // Work that outlived its lease must not be reported as ours.
            Ok(_) if heartbeats.lease_lost => Err(JobFailure::new(
                FailureKind::LeaseLost,
                "heartbeat task stopped before the job finished",
            )),
            other => other,
        }
    }

    fn prepare(&self, job: &Job) -> Result<PipelineOptions, JobFailure> {
        if job.task_type != TaskType::GeotiffToPng {
            return Err(JobFailure::new(
                FailureKind::UnsupportedTaskType,
                format!("task type `{}` is not handled by this worker", job.task_type),
            ));
        }
        JobOptions::from_payload(&job.input_payload)
            .and_then(|opts| opts.resolve(&self.config.processing))
            .map_err(|e| JobFailure::from_error(FailureKind::InvalidPayload, &e))
    }

    async fn execute(
        &self,
        job: &Job,
        options: PipelineOptions,
        workspace: &Workspace,
        state: &watch::Sender<SupervisorState>,
        cancel: &CancellationToken,
    ) -> WorkResult {
        let worker_id = self.config.worker_id.as_str();

        self.client
            .progress(&job.id, worker_id, 10, "Downloading input files...")
            .await;
        let staging = FileStager::new(self.client.clone(), self.config.max_file_size)
            .stage(&job.id, workspace)
            .await?;

        state.send_replace(SupervisorState::Processing);
        self.client
            .progress(&job.id, worker_id, 30, "Processing GeoTIFF files...")
            .await;

        let coordinator = BatchCoordinator::new(PipelineRunner::new(options));
        let files = staging.accepted.clone();
        let output_root = workspace.output_dir();
        let token = cancel.clone();
        let batch = tokio::task::spawn_blocking(move || {
            coordinator.run_batch(&files, &output_root, &token)
        })
        .await
        .map_err(|e| JobFailure::from_error(FailureKind::Internal, &e))?;

        if cancel.is_cancelled() {
            return Err(JobFailure::new(FailureKind::Cancelled, "processing cancelled"));
        }
        if batch.succeeded == 0 {
            let mut failure = JobFailure::new(
                FailureKind::ProcessingFailed,
                format!(
                    "none of {} raster input(s) could be converted",
                    batch.files.len()
                ),
            );
            let details: Vec<String> = batch
                .files
                .iter()
                .flat_map(|f| f.errors.iter().map(move |e| format!("{}: {}", f.input_file, e)))
                .collect();
            if !details.is_empty() {
                failure.trace = format!("{}\n{}", failure.message, details.join("\n"));
            }
            return Err(failure);
        }

        state.send_replace(SupervisorState::Publishing);
        self.client
            .progress(&job.id, worker_id, 70, "Uploading output files...")
            .await;
        let (payload, report) = ResultPublisher::new(self.client.clone())
            .publish(job, worker_id, &staging, &batch)
            .await;

        if report.uploaded.is_empty() && report.attempted() > 0 {
            let details: Vec<String> = report
                .failures
                .iter()
                .map(|(name, reason)| format!("{}: {}", name, reason))
                .collect();
            let mut failure = JobFailure::new(
                FailureKind::UploadFailed,
                format!("all {} artifact upload(s) failed", report.attempted()),
            );
            failure.trace = format!("{}\n{}", failure.message, details.join("\n"));
            return Err(failure);
        }

        self.client
            .progress(&job.id, worker_id, 90, "Finalizing results...")
            .await;
        Ok((payload, report.keys()))
    }

    /// Send exactly one terminal transition for `result`.
    async fn resolve(
        &self,
        job: &Job,
        result: WorkResult,
        last_state: SupervisorState,
    ) -> JobResolution {
        let mut resolution = JobResolution {
            job_id: job.id.clone(),
            state: SupervisorState::Failed,
            failure: None,
            artifact_keys: Vec::new(),
            delivered: false,
            heartbeats: HeartbeatStats::default(),
            elapsed: Duration::ZERO,
        };

        match result {
            Ok((payload, keys)) => {
                resolution.delivered = self
                    .deliver(&job.id, "complete", || {
                        self.client.complete(&job.id, &payload, &keys)
                    })
                    .await;
                resolution.state = SupervisorState::Completed;
                resolution.artifact_keys = keys;
                tracing::info!(
                    job_id = %job.id,
                    artifacts = resolution.artifact_keys.len(),
                    "Job completed"
                );
            }
            Err(failure) => {
                tracing::error!(
                    job_id = %job.id,
                    kind = %failure.kind,
                    state = %last_state,
                    error = %failure.message,
                    "Job failed"
                );
                let record = ErrorRecord {
                    kind: failure.kind,
                    message: failure.message.clone(),
                    trace: failure.trace.clone(),
                    worker_id: self.config.worker_id.clone(),
                    failed_at: Utc::now(),
                    state: last_state.to_string(),
                };
                resolution.delivered = self
                    .deliver(&job.id, "fail", || self.client.fail(&job.id, &record))
                    .await;
                resolution.failure = Some(failure);
            }
        }
        resolution
    }

    /// Bounded retry of a terminal call. Client errors (4xx) are not retried.
    async fn deliver<F, Fut>(&self, job_id: &str, call: &str, mut send: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), LeaseError>>,
    {
        let attempts = self.config.terminal_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match send().await {
                Ok(()) => return true,
                Err(e) if attempt < attempts && is_retryable(&e) => {
                    tracing::warn!(job_id, call, attempt, error = %e, "Terminal call failed, retrying");
                    tokio::time::sleep(self.config.terminal_retry_delay()).await;
                }
                Err(e) => {
                    tracing::error!(
                        job_id,
                        call,
                        attempt,
                        error = %e,
                        alert = true,
                        "Terminal transition could not be delivered"
                    );
                    return false;
                }
            }
        }
        false
    }
}

fn is_retryable(err: &LeaseError) -> bool {
    match err {
        LeaseError::Transport { .. } => true,
        LeaseError::Status { status, .. } => *status >= 500,
        _ => false,
    }
}
