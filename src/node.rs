use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::lease::LeaseClient;
use crate::worker::{JobResolution, JobSupervisor};

/// Counters for one run of the worker loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    /// Terminal transitions that never reached the queue
    pub undelivered: u64,
    pub claim_errors: u64,
}

impl LoopSummary {
    fn record(&mut self, joined: std::result::Result<JobResolution, JoinError>) {
        match joined {
            Ok(resolution) => {
                if resolution.is_completed() {
                    self.completed += 1;
                } else {
                    self.failed += 1;
                }
                if !resolution.delivered {
                    self.undelivered += 1;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Job supervisor task panicked");
                self.failed += 1;
                self.undelivered += 1;
            }
        }
    }
}

/// A worker process: one lease client, one supervisor template, one loop.
pub struct Node {
    config: Arc<WorkerConfig>,
    client: LeaseClient,
    supervisor: JobSupervisor,
}

impl Node {
    /// Validate `config` and build the shared HTTP client.
    pub fn new(config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let client = LeaseClient::new(&config)?;
        let config = Arc::new(config);
        let supervisor = JobSupervisor::new(config.clone(), client.clone());
        Ok(Self {
            config,
            client,
            supervisor,
        })
    }

    /// Run until `shutdown` fires, then drain in-flight jobs.
    pub async fn run(self, shutdown: CancellationToken) -> LoopSummary {
        tracing::info!(
            worker_id = %self.config.worker_id,
            api = %self.config.api_base_url,
            concurrency = self.config.max_concurrent_jobs,
            poll_ms = self.config.poll_interval_ms,
            "Worker starting"
        );
        let summary = self.worker_loop(shutdown).await;
        tracing::info!(
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed,
            undelivered = summary.undelivered,
            "Worker stopped"
        );
        summary
    }

    /// Claim loop.
    ///
    /// Claims only while a supervisor slot is free. An empty queue sleeps for
    /// the poll interval; a failed claim backs off for twice that. Sleeps end
    /// early on shutdown. On shutdown the loop stops claiming and waits for
    /// running supervisors, which observe the same token and fail their jobs
    /// as `cancelled`.
    pub async fn worker_loop(&self, shutdown: CancellationToken) -> LoopSummary {
        let max_jobs = self.config.max_concurrent_jobs.max(1);
        let mut running: JoinSet<JobResolution> = JoinSet::new();
        let mut summary = LoopSummary::default();

        loop {
            while let Some(joined) = running.try_join_next() {
                summary.record(joined);
            }
            if shutdown.is_cancelled() {
                break;
            }

            if running.len() >= max_jobs {
                tokio::select! {
                    Some(joined) = running.join_next() => summary.record(joined),
                    _ = shutdown.cancelled() => break,
                }
                continue;
            }

            match self.client.claim(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    summary.claimed += 1;
                    let supervisor = self.supervisor.clone();
                    let token = shutdown.clone();
                    running.spawn(async move { supervisor.supervise(job, token).await });
                }
                Ok(None) => {
                    sleep_or_shutdown(self.config.poll_interval(), &shutdown).await;
                }
                Err(e) => {
                    summary.claim_errors += 1;
                    tracing::error!(
                        error = %e,
                        backoff_ms = self.config.error_backoff().as_millis() as u64,
                        "Claim failed"
                    );
                    sleep_or_shutdown(self.config.error_backoff(), &shutdown).await;
                }
            }
        }

        if !running.is_empty() {
            tracing::info!(in_flight = running.len(), "Draining in-flight jobs");
        }
        while let Some(joined) = running.join_next().await {
            summary.record(joined);
        }
        summary
    }
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.cancelled() => {}
    }
}
