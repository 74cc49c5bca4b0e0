use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::lease::LeaseClient;

/// Counters reported when a heartbeat task is stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub sent: u32,
    pub failed: u32,
    pub lease_lost: bool,
}

/// Periodically extends the lease on one job.
///
/// Heartbeats are strictly sequential: the next tick is only awaited after
/// the previous request has finished, so at most one is ever in flight.
pub struct HeartbeatSender {
    client: LeaseClient,
    job_id: String,
    worker_id: String,
    interval: Duration,
    lease_timeout: Duration,
}

impl HeartbeatSender {
    pub fn new(
        client: LeaseClient,
        job_id: impl Into<String>,
        worker_id: impl Into<String>,
        interval: Duration,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            client,
            job_id: job_id.into(),
            worker_id: worker_id.into(),
            interval,
            lease_timeout,
        }
    }

    /// Start sending heartbeats on a background task.
    pub fn spawn(self) -> HeartbeatHandle {
        let stop = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        let task = tokio::spawn(self.run(stop.clone(), lease_lost.clone()));
        HeartbeatHandle {
            stop,
            lease_lost,
            task,
        }
    }

    async fn run(self, stop: CancellationToken, lease_lost: CancellationToken) -> HeartbeatStats {
        // Fires `lease_lost` if the task unwinds before returning.
        let abnormal_exit = lease_lost.clone().drop_guard();
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The claim itself renewed the lease.
        let mut last_renewed = Instant::now();
        let mut stats = HeartbeatStats::default();

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Not raced against `stop`: an in-flight heartbeat completes.
            match self.client.heartbeat(&self.job_id, &self.worker_id).await {
                Ok(()) => {
                    stats.sent += 1;
                    last_renewed = Instant::now();
                    tracing::debug!(job_id = %self.job_id, "Heartbeat sent");
                }
                Err(e) => {
                    stats.failed += 1;
                    let silent_for = last_renewed.elapsed();
                    tracing::warn!(
                        job_id = %self.job_id,
                        error = %e,
                        silent_ms = silent_for.as_millis() as u64,
                        "Heartbeat failed"
                    );
                    if silent_for > self.lease_timeout {
                        tracing::error!(
                            job_id = %self.job_id,
                            lease_timeout_ms = self.lease_timeout.as_millis() as u64,
                            "Lease presumed lost"
                        );
                        stats.lease_lost = true;
                        lease_lost.cancel();
                        break;
                    }
                }
            }
        }

        abnormal_exit.disarm();
        stats
    }
}

/// Control side of a running heartbeat task.
pub struct HeartbeatHandle {
    stop: CancellationToken,
    lease_lost: CancellationToken,
    task: JoinHandle<HeartbeatStats>,
}

impl HeartbeatHandle {
    /// Resolves once the task concludes the lease is gone.
    pub async fn lease_lost(&self) {
        self.lease_lost.cancelled().await
    }

    /// Stop the task and wait for it to exit. Any heartbeat already in
    /// flight finishes first; none is sent after this returns.
    pub async fn stop(self) -> HeartbeatStats {
        self.stop.cancel();
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                // Renewals stopped at an unknown point; the lease cannot be trusted.
                tracing::error!(error = %e, "Heartbeat task ended abnormally");
                HeartbeatStats {
                    lease_lost: true,
                    ..HeartbeatStats::default()
                }
            }
        }
    }
}
