//! Per-job execution on a worker.
//!
//! - **Supervision**: [`JobSupervisor`] drives one claimed job through
//!   staging, processing and publishing, then sends exactly one terminal
//!   transition
//! - **Heartbeat**: [`HeartbeatSender`] keeps the job's lease alive while the
//!   supervisor works
//!
//! # Execution Flow
//!
//! 1. The worker loop claims a job and hands it to [`JobSupervisor::supervise`]
//! 2. Task type and payload are checked; failures here skip the heartbeat
//! 3. A workspace is created and the heartbeat task starts
//! 4. Inputs are staged, processed on a blocking thread and uploaded, all
//!    under the processing deadline, shutdown and lease-loss watch
//! 5. The heartbeat is stopped and joined, then `complete` or `fail` is sent
//! 6. The workspace is removed and a [`JobResolution`] returned
//!
//! # Lease Loss
//!
//! If no heartbeat has been accepted for longer than the lease timeout, the
//! queue has presumably handed the job to someone else. The supervisor stops
//! working on it and reports `lease_lost`.

pub mod heartbeat;
pub mod supervisor;

pub use heartbeat::{HeartbeatHandle, HeartbeatSender, HeartbeatStats};
pub use supervisor::{JobResolution, JobSupervisor, SupervisorState};
