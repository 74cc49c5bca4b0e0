//! Client side of the job queue's lease protocol.
//!
//! The queue backend owns job state and the atomic claim primitive. This
//! worker only ever moves a job forward through these calls:
//!
//! - **claim**: lease one unclaimed job (`None` when the queue is empty)
//! - **heartbeat**: extend the lease while work is in flight
//! - **progress**: advisory percentage updates, failures swallowed
//! - **complete** / **fail**: terminal transitions, sent exactly once per job
//!
//! The same client also performs the file-transfer exchanges (input listing,
//! download, upload-URL, upload) used by staging and publishing.

pub mod client;
pub mod job;

pub use client::{LeaseClient, LeaseError, RemoteFile, UploadRequest, UploadTicket};
pub use job::{ErrorRecord, FailureKind, Job, JobStatus, TaskType};
