//! Input staging for a claimed job.
//!
//! [`Workspace`] owns the job's temporary directory. [`FileStager`] resolves
//! the job's declared inputs through the queue API, streams each one into the
//! workspace under the size ceiling and validates it before anything else
//! touches it.

pub mod stager;
pub mod workspace;

pub use stager::{FileDescriptor, FileStager, StagingReport, ValidationRecord};
pub use workspace::Workspace;
