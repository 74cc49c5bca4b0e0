//! Per-file raster processing.
//!
//! A job's staged inputs flow through two layers:
//!
//! - [`BatchCoordinator`] walks every raster input sequentially, giving each
//!   its own output directory and containing panics to the file that raised
//!   them.
//! - [`PipelineRunner`] applies the ordered stages (metadata, convert,
//!   georeference, thumbnail, statistics) to one file. Stage failures are
//!   recorded, never propagated.
//!
//! Both return outcome values ([`FileOutcome`], [`BatchOutcome`]) rather than
//! errors; deciding whether a job failed is the supervisor's call.
//!
//! Everything here is synchronous and CPU-bound. Callers run it on a
//! blocking thread.

pub mod batch;
pub mod options;
pub mod outcome;
pub mod runner;
pub mod stages;

pub use batch::BatchCoordinator;
pub use options::{JobOptions, OptionsError, PipelineOptions};
pub use outcome::{BatchOutcome, FileOutcome, Stage, StageOutcome};
pub use runner::PipelineRunner;
pub use stages::{RasterMetadata, Statistics};
