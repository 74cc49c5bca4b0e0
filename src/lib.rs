pub mod config;
pub mod error;
pub mod lease;
pub mod node;
pub mod pipeline;
pub mod publish;
pub mod raster;
pub mod shutdown;
pub mod staging;
pub mod worker;
