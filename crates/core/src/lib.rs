//! Helios pipeline core: file discovery, bounded queue, supervised inference
//! workers, adaptive batching and metrics.

pub mod batch;
pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod metrics_server;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod sink;
pub mod skip;
pub mod supervisor;
pub mod worker;

pub use error::{MetricsServerError, PipelineError};
pub use pipeline::{run, Collaborators, Pipeline};
pub use progress::{RunReport, RunStatus};
