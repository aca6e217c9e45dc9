use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("scan root {0} does not exist")]
    RootNotFound(PathBuf),
    #[error("scan root {0} is not a directory")]
    RootNotDirectory(PathBuf),
    #[error(transparent)]
    Provider(#[from] providers::ProviderError),
    #[error("invalid exclude pattern: {0}")]
    Pattern(#[from] globset::Error),
}

#[derive(Debug, Error)]
pub enum MetricsServerError {
    #[error("invalid metrics address `{address}`: {source}")]
    InvalidAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind metrics endpoint to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}
