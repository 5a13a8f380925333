use thiserror::Error;

use plm_core::scanner::ScanError;
use plm_core::StoreError;

pub type Result<T> = std::result::Result<T, AnalyzeError>;

#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("analysis job already in progress")]
    AlreadyRunning,

    #[error("scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("analysis cache write failed: {0}")]
    Cache(#[source] StoreError),

    #[error("no source files match the request")]
    NoMatchingFiles,

    #[error("no async runtime available to run the job")]
    NoRuntime,

    #[error("analysis task failed: {0}")]
    Join(String),
}

