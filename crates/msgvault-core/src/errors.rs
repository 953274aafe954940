use std::{path::PathBuf, time::Duration};

/// Core error type for the pipeline.
///
/// Adapter crates map their transport-specific errors into this type so the
/// core can handle failures consistently (retry via the governor vs record
/// and skip vs abort the job).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The remote service asked us to back off (FloodWait). Always transient;
    /// callers report it to the [`crate::governor::RateGovernor`] and retry.
    #[error("rate limited by remote service, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// The same rate limit was reported past the configured retry ceiling.
    #[error("rate limit retry ceiling exceeded after {reports} consecutive reports")]
    RateLimitExceeded { reports: u32 },

    /// Network/timeout class failure, retried with bounded backoff.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The destination refused this specific content. Permanent for the item,
    /// recorded and skipped, never aborts the job.
    #[error("destination rejected content: {0}")]
    Rejected(String),

    /// Manifest corruption. Fatal: aborts the job and leaves on-disk state
    /// untouched for diagnosis.
    #[error("manifest corrupt: {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Convenience constructor for adapters surfacing a FloodWait in seconds.
    pub fn flood_wait(seconds: u64) -> Self {
        Error::RateLimited {
            retry_after: Duration::from_secs(seconds),
        }
    }

    /// True for failures that are worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
