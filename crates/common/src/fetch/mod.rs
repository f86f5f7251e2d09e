//! Bounded, retrying, cancellable fetching of many URLs.
//!
//! [`Fetcher`] is the transport seam: one attempt, one URL. The
//!  [`DownloadManager`] owns everything else (queueing, concurrency,
//!  backoff, per-attempt timeouts and cancellation).

mod fetcher;
mod manager;

pub use fetcher::{FetchError, Fetched, Fetcher};
pub use manager::{
    DownloadConfig, DownloadError, DownloadManager, DownloadStats, DownloadTask, FetchOutcome,
    RunReport, TaskStatus, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_BASE_DELAY,
};
