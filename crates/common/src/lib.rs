/**
 * Thin wrapper around IPLD: CIDs, DAG-CBOR decoding,
 *  and rendering decoded values as JSON for export.
 */
pub mod linked_data;
/**
 * Repository reconstruction.
 *  - CAR block decoding into an in-memory store
 *  - Commit location and MST traversal back to records
 *  - Grouping of records by collection
 */
pub mod repo;
/**
 * Bounded-concurrency fetching with retry and backoff,
 *  used to pull blobs from a PDS.
 */
pub mod fetch;
/**
 * Export jobs: archive assembly, save targets and the
 *  chunked controller that ties a job together.
 */
pub mod export;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::export::{
        ExportController, ExportEvent, ExportJob, ExportSettings, JobState, LogEntry, LogLevel,
        PartResult, Progress,
    };
    pub use crate::fetch::{DownloadConfig, DownloadManager, FetchOutcome, Fetcher};
    pub use crate::linked_data::{Cid, CodecError, LinkedData};
    pub use crate::repo::{extract_records, Extraction, Record, RepositoryCommit};
    pub use crate::version::build_info;
}
