//! Export jobs.
//!
//! A job turns extracted records, or a DID's blobs, into one or more
//!  `.tar.gz` bundles. Large jobs are split into parts that run one at a
//!  time so only a single part's payload is ever held in memory:
//!
//! ```text
//! for each part:
//!     fetch (blobs) / select (records)
//!       -> assemble bundle (+ manifest.json)
//!       -> picker, or fallback delivery
//!       -> PartResult + log entries
//! ```
//!
//! Progress and log entries are streamed as [`ExportEvent`]s while the job
//!  runs, and the collected log is returned with the finished [`ExportJob`].

mod archive;
mod controller;
pub mod events;
mod mime;
mod save;

pub use archive::{
    assemble, read_bundle, read_manifest, record_path, record_paths, sanitize_path, ArchiveEntry,
    ArchiveError, ExportKind, ExportManifest, PartInfo, BLOB_DIR, BUNDLE_EXTENSION, MANIFEST_NAME,
};
pub use controller::{
    export_stem, part_name, plan_parts, BlobPage, BlobSource, ExportController, ExportError,
    ExportJob, ExportSettings, JobState, PartResult, SourceError, DEFAULT_CHUNK_THRESHOLD,
};
pub use events::{EventSink, ExportEvent, JobLog, LogEntry, LogLevel, Progress};
pub use mime::{extension_for, FALLBACK_EXTENSION};
pub use save::{
    DirectoryDelivery, Delivery, LocationPicker, SaveError, SaveOutcome, SaveTargets,
};
