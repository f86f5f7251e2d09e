use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::archive::{
    assemble, record_path, record_paths, ArchiveEntry, ArchiveError, ExportKind, ExportManifest,
    PartInfo, BUNDLE_EXTENSION,
};
use super::events::{EventSink, JobLog, LogEntry};
use super::save::{SaveOutcome, SaveTargets};
use crate::fetch::{DownloadError, DownloadManager};
use crate::repo::{collection_counts, Extraction};

pub const DEFAULT_CHUNK_THRESHOLD: usize = 1000;

/// Upper bound on listing pages, guards against a source that keeps
///  handing back the same cursor
const MAX_LIST_PAGES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSettings {
    /// Jobs with more items than this are split into parts of at most this size
    pub chunk_threshold: usize,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Complete,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartResult {
    /// 1-based
    pub index: usize,
    pub total_in_part: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Where the bundle went; `None` if the save was declined or failed
    pub saved_as: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    pub kind: ExportKind,
    pub parts: Vec<PartResult>,
    pub logs: Vec<LogEntry>,
    pub state: JobState,
    /// Items that did not make it into a bundle
    pub failed_count: usize,
}

impl ExportJob {
    pub fn succeeded_count(&self) -> usize {
        self.parts.iter().map(|p| p.succeeded).sum()
    }

    pub fn saved_parts(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| p.saved_as.as_deref())
    }
}

/// One page of a blob listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobPage {
    pub cids: Vec<String>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("blob source error: {0}")]
pub struct SourceError(pub String);

impl SourceError {
    pub fn new(err: impl fmt::Display) -> Self {
        Self(err.to_string())
    }
}

/// Where blob identifiers and blob URLs come from
#[async_trait]
pub trait BlobSource: Send + Sync {
    async fn list_blobs(&self, did: &str, cursor: Option<&str>) -> Result<BlobPage, SourceError>;

    fn blob_url(&self, did: &str, cid: &str) -> Result<Url, SourceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("no save location or fallback delivery available")]
    NoSaveTarget,
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("source error: {0}")]
    Source(#[from] SourceError),
    #[error("download error: {0}")]
    Download(#[from] DownloadError),
}

/// Split `total` items into part ranges. Zero items still make one
///  (empty) part.
pub fn plan_parts(total: usize, threshold: usize) -> Vec<Range<usize>> {
    let threshold = threshold.max(1);
    if total <= threshold {
        return vec![0..total];
    }
    (0..total)
        .step_by(threshold)
        .map(|start| start..(start + threshold).min(total))
        .collect()
}

/// `{stem}.tar.gz` for a single bundle, `{stem}_part_{NN}_of_{MM}.tar.gz`
///  otherwise. Numbers are padded to at least two digits.
pub fn part_name(stem: &str, index: usize, count: usize) -> String {
    if count <= 1 {
        return format!("{}.{}", stem, BUNDLE_EXTENSION);
    }
    let width = count.to_string().len().max(2);
    format!(
        "{}_part_{:0width$}_of_{:0width$}.{}",
        stem,
        index,
        count,
        BUNDLE_EXTENSION,
        width = width
    )
}

/// `did:plc:abc` + repo -> `did_plc_abc_repo_20240101T120000Z`
pub fn export_stem(owner_id: Option<&str>, kind: ExportKind) -> String {
    let owner: String = owner_id
        .unwrap_or("unknown")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!(
        "{}_{}_{}",
        owner,
        kind.as_str(),
        Utc::now().format("%Y%m%dT%H%M%SZ")
    )
}

/// Drives a whole export: splits it into parts, runs them one after the
///  other, and hands each finished bundle to the save targets.
///
/// Only one part's payload is alive at a time. Item failures are counted,
///  never fatal; the job ends `Complete` or `Cancelled`.
pub struct ExportController {
    settings: ExportSettings,
    downloads: DownloadManager,
    targets: SaveTargets,
    events: EventSink,
}

impl ExportController {
    pub fn new(settings: ExportSettings, downloads: DownloadManager, targets: SaveTargets) -> Self {
        Self {
            settings,
            downloads,
            targets,
            events: EventSink::disabled(),
        }
    }

    /// Route job and download events to `sink`
    pub fn with_events(mut self, sink: EventSink) -> Self {
        self.downloads = self.downloads.with_events(sink.clone());
        self.events = sink;
        self
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    /// Bundle every extracted record, grouped by collection
    pub async fn export_records(
        &self,
        extraction: &Extraction,
        cancel: &CancellationToken,
    ) -> Result<ExportJob, ExportError> {
        if self.targets.is_empty() {
            return Err(ExportError::NoSaveTarget);
        }

        let kind = ExportKind::Repository;
        let mut log = JobLog::new(self.events.clone());
        let owner = extraction.owner_id.as_deref();
        let stem = export_stem(owner, kind);
        let records = &extraction.records;
        let parts = plan_parts(records.len(), self.settings.chunk_threshold);
        let count = parts.len();

        if extraction.commit.is_none() {
            log.warn("archive has no repository commit").await;
        }
        if extraction.decode_errors > 0 {
            log.warn(format!(
                "{} of {} block(s) could not be decoded",
                extraction.decode_errors, extraction.total_blocks
            ))
            .await;
        }
        let paths = record_paths(records);
        let superseded = records
            .iter()
            .zip(&paths)
            .filter(|(record, path)| **path != record_path(record))
            .count();
        if superseded > 0 {
            log.warn(format!(
                "{} record(s) share a collection and key with another version, \
                 written as {{rkey}}.{{cid}}.json",
                superseded
            ))
            .await;
        }
        log.info(format!(
            "exporting {} record(s) in {} part(s)",
            records.len(),
            count
        ))
        .await;

        let mut results = Vec::with_capacity(count);
        let mut state = JobState::Complete;

        for (i, range) in parts.into_iter().enumerate() {
            let index = i + 1;
            if cancel.is_cancelled() {
                state = JobState::Cancelled;
                break;
            }
            self.events
                .progress(i, count, format!("assembling part {}/{}", index, count))
                .await;

            let slice = &records[range.clone()];
            // group so each collection's files sit together in the tar
            let mut ordered: Vec<_> = slice.iter().zip(&paths[range]).collect();
            ordered.sort_by(|a, b| a.0.collection.cmp(&b.0.collection));
            let entries = ordered
                .into_iter()
                .map(|(record, path)| ArchiveEntry::record_at(record, path.as_str()))
                .collect::<Result<Vec<_>, _>>()?;

            let mut manifest = ExportManifest::new(
                kind,
                extraction.owner_id.clone(),
                PartInfo { index, count },
            );
            manifest.total_items = slice.len();
            manifest.succeeded = slice.len();
            manifest.collections = collection_counts(slice);
            manifest.total_blocks = Some(extraction.total_blocks);
            manifest.decode_errors = Some(extraction.decode_errors);
            manifest.walk = Some(extraction.stats);

            let bundle = assemble(&entries, &manifest)?;
            drop(entries);

            if cancel.is_cancelled() {
                state = JobState::Cancelled;
                break;
            }

            let name = part_name(&stem, index, count);
            let saved_as = self.save_part(&mut log, &name, &bundle).await;
            results.push(PartResult {
                index,
                total_in_part: slice.len(),
                succeeded: slice.len(),
                failed: 0,
                saved_as,
            });
        }

        self.finish(kind, results, log, state, count).await
    }

    /// List every blob of `did`, then fetch and bundle them part by part
    pub async fn export_blobs(
        &self,
        did: &str,
        source: &dyn BlobSource,
        cancel: &CancellationToken,
    ) -> Result<ExportJob, ExportError> {
        if self.targets.is_empty() {
            return Err(ExportError::NoSaveTarget);
        }

        let kind = ExportKind::Blobs;
        let mut log = JobLog::new(self.events.clone());

        let Some(cids) = self.list_all(did, source, &mut log, cancel).await? else {
            log.warn("export cancelled while listing blobs").await;
            return self.finish(kind, Vec::new(), log, JobState::Cancelled, 0).await;
        };

        if cids.is_empty() {
            log.info(format!("{} has no blobs", did)).await;
            return self.finish(kind, Vec::new(), log, JobState::Complete, 0).await;
        }

        let stem = export_stem(Some(did), kind);
        let parts = plan_parts(cids.len(), self.settings.chunk_threshold);
        let count = parts.len();
        log.info(format!(
            "exporting {} blob(s) in {} part(s)",
            cids.len(),
            count
        ))
        .await;

        let mut results = Vec::with_capacity(count);
        let mut state = JobState::Complete;

        for (i, range) in parts.into_iter().enumerate() {
            let index = i + 1;
            if cancel.is_cancelled() {
                state = JobState::Cancelled;
                break;
            }
            self.events
                .progress(i, count, format!("fetching part {}/{}", index, count))
                .await;

            let ids = cids[range].to_vec();
            let total_in_part = ids.len();
            let report = match self
                .downloads
                .run(ids, |cid| source.blob_url(did, cid), cancel)
                .await
            {
                Ok(report) => report,
                Err(DownloadError::Cancelled) => {
                    state = JobState::Cancelled;
                    break;
                }
                Err(err) => return Err(err.into()),
            };
            log.extend(report.logs);

            let mut entries = Vec::with_capacity(report.stats.succeeded);
            let mut failed_items = Vec::new();
            for outcome in report.outcomes {
                match outcome.data {
                    Some(data) => entries.push(ArchiveEntry::blob(
                        &outcome.id,
                        outcome.content_type.as_deref(),
                        data,
                    )),
                    None => failed_items.push(outcome.id),
                }
            }
            entries.sort_by(|a, b| a.path.cmp(&b.path));
            failed_items.sort();

            let succeeded = entries.len();
            let failed = failed_items.len();
            let mut manifest =
                ExportManifest::new(kind, Some(did.to_string()), PartInfo { index, count });
            manifest.total_items = total_in_part;
            manifest.succeeded = succeeded;
            manifest.failed = failed;
            manifest.failed_items = failed_items;

            let bundle = assemble(&entries, &manifest)?;
            drop(entries);

            if cancel.is_cancelled() {
                state = JobState::Cancelled;
                break;
            }

            if failed > 0 {
                log.warn(format!(
                    "part {}/{}: {} blob(s) could not be fetched",
                    index, count, failed
                ))
                .await;
            }
            let name = part_name(&stem, index, count);
            let saved_as = self.save_part(&mut log, &name, &bundle).await;
            results.push(PartResult {
                index,
                total_in_part,
                succeeded,
                failed,
                saved_as,
            });
        }

        self.finish(kind, results, log, state, count).await
    }

    /// Follow the listing cursor to the end. `None` when cancelled.
    async fn list_all(
        &self,
        did: &str,
        source: &dyn BlobSource,
        log: &mut JobLog,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<String>>, ExportError> {
        let mut seen = HashSet::new();
        let mut cids = Vec::new();
        let mut cursor: Option<String> = None;

        for page_number in 1..=MAX_LIST_PAGES {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let page = source.list_blobs(did, cursor.as_deref()).await?;
            let before = cids.len();
            for cid in page.cids {
                if seen.insert(cid.clone()) {
                    cids.push(cid);
                }
            }
            tracing::debug!(page = page_number, new = cids.len() - before, "listed blob page");
            self.events
                .progress(cids.len(), cids.len(), "listing blobs")
                .await;

            match page.cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => return Ok(Some(cids)),
            }
        }

        log.warn(format!(
            "stopped listing after {} pages, cursor never ended",
            MAX_LIST_PAGES
        ))
        .await;
        Ok(Some(cids))
    }

    async fn save_part(&self, log: &mut JobLog, name: &str, bundle: &[u8]) -> Option<String> {
        match self.targets.persist(name, bundle).await {
            Ok(SaveOutcome::Saved(location)) => {
                log.success(format!("saved {}", location)).await;
                Some(location)
            }
            Ok(SaveOutcome::Declined) => {
                log.warn(format!("save of {} declined, part skipped", name))
                    .await;
                None
            }
            Err(err) => {
                log.error(format!("could not save {}: {}", name, err)).await;
                None
            }
        }
    }

    async fn finish(
        &self,
        kind: ExportKind,
        parts: Vec<PartResult>,
        mut log: JobLog,
        state: JobState,
        planned: usize,
    ) -> Result<ExportJob, ExportError> {
        let failed_count = parts.iter().map(|p| p.failed).sum();
        let succeeded: usize = parts.iter().map(|p| p.succeeded).sum();

        match state {
            JobState::Complete => {
                log.success(format!(
                    "{} export complete: {} item(s) bundled, {} failed",
                    kind.as_str(),
                    succeeded,
                    failed_count
                ))
                .await;
                self.events.progress(planned, planned, "complete").await;
            }
            JobState::Cancelled => {
                log.warn(format!(
                    "{} export cancelled after {} of {} part(s)",
                    kind.as_str(),
                    parts.len(),
                    planned
                ))
                .await;
                self.events
                    .progress(parts.len(), planned, "cancelled")
                    .await;
            }
        }

        Ok(ExportJob {
            kind,
            parts,
            logs: log.into_entries(),
            state,
            failed_count,
        })
    }
}
