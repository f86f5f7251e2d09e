use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::mime::extension_for;
use crate::linked_data::to_json;
use crate::repo::{Record, WalkStats};
use crate::version::{build_info, TOOL_NAME};

pub const MANIFEST_NAME: &str = "manifest.json";
pub const BUNDLE_EXTENSION: &str = "tar.gz";
pub const BLOB_DIR: &str = "blobs";

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("entry path is empty after sanitising: {0:?}")]
    InvalidPath(String),
    #[error("duplicate entry path: {0}")]
    DuplicatePath(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    Repository,
    Blobs,
}

impl ExportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportKind::Repository => "repo",
            ExportKind::Blobs => "blobs",
        }
    }
}

/// One file inside a bundle
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub path: String,
    pub bytes: Bytes,
}

impl ArchiveEntry {
    pub fn new(path: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into(),
        }
    }

    /// `{collection}/{rkey}.json` holding the uri, cid and JSON-rendered value
    pub fn record(record: &Record) -> Result<Self, ArchiveError> {
        Self::record_at(record, record_path(record))
    }

    /// A record document written under an explicit path
    pub fn record_at(record: &Record, path: impl Into<String>) -> Result<Self, ArchiveError> {
        let document = serde_json::json!({
            "uri": record.uri,
            "cid": record.cid.to_string(),
            "value": to_json(&record.value),
        });
        let bytes = serde_json::to_vec_pretty(&document)?;
        Ok(Self::new(path, bytes))
    }

    /// `blobs/{cid}.{ext}`
    pub fn blob(cid: &str, content_type: Option<&str>, bytes: Bytes) -> Self {
        let ext = extension_for(content_type, &bytes);
        Self::new(format!("{}/{}.{}", BLOB_DIR, cid, ext), bytes)
    }
}

pub fn record_path(record: &Record) -> String {
    format!("{}/{}.json", record.collection, record.record_key)
}

/// Assign every record a distinct bundle path.
///
/// The first record for a `collection/rkey` keeps `{rkey}.json`; later
///  versions of the same key are written as `{rkey}.{cid}.json`.
pub fn record_paths(records: &[Record]) -> Vec<String> {
    let mut used = HashSet::with_capacity(records.len());
    records
        .iter()
        .map(|record| {
            let path = record_path(record);
            if used.insert(path.clone()) {
                return path;
            }
            let mut path = format!(
                "{}/{}.{}.json",
                record.collection, record.record_key, record.cid
            );
            let mut n = 2;
            while !used.insert(path.clone()) {
                path = format!(
                    "{}/{}.{}.{}.json",
                    record.collection, record.record_key, record.cid, n
                );
                n += 1;
            }
            path
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    /// 1-based
    pub index: usize,
    pub count: usize,
}

/// Written as `manifest.json` at the root of every bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub tool: String,
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub owner_id: Option<String>,
    pub kind: ExportKind,
    pub part: PartInfo,
    pub total_items: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_items: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub collections: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_blocks: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decode_errors: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walk: Option<WalkStats>,
}

impl ExportManifest {
    pub fn new(kind: ExportKind, owner_id: Option<String>, part: PartInfo) -> Self {
        let info = build_info();
        Self {
            tool: TOOL_NAME.to_string(),
            version: info.package_version.to_string(),
            exported_at: Utc::now(),
            owner_id,
            kind,
            part,
            total_items: 0,
            succeeded: 0,
            failed: 0,
            failed_items: Vec::new(),
            collections: BTreeMap::new(),
            total_blocks: None,
            decode_errors: None,
            walk: None,
        }
    }
}

/// Make an entry path safe to unpack: forward slashes only, no absolute
///  paths, no `.`/`..` components, no control characters.
pub fn sanitize_path(path: &str) -> Option<String> {
    let components: Vec<String> = path
        .split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .map(|c| {
            c.chars()
                .map(|ch| if ch.is_control() { '_' } else { ch })
                .collect()
        })
        .collect();

    if components.is_empty() {
        None
    } else {
        Some(components.join("/"))
    }
}

/// Build a gzip-compressed tar of `entries` plus the manifest, in memory.
///
/// Entries keep their given order; the manifest is written last.
pub fn assemble(entries: &[ArchiveEntry], manifest: &ExportManifest) -> Result<Vec<u8>, ArchiveError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mtime = manifest.exported_at.timestamp().max(0) as u64;

    let mut seen = HashSet::new();
    seen.insert(MANIFEST_NAME.to_string());

    for entry in entries {
        let path =
            sanitize_path(&entry.path).ok_or_else(|| ArchiveError::InvalidPath(entry.path.clone()))?;
        if !seen.insert(path.clone()) {
            return Err(ArchiveError::DuplicatePath(path));
        }
        append_file(&mut builder, &path, &entry.bytes, mtime)?;
    }

    let manifest_bytes = serde_json::to_vec_pretty(manifest)?;
    append_file(&mut builder, MANIFEST_NAME, &manifest_bytes, mtime)?;

    let encoder = builder.into_inner()?;
    let bytes = encoder.finish()?;
    tracing::debug!(
        entries = entries.len(),
        bytes = bytes.len(),
        "assembled bundle"
    );
    Ok(bytes)
}

fn append_file<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    bytes: &[u8],
    mtime: u64,
) -> Result<(), ArchiveError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    builder.append_data(&mut header, path, bytes)?;
    Ok(())
}

/// Read a bundle back into `(path, bytes)` pairs in archive order
pub fn read_bundle(bytes: &[u8]) -> Result<Vec<(String, Vec<u8>)>, ArchiveError> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut files = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.push((path, contents));
    }
    Ok(files)
}

/// Read just the manifest out of a bundle
pub fn read_manifest(bytes: &[u8]) -> Result<Option<ExportManifest>, ArchiveError> {
    let manifest = read_bundle(bytes)?
        .into_iter()
        .find(|(path, _)| path == MANIFEST_NAME)
        .map(|(_, contents)| serde_json::from_slice(&contents))
        .transpose()?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linked_data::{cid_for_dag_cbor, LinkedData};

    fn manifest() -> ExportManifest {
        ExportManifest::new(
            ExportKind::Repository,
            Some("did:plc:abc".to_string()),
            PartInfo { index: 1, count: 1 },
        )
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("a/b.json").as_deref(), Some("a/b.json"));
        assert_eq!(sanitize_path("/etc/passwd").as_deref(), Some("etc/passwd"));
        assert_eq!(sanitize_path("../../x").as_deref(), Some("x"));
        assert_eq!(sanitize_path("a\\b\\..\\c").as_deref(), Some("a/b/c"));
        assert_eq!(sanitize_path("bad\nname").as_deref(), Some("bad_name"));
        assert_eq!(sanitize_path("/../."), None);
    }

    #[test]
    fn test_bundle_contains_entries_and_manifest() {
        let record = Record::new(
            "did:plc:abc",
            "app.bsky.feed.post",
            "3k2a",
            cid_for_dag_cbor(b"post").unwrap(),
            LinkedData::Map(BTreeMap::from([
                ("$type".to_string(), LinkedData::String("app.bsky.feed.post".into())),
                ("text".to_string(), LinkedData::String("hello".into())),
            ])),
        );

        let entries = vec![
            ArchiveEntry::record(&record).unwrap(),
            ArchiveEntry::blob("bafkblob", Some("image/png"), Bytes::from_static(b"\x89PNG")),
        ];
        let mut manifest = manifest();
        manifest.total_items = 2;
        manifest.succeeded = 2;

        let bytes = assemble(&entries, &manifest).unwrap();
        let files = read_bundle(&bytes).unwrap();
        let names: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            names,
            vec!["app.bsky.feed.post/3k2a.json", "blobs/bafkblob.png", MANIFEST_NAME]
        );

        let doc: serde_json::Value = serde_json::from_slice(&files[0].1).unwrap();
        assert_eq!(doc["uri"], "at://did:plc:abc/app.bsky.feed.post/3k2a");
        assert_eq!(doc["value"]["text"], "hello");

        let read_back = read_manifest(&bytes).unwrap().unwrap();
        assert_eq!(read_back.tool, TOOL_NAME);
        assert_eq!(read_back.succeeded, 2);
        assert_eq!(read_back.owner_id.as_deref(), Some("did:plc:abc"));
    }

    #[test]
    fn test_duplicate_paths_rejected() {
        let entries = vec![
            ArchiveEntry::new("a/b", Bytes::from_static(b"1")),
            ArchiveEntry::new("/a/b", Bytes::from_static(b"2")),
        ];
        let err = assemble(&entries, &manifest()).unwrap_err();
        assert!(matches!(err, ArchiveError::DuplicatePath(p) if p == "a/b"));
    }

    #[test]
    fn test_record_paths_keep_first_version_of_a_key() {
        let version = |text: &str| {
            Record::new(
                "did:plc:abc",
                "app.bsky.actor.profile",
                "self",
                cid_for_dag_cbor(text.as_bytes()).unwrap(),
                LinkedData::String(text.into()),
            )
        };
        let current = version("new bio");
        let stale = version("old bio");
        let other = Record::new(
            "did:plc:abc",
            "app.bsky.feed.post",
            "self",
            cid_for_dag_cbor(b"post").unwrap(),
            LinkedData::Null,
        );

        let paths = record_paths(&[current, stale.clone(), other]);
        assert_eq!(paths[0], "app.bsky.actor.profile/self.json");
        assert_eq!(
            paths[1],
            format!("app.bsky.actor.profile/self.{}.json", stale.cid)
        );
        assert_eq!(paths[2], "app.bsky.feed.post/self.json");
    }

    #[test]
    fn test_manifest_name_is_reserved() {
        let entries = vec![ArchiveEntry::new(MANIFEST_NAME, Bytes::from_static(b"{}"))];
        assert!(matches!(
            assemble(&entries, &manifest()),
            Err(ArchiveError::DuplicatePath(_))
        ));
    }

    #[test]
    fn test_empty_bundle_has_manifest_only() {
        let bytes = assemble(&[], &manifest()).unwrap();
        let files = read_bundle(&bytes).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, MANIFEST_NAME);
    }
}
