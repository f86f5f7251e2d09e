//! Shared fixtures for pipeline integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use common::export::{BlobPage, BlobSource, SourceError};
use common::fetch::{FetchError, Fetched, Fetcher};
use common::linked_data::{cid_for_dag_cbor, encode_dag_cbor, Cid, LinkedData};
use iroh_car::{CarHeader, CarWriter};
use tokio_util::sync::CancellationToken;
use url::Url;

pub const DID: &str = "did:plc:fixture";

/// Builds a small but well-formed repository archive: records, one flat
///  MST node over them, and a commit.
pub struct RepoFixture {
    did: String,
    records: Vec<(String, String, String)>,
    orphans: Vec<(String, String, String)>,
    garbage_blocks: usize,
    with_commit: bool,
}

impl RepoFixture {
    pub fn new() -> Self {
        Self {
            did: DID.to_string(),
            records: Vec::new(),
            orphans: Vec::new(),
            garbage_blocks: 0,
            with_commit: true,
        }
    }

    pub fn record(mut self, collection: &str, rkey: &str, text: &str) -> Self {
        self.records
            .push((collection.to_string(), rkey.to_string(), text.to_string()));
        self
    }

    /// `n` posts with keys `000000`, `000001`, ...
    pub fn posts(mut self, n: usize) -> Self {
        for i in 0..n {
            self = self.record("app.bsky.feed.post", &format!("{:06}", i), &format!("post {}", i));
        }
        self
    }

    /// A record only reachable from a node the commit never points at
    pub fn orphan(mut self, collection: &str, rkey: &str, text: &str) -> Self {
        self.orphans
            .push((collection.to_string(), rkey.to_string(), text.to_string()));
        self
    }

    pub fn garbage(mut self, n: usize) -> Self {
        self.garbage_blocks = n;
        self
    }

    pub fn without_commit(mut self) -> Self {
        self.with_commit = false;
        self
    }

    pub fn blocks(&self) -> (Vec<Cid>, Vec<(Cid, Vec<u8>)>) {
        let mut blocks = Vec::new();

        let root = mst_node(&self.records, &mut blocks);
        if !self.orphans.is_empty() {
            mst_node(&self.orphans, &mut blocks);
        }

        for i in 0..self.garbage_blocks {
            let bytes = vec![0xff, 0xfe, i as u8];
            let cid = cid_for_dag_cbor(&bytes).unwrap();
            blocks.push((cid, bytes));
        }

        let mut roots = Vec::new();
        if self.with_commit {
            let commit = map([
                ("did", LinkedData::String(self.did.clone())),
                ("version", LinkedData::Integer(3)),
                ("data", LinkedData::Link(root)),
                ("rev", LinkedData::String("3kabc".into())),
                ("prev", LinkedData::Null),
            ]);
            roots.push(put(&commit, &mut blocks));
        } else {
            roots.push(root);
        }

        (roots, blocks)
    }

    pub async fn to_car(&self) -> Vec<u8> {
        let (roots, blocks) = self.blocks();
        let mut out = Vec::new();
        let mut writer = CarWriter::new(CarHeader::new_v1(roots), &mut out);
        for (cid, data) in &blocks {
            writer.write(*cid, data).await.unwrap();
        }
        writer.finish().await.unwrap();
        out
    }
}

pub fn map<const N: usize>(fields: [(&str, LinkedData); N]) -> LinkedData {
    LinkedData::Map(
        fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn put(value: &LinkedData, blocks: &mut Vec<(Cid, Vec<u8>)>) -> Cid {
    let bytes = encode_dag_cbor(value).unwrap();
    let cid = cid_for_dag_cbor(&bytes).unwrap();
    blocks.push((cid, bytes));
    cid
}

/// One node holding every record, keys prefix-compressed in sorted order
fn mst_node(records: &[(String, String, String)], blocks: &mut Vec<(Cid, Vec<u8>)>) -> Cid {
    let mut sorted: Vec<_> = records.iter().collect();
    sorted.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

    let mut previous: Vec<u8> = Vec::new();
    let mut entries = Vec::new();
    for (collection, rkey, text) in sorted {
        let value = map([
            ("$type", LinkedData::String(collection.clone())),
            ("text", LinkedData::String(text.clone())),
        ]);
        let cid = put(&value, blocks);

        let key = format!("{}/{}", collection, rkey).into_bytes();
        let shared = previous
            .iter()
            .zip(key.iter())
            .take_while(|(a, b)| a == b)
            .count();
        entries.push(map([
            ("p", LinkedData::Integer(shared as i128)),
            ("k", LinkedData::Bytes(key[shared..].to_vec())),
            ("v", LinkedData::Link(cid)),
            ("t", LinkedData::Null),
        ]));
        previous = key;
    }

    let node = map([("l", LinkedData::Null), ("e", LinkedData::List(entries))]);
    put(&node, blocks)
}

/// Blob listing served from fixed pages; the cursor is the next page index
pub struct PagedSource {
    pages: Vec<Vec<String>>,
}

impl PagedSource {
    pub fn new(pages: Vec<Vec<&str>>) -> Self {
        Self {
            pages: pages
                .into_iter()
                .map(|page| page.into_iter().map(str::to_string).collect())
                .collect(),
        }
    }

    pub fn numbered(count: usize, page_size: usize) -> Self {
        let ids: Vec<String> = (0..count).map(|i| format!("blob{}", i)).collect();
        Self {
            pages: ids.chunks(page_size.max(1)).map(|c| c.to_vec()).collect(),
        }
    }
}

#[async_trait]
impl BlobSource for PagedSource {
    async fn list_blobs(&self, _did: &str, cursor: Option<&str>) -> Result<BlobPage, SourceError> {
        let index: usize = match cursor {
            Some(c) => c.parse().map_err(SourceError::new)?,
            None => 0,
        };
        let cids = self.pages.get(index).cloned().unwrap_or_default();
        let cursor = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        Ok(BlobPage { cids, cursor })
    }

    fn blob_url(&self, _did: &str, cid: &str) -> Result<Url, SourceError> {
        Url::parse(&format!("https://pds.test/blob/{}", cid)).map_err(SourceError::new)
    }
}

/// Serves `blob{n}` style ids as PNG bytes, with optional missing ids and a
///  token to trip when a given id is requested
#[derive(Default)]
pub struct MemoryFetcher {
    missing: Vec<String>,
    cancel_on: Option<(String, CancellationToken)>,
    requested: Mutex<Vec<String>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing(mut self, id: &str) -> Self {
        self.missing.push(id.to_string());
        self
    }

    pub fn cancel_on(mut self, id: &str, token: CancellationToken) -> Self {
        self.cancel_on = Some((id.to_string(), token));
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }

    pub fn request_counts(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for id in self.requested() {
            *counts.entry(id).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, url: &Url) -> Result<Fetched, FetchError> {
        let id = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or_default()
            .to_string();
        self.requested.lock().unwrap().push(id.clone());

        if let Some((trigger, token)) = &self.cancel_on {
            if *trigger == id {
                token.cancel();
            }
        }
        tokio::task::yield_now().await;

        if self.missing.contains(&id) {
            return Err(FetchError::Status(404));
        }
        let mut bytes = vec![0x89, b'P', b'N', b'G'];
        bytes.extend_from_slice(id.as_bytes());
        Ok(Fetched {
            bytes: Bytes::from(bytes),
            content_type: Some("image/png".to_string()),
        })
    }
}
