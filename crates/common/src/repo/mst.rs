use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::block_store::BlockStore;
use super::shape::{as_mst_node, looks_like_mst_node, MstNode};
use crate::linked_data::{str_field, Cid, LinkedData};

/// Separator between collection and record key in an MST key
pub const KEY_SEPARATOR: char = '/';

/// A record recovered from the tree.
///  Identity is the cid; collection and key come from its tree position.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub cid: Cid,
    pub collection: String,
    pub record_key: String,
    pub uri: String,
    pub value: LinkedData,
}

impl Record {
    pub fn new(
        owner_id: &str,
        collection: impl Into<String>,
        record_key: impl Into<String>,
        cid: Cid,
        value: LinkedData,
    ) -> Self {
        let collection = collection.into();
        let record_key = record_key.into();
        Self {
            uri: record_uri(owner_id, &collection, &record_key),
            cid,
            collection,
            record_key,
            value,
        }
    }

    /// The record's `$type`, if it declares one
    pub fn record_type(&self) -> Option<&str> {
        str_field(&self.value, "$type")
    }
}

/// `at://{owner}/{collection}/{rkey}`
pub fn record_uri(owner_id: &str, collection: &str, record_key: &str) -> String {
    format!("at://{}/{}/{}", owner_id, collection, record_key)
}

/// Split a full MST key into `(collection, record_key)`.
///  Keys need exactly one separator with something on both sides.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (collection, record_key) = key.split_once(KEY_SEPARATOR)?;
    if collection.is_empty() || record_key.is_empty() || record_key.contains(KEY_SEPARATOR) {
        return None;
    }
    Some((collection, record_key))
}

/// Records keyed by cid, kept in first-insertion order.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    records: Vec<Record>,
    index: HashMap<Cid, usize>,
}

impl RecordSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record. A record with the same cid is replaced in place;
    ///  returns true only when the cid was new.
    pub fn insert(&mut self, record: Record) -> bool {
        match self.index.get(&record.cid) {
            Some(&slot) => {
                self.records[slot] = record;
                false
            }
            None => {
                self.index.insert(record.cid, self.records.len());
                self.records.push(record);
                true
            }
        }
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.index.contains_key(cid)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn as_slice(&self) -> &[Record] {
        &self.records
    }

    pub fn into_vec(self) -> Vec<Record> {
        self.records
    }
}

/// Anomalies and counters gathered during a walk. None of these abort it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkStats {
    pub nodes_visited: usize,
    pub records_emitted: usize,
    pub duplicate_records: usize,
    pub missing_blocks: usize,
    pub undecodable_blocks: usize,
    pub malformed_keys: usize,
    pub revisited_nodes: usize,
    pub orphan_subtrees: usize,
}

struct Pending {
    cid: Cid,
    prefix: Vec<u8>,
}

/// Walks MST nodes held in a [`BlockStore`] and rebuilds records.
///
/// Traversal uses an explicit stack plus a visited set, so deep or cyclic
///  archives cannot blow the call stack or loop forever.
pub struct MstWalker<'a> {
    store: &'a BlockStore,
    owner_id: String,
    visited: HashSet<Cid>,
    records: RecordSet,
    stats: WalkStats,
}

impl<'a> MstWalker<'a> {
    pub fn new(store: &'a BlockStore, owner_id: impl Into<String>) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
            visited: HashSet::new(),
            records: RecordSet::new(),
            stats: WalkStats::default(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn is_visited(&self, cid: &Cid) -> bool {
        self.visited.contains(cid)
    }

    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    pub fn stats(&self) -> &WalkStats {
        &self.stats
    }

    /// Walk the tree rooted at `root`, with `prefix` seeding key reconstruction
    pub fn walk(&mut self, root: Cid, prefix: &[u8]) {
        self.drain(vec![Pending {
            cid: root,
            prefix: prefix.to_vec(),
        }]);
    }

    /// Walk a node value already in hand (it has no cid of its own here,
    ///  so only its children are tracked as visited)
    pub fn walk_node(&mut self, node: &MstNode, prefix: &[u8]) {
        let mut stack = Vec::new();
        self.process_node(node, prefix, &mut stack);
        self.drain(stack);
    }

    /// Walk every MST-shaped block the walks so far never reached, starting
    ///  each with an empty prefix. Returns how many orphan subtrees were found.
    pub fn scan_unvisited(&mut self) -> usize {
        let store = self.store;
        let mut found = 0;

        for block in store.iter() {
            let cid = *block.cid();
            if self.visited.contains(&cid) {
                continue;
            }
            if !block.decoded().is_some_and(looks_like_mst_node) {
                continue;
            }

            let before = self.records.len();
            self.walk(cid, &[]);
            found += 1;
            tracing::debug!(
                subtree = %cid,
                new_records = self.records.len() - before,
                "walked orphan subtree"
            );
        }

        self.stats.orphan_subtrees += found;
        found
    }

    pub fn finish(self) -> (RecordSet, WalkStats) {
        (self.records, self.stats)
    }

    fn drain(&mut self, mut stack: Vec<Pending>) {
        let store = self.store;

        while let Some(Pending { cid, prefix }) = stack.pop() {
            if !self.visited.insert(cid) {
                self.stats.revisited_nodes += 1;
                continue;
            }

            let Some(block) = store.get(&cid) else {
                self.stats.missing_blocks += 1;
                tracing::debug!("mst walk: missing block {}", cid);
                continue;
            };
            let Some(value) = block.decoded() else {
                self.stats.undecodable_blocks += 1;
                continue;
            };
            let Some(node) = as_mst_node(value) else {
                tracing::debug!("mst walk: {} is not a tree node", cid);
                continue;
            };

            self.process_node(&node, &prefix, &mut stack);
        }
    }

    /// Handle one node: entries are resolved in order against a running key,
    ///  child subtrees are pushed so the left side is popped first.
    fn process_node(&mut self, node: &MstNode, prefix: &[u8], stack: &mut Vec<Pending>) {
        let store = self.store;
        self.stats.nodes_visited += 1;

        let mut children = Vec::new();
        if let Some(left) = node.left {
            children.push(Pending {
                cid: left,
                prefix: prefix.to_vec(),
            });
        }

        let mut current_key = prefix.to_vec();
        for entry in &node.entries {
            // the prefix is shared with the running key, not the node prefix
            let shared = entry.prefix_len.min(current_key.len());
            let mut key = current_key[..shared].to_vec();
            key.extend_from_slice(&entry.key_suffix);
            current_key.clone_from(&key);

            match store.get(&entry.value).map(|block| block.decoded()) {
                None => {
                    self.stats.missing_blocks += 1;
                }
                Some(None) => {
                    self.stats.undecodable_blocks += 1;
                }
                Some(Some(value)) if looks_like_mst_node(value) => {
                    children.push(Pending {
                        cid: entry.value,
                        prefix: key,
                    });
                }
                Some(Some(value)) if str_field(value, "$type").is_some() => {
                    self.emit(entry.value, &key, value);
                }
                Some(Some(_)) => {}
            }

            if let Some(tree) = entry.tree {
                children.push(Pending {
                    cid: tree,
                    prefix: prefix.to_vec(),
                });
            }
        }

        if let Some(right) = node.right {
            children.push(Pending {
                cid: right,
                prefix: prefix.to_vec(),
            });
        }

        stack.extend(children.into_iter().rev());
    }

    fn emit(&mut self, cid: Cid, key: &[u8], value: &LinkedData) {
        let Some((collection, record_key)) = std::str::from_utf8(key).ok().and_then(split_key)
        else {
            self.stats.malformed_keys += 1;
            tracing::debug!(
                key = %String::from_utf8_lossy(key),
                "mst walk: skipping malformed key"
            );
            return;
        };

        let record = Record::new(&self.owner_id, collection, record_key, cid, value.clone());
        if self.records.insert(record) {
            self.stats.records_emitted += 1;
        } else {
            self.stats.duplicate_records += 1;
        }
    }
}
