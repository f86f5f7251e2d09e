//! Repository reconstruction
//!
//! A repository archive is a CAR file: a header naming the commit, followed
//!  by `(CID, DAG-CBOR)` blocks. Records are not stored under their names;
//!  the collection and record key are only recoverable by walking the
//!  Merkle Search Tree the commit points at:
//!
//! ```text
//! Commit { did, data, rev }
//!            |
//!            v
//!        MST node { l, e: [ {p, k, v, t}, ... ] }
//!         /     |                  \
//!   left node  record (v)     subtree (t)
//! ```
//!
//! Each entry key is stored compressed against the key before it, so
//!  entries must be replayed in order. Pipeline:
//!
//! 1. [`decode_car`] builds a [`BlockStore`]
//! 2. [`locate_commit`] finds the commit
//! 3. [`MstWalker`] rebuilds records from the commit's tree, then sweeps
//!    any subtrees the commit never reached
//! 4. [`group_by_collection`] buckets the result for archiving

mod block_store;
mod commit;
mod group;
mod mst;
mod shape;

pub use block_store::{decode_car, Block, BlockStore, BlockValue, CarError, DecodedArchive};
pub use commit::locate_commit;
pub use group::{collection_counts, group_by_collection};
pub use mst::{record_uri, split_key, MstWalker, Record, RecordSet, WalkStats, KEY_SEPARATOR};
pub use shape::{
    as_commit, as_mst_node, classify, looks_like_mst_node, MstEntry, MstNode, RepositoryCommit,
    Shape,
};

/// Everything recovered from one archive
#[derive(Debug, Clone)]
pub struct Extraction {
    pub commit: Option<RepositoryCommit>,
    /// Owner used for record uris: the commit's, else the caller's
    pub owner_id: Option<String>,
    pub records: Vec<Record>,
    pub stats: WalkStats,
    pub total_blocks: usize,
    pub decode_errors: usize,
}

/// Recover every record from a decoded archive.
///
/// `known_owner` is used when the archive carries no commit; without either
///  there is nobody to attribute records to and the result is empty.
pub fn extract_records(archive: &DecodedArchive, known_owner: Option<&str>) -> Extraction {
    let commit = locate_commit(&archive.store, &archive.roots);
    let owner_id = commit
        .as_ref()
        .map(|c| c.owner_id.clone())
        .or_else(|| known_owner.map(str::to_string));

    let (records, stats) = match &owner_id {
        Some(owner) => {
            let mut walker = MstWalker::new(&archive.store, owner.as_str());
            if let Some(commit) = &commit {
                walker.walk(commit.data, &[]);
            } else {
                tracing::warn!(
                    owner = %owner,
                    "archive has no commit, scanning all blocks for tree nodes"
                );
            }
            walker.scan_unvisited();
            let (records, stats) = walker.finish();
            (records.into_vec(), stats)
        }
        None => {
            tracing::warn!("archive has no commit and no owner was given, no records extracted");
            (Vec::new(), WalkStats::default())
        }
    };

    tracing::info!(
        records = records.len(),
        orphans = stats.orphan_subtrees,
        missing = stats.missing_blocks,
        malformed = stats.malformed_keys,
        "extracted records"
    );

    Extraction {
        commit,
        owner_id,
        records,
        stats,
        total_blocks: archive.total_blocks,
        decode_errors: archive.decode_errors,
    }
}
