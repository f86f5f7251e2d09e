use super::block_store::BlockStore;
use super::shape::{as_commit, RepositoryCommit};
use crate::linked_data::Cid;

/// Find the repository commit in a decoded archive.
///
/// Header roots are tried first since a well formed archive names its
///  commit there. Otherwise every block is scanned once, in archive order,
///  and the first commit-shaped value wins. `None` is a normal outcome
///  (blob-only or partial archives) and means "no records".
pub fn locate_commit(store: &BlockStore, roots: &[Cid]) -> Option<RepositoryCommit> {
    let from_roots = roots
        .iter()
        .filter_map(|cid| store.get_decoded(cid))
        .find_map(as_commit);
    if from_roots.is_some() {
        return from_roots;
    }

    let found = store
        .iter()
        .filter_map(|block| block.decoded())
        .find_map(as_commit);

    match &found {
        Some(commit) => tracing::debug!(
            owner = %commit.owner_id,
            data = %commit.data,
            "located commit by scanning blocks"
        ),
        None => tracing::debug!("no commit found in {} blocks", store.len()),
    }

    found
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::linked_data::{cid_for_dag_cbor, encode_dag_cbor, LinkedData};

    fn put(store: &mut BlockStore, value: LinkedData) -> Cid {
        let bytes = encode_dag_cbor(&value).unwrap();
        let cid = cid_for_dag_cbor(&bytes).unwrap();
        store.insert(cid, bytes);
        cid
    }

    fn commit_value(did: &str, data: Cid) -> LinkedData {
        let mut map = BTreeMap::new();
        map.insert("did".to_string(), LinkedData::String(did.into()));
        map.insert("data".to_string(), LinkedData::Link(data));
        map.insert("rev".to_string(), LinkedData::String("rev1".into()));
        LinkedData::Map(map)
    }

    #[test]
    fn test_locates_commit_without_roots() {
        let mut store = BlockStore::new();
        let data = put(&mut store, LinkedData::String("tree".into()));
        put(&mut store, commit_value("did:plc:one", data));

        let commit = locate_commit(&store, &[]).unwrap();
        assert_eq!(commit.owner_id, "did:plc:one");
        assert_eq!(commit.data, data);
    }

    #[test]
    fn test_prefers_header_root() {
        let mut store = BlockStore::new();
        let data = put(&mut store, LinkedData::String("tree".into()));
        put(&mut store, commit_value("did:plc:first", data));
        let root = put(&mut store, commit_value("did:plc:root", data));

        let commit = locate_commit(&store, &[root]).unwrap();
        assert_eq!(commit.owner_id, "did:plc:root");
    }

    #[test]
    fn test_no_commit_is_none() {
        let mut store = BlockStore::new();
        put(&mut store, LinkedData::String("just data".into()));
        assert!(locate_commit(&store, &[]).is_none());
    }
}
