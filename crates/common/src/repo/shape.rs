//! Structural classification of decoded blocks.
//!
//! Tree nodes carry no type tag on the wire, so a value is classified by the
//!  fields it declares:
//!
//! - MST node: has an entries list (`e`) or a left / right pointer (`l` / `r`)
//! - record: has a `$type` string
//! - commit: has a string `did`, a link `data` and a `rev` or `version`
//!
//! Anything else is [`Shape::Other`].

use crate::linked_data::{field, link_field, str_field, Cid, LinkedData};

/// One entry of an MST node
#[derive(Debug, Clone, PartialEq)]
pub struct MstEntry {
    /// Bytes shared with the previous key in traversal order
    pub prefix_len: usize,
    pub key_suffix: Vec<u8>,
    pub value: Cid,
    /// Subtree sitting to the right of this entry
    pub tree: Option<Cid>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MstNode {
    pub left: Option<Cid>,
    pub right: Option<Cid>,
    pub entries: Vec<MstEntry>,
}

/// Root object of a repository revision
#[derive(Debug, Clone, PartialEq)]
pub struct RepositoryCommit {
    pub owner_id: String,
    pub data: Cid,
    pub revision: LinkedData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Shape<'a> {
    Node(MstNode),
    Record { record_type: &'a str },
    Commit(RepositoryCommit),
    Other,
}

/// Classify a decoded value by the fields it declares
pub fn classify(value: &LinkedData) -> Shape<'_> {
    if let Some(node) = as_mst_node(value) {
        return Shape::Node(node);
    }
    if let Some(record_type) = str_field(value, "$type") {
        return Shape::Record { record_type };
    }
    if let Some(commit) = as_commit(value) {
        return Shape::Commit(commit);
    }
    Shape::Other
}

/// True for anything carrying entries or subtree pointers
pub fn looks_like_mst_node(value: &LinkedData) -> bool {
    matches!(field(value, "e"), Some(LinkedData::List(_)))
        || link_field(value, "l").is_some()
        || link_field(value, "r").is_some()
}

/// Parse an MST node.
///
/// Entries that are missing a value link or carry a nonsensical prefix are
///  dropped individually; the node itself still parses.
pub fn as_mst_node(value: &LinkedData) -> Option<MstNode> {
    if !looks_like_mst_node(value) {
        return None;
    }

    let entries = match field(value, "e") {
        Some(LinkedData::List(items)) => items.iter().filter_map(as_mst_entry).collect(),
        _ => Vec::new(),
    };

    Some(MstNode {
        left: link_field(value, "l"),
        right: link_field(value, "r"),
        entries,
    })
}

fn as_mst_entry(value: &LinkedData) -> Option<MstEntry> {
    let prefix_len = match field(value, "p") {
        Some(LinkedData::Integer(p)) => usize::try_from(*p).ok()?,
        // an absent prefix means nothing is shared
        None | Some(LinkedData::Null) => 0,
        _ => return None,
    };
    let key_suffix = match field(value, "k") {
        Some(LinkedData::Bytes(bytes)) => bytes.clone(),
        Some(LinkedData::String(s)) => s.as_bytes().to_vec(),
        _ => return None,
    };
    let value_cid = link_field(value, "v")?;

    Some(MstEntry {
        prefix_len,
        key_suffix,
        value: value_cid,
        tree: link_field(value, "t"),
    })
}

/// Parse a repository commit
pub fn as_commit(value: &LinkedData) -> Option<RepositoryCommit> {
    let owner_id = str_field(value, "did")?;
    let data = link_field(value, "data")?;
    let revision = field(value, "rev").or_else(|| field(value, "version"))?;

    Some(RepositoryCommit {
        owner_id: owner_id.to_string(),
        data,
        revision: revision.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::linked_data::{cid_for, RAW_CODEC};

    fn map(pairs: Vec<(&str, LinkedData)>) -> LinkedData {
        LinkedData::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn cid(seed: &[u8]) -> Cid {
        cid_for(RAW_CODEC, seed).unwrap()
    }

    #[test]
    fn test_classify_node_record_commit() {
        let node = map(vec![
            ("l", LinkedData::Null),
            (
                "e",
                LinkedData::List(vec![map(vec![
                    ("p", LinkedData::Integer(0)),
                    ("k", LinkedData::Bytes(b"app.bsky.feed.post/a".to_vec())),
                    ("v", LinkedData::Link(cid(b"v"))),
                    ("t", LinkedData::Null),
                ])]),
            ),
        ]);
        match classify(&node) {
            Shape::Node(n) => {
                assert_eq!(n.entries.len(), 1);
                assert_eq!(n.entries[0].tree, None);
                assert_eq!(n.left, None);
            }
            other => panic!("expected node, got {:?}", other),
        }

        let record = map(vec![("$type", LinkedData::String("app.bsky.feed.like".into()))]);
        assert_eq!(
            classify(&record),
            Shape::Record {
                record_type: "app.bsky.feed.like"
            }
        );

        let commit = map(vec![
            ("did", LinkedData::String("did:plc:xyz".into())),
            ("data", LinkedData::Link(cid(b"root"))),
            ("rev", LinkedData::String("3k2a".into())),
            ("version", LinkedData::Integer(3)),
        ]);
        match classify(&commit) {
            Shape::Commit(c) => {
                assert_eq!(c.owner_id, "did:plc:xyz");
                assert_eq!(c.data, cid(b"root"));
                assert_eq!(c.revision, LinkedData::String("3k2a".into()));
            }
            other => panic!("expected commit, got {:?}", other),
        }
    }

    #[test]
    fn test_commit_requires_all_three_fields() {
        let missing_rev = map(vec![
            ("did", LinkedData::String("did:plc:xyz".into())),
            ("data", LinkedData::Link(cid(b"root"))),
        ]);
        assert!(as_commit(&missing_rev).is_none());

        let data_not_link = map(vec![
            ("did", LinkedData::String("did:plc:xyz".into())),
            ("data", LinkedData::String("nope".into())),
            ("version", LinkedData::Integer(2)),
        ]);
        assert!(as_commit(&data_not_link).is_none());
        assert_eq!(classify(&data_not_link), Shape::Other);
    }

    #[test]
    fn test_pointer_only_node_and_bad_entries() {
        let node = map(vec![
            ("l", LinkedData::Link(cid(b"left"))),
            (
                "e",
                LinkedData::List(vec![
                    map(vec![("p", LinkedData::Integer(-1))]),
                    map(vec![
                        ("p", LinkedData::Integer(2)),
                        ("k", LinkedData::Bytes(b"x".to_vec())),
                    ]),
                ]),
            ),
        ]);
        let parsed = as_mst_node(&node).unwrap();
        assert_eq!(parsed.left, Some(cid(b"left")));
        assert!(parsed.entries.is_empty());

        assert!(as_mst_node(&LinkedData::String("no".into())).is_none());
    }
}
