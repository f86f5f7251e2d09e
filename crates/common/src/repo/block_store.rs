use std::collections::HashMap;

use bytes::Bytes;
use iroh_car::CarReader;

use crate::linked_data::{decode_dag_cbor, Cid, LinkedData};

/// Decoded payload of a block, or the reason it could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockValue {
    Decoded(LinkedData),
    Undecodable(String),
}

/// One `(CID, bytes)` section of an archive, decoded once.
#[derive(Debug, Clone)]
pub struct Block {
    cid: Cid,
    bytes: Bytes,
    value: BlockValue,
}

impl Block {
    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn value(&self) -> &BlockValue {
        &self.value
    }

    /// The decoded value, if decoding succeeded
    pub fn decoded(&self) -> Option<&LinkedData> {
        match &self.value {
            BlockValue::Decoded(value) => Some(value),
            BlockValue::Undecodable(_) => None,
        }
    }
}

/// In-memory CID -> block map for a single export job.
///
/// Iteration follows the order blocks first appeared in the archive, so
///  every pass over the store is deterministic.
#[derive(Debug, Clone, Default)]
pub struct BlockStore {
    blocks: HashMap<Cid, Block>,
    order: Vec<Cid>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a block, decoding its payload as DAG-CBOR.
    ///  Returns false if the payload did not decode.
    pub fn insert(&mut self, cid: Cid, bytes: impl Into<Bytes>) -> bool {
        let bytes = bytes.into();
        let value = match decode_dag_cbor(&bytes) {
            Ok(value) => BlockValue::Decoded(value),
            Err(e) => BlockValue::Undecodable(e.to_string()),
        };
        let decoded = matches!(value, BlockValue::Decoded(_));

        // content for a cid is invariant, first copy wins
        if !self.blocks.contains_key(&cid) {
            self.order.push(cid);
            self.blocks.insert(cid, Block { cid, bytes, value });
        }

        decoded
    }

    pub fn get(&self, cid: &Cid) -> Option<&Block> {
        self.blocks.get(cid)
    }

    /// Decoded value for a cid, `None` if missing or undecodable
    pub fn get_decoded(&self, cid: &Cid) -> Option<&LinkedData> {
        self.blocks.get(cid).and_then(Block::decoded)
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.blocks.contains_key(cid)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Blocks in first-seen order
    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.order.iter().filter_map(|cid| self.blocks.get(cid))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CarError {
    #[error("unreadable archive framing: {0}")]
    Framing(#[from] iroh_car::Error),
    #[error("archive is empty")]
    Empty,
}

/// Result of decoding a whole archive
#[derive(Debug, Clone)]
pub struct DecodedArchive {
    pub store: BlockStore,
    /// Roots declared in the archive header
    pub roots: Vec<Cid>,
    /// Every framed section seen, including duplicates and undecodable ones
    pub total_blocks: usize,
    pub decode_errors: usize,
}

/// Decode a CARv1 archive held in memory.
///
/// Framing is walked exactly once. Payloads that fail to decode are kept
///  as [`BlockValue::Undecodable`] and counted; only a broken header or
///  truncated section aborts the decode.
pub async fn decode_car(bytes: &[u8]) -> Result<DecodedArchive, CarError> {
    if bytes.is_empty() {
        return Err(CarError::Empty);
    }

    let mut reader = CarReader::new(bytes).await?;
    let roots = reader.header().roots().to_vec();
    tracing::debug!("decode_car: header declares {} root(s)", roots.len());

    let mut store = BlockStore::new();
    let mut total_blocks = 0;
    let mut decode_errors = 0;

    while let Some((cid, data)) = reader.next_block().await? {
        total_blocks += 1;
        if !store.insert(cid, data) {
            decode_errors += 1;
            tracing::debug!("decode_car: block {} did not decode", cid);
        }
    }

    tracing::info!(
        total_blocks,
        decode_errors,
        unique_blocks = store.len(),
        "decoded archive"
    );

    Ok(DecodedArchive {
        store,
        roots,
        total_blocks,
        decode_errors,
    })
}
