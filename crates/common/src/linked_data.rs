//! Linked data helpers
//!
//! Everything inside a repository archive is DAG-CBOR addressed by a CID.
//! This module keeps the IPLD crates behind a small surface:
//!
//! - [`Cid`] and [`LinkedData`] re-exports
//! - DAG-CBOR encode / decode with a single [`CodecError`]
//! - [`cid_for_dag_cbor`] for computing the CID of an encoded block
//! - [`to_json`] for rendering a decoded value the way atproto JSON does
//!   (`{"$link": ..}` for links, `{"$bytes": ..}` for byte strings)

use base64::Engine;
use multihash::Multihash;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub use cid::Cid;
pub use ipld_core::ipld::Ipld as LinkedData;

/// Multicodec code for DAG-CBOR
pub const DAG_CBOR_CODEC: u64 = 0x71;
/// Multicodec code for raw bytes (blobs)
pub const RAW_CODEC: u64 = 0x55;
/// Multihash code for sha2-256
pub const SHA2_256_CODE: u64 = 0x12;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("dag-cbor decode error: {0}")]
    Decode(String),
    #[error("dag-cbor encode error: {0}")]
    Encode(String),
    #[error("multihash error: {0}")]
    Multihash(#[from] multihash::Error),
}

/// Decode a DAG-CBOR payload into a generic value
pub fn decode_dag_cbor(bytes: &[u8]) -> Result<LinkedData, CodecError> {
    serde_ipld_dagcbor::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encode any serializable value as DAG-CBOR
pub fn encode_dag_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// CIDv1 (dag-cbor, sha2-256) for an encoded block
pub fn cid_for_dag_cbor(bytes: &[u8]) -> Result<Cid, CodecError> {
    cid_for(DAG_CBOR_CODEC, bytes)
}

/// CIDv1 (sha2-256) for arbitrary bytes under the given codec
pub fn cid_for(codec: u64, bytes: &[u8]) -> Result<Cid, CodecError> {
    let digest = Sha256::digest(bytes);
    let hash = Multihash::<64>::wrap(SHA2_256_CODE, &digest)?;
    Ok(Cid::new_v1(codec, hash))
}

/// Look up a field on a map value
pub fn field<'a>(value: &'a LinkedData, key: &str) -> Option<&'a LinkedData> {
    match value {
        LinkedData::Map(map) => map.get(key),
        _ => None,
    }
}

/// Field as a link, if present and link-typed
pub fn link_field(value: &LinkedData, key: &str) -> Option<Cid> {
    match field(value, key) {
        Some(LinkedData::Link(cid)) => Some(*cid),
        _ => None,
    }
}

/// Field as a string, if present and string-typed
pub fn str_field<'a>(value: &'a LinkedData, key: &str) -> Option<&'a str> {
    match field(value, key) {
        Some(LinkedData::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// Render a decoded value as atproto-flavoured JSON
pub fn to_json(value: &LinkedData) -> serde_json::Value {
    use serde_json::Value;

    match value {
        LinkedData::Null => Value::Null,
        LinkedData::Bool(b) => Value::Bool(*b),
        LinkedData::Integer(i) => match i64::try_from(*i) {
            Ok(n) => Value::from(n),
            // outside of json's comfortable range, keep the digits
            Err(_) => Value::String(i.to_string()),
        },
        LinkedData::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        LinkedData::String(s) => Value::String(s.clone()),
        LinkedData::Bytes(bytes) => {
            let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes);
            serde_json::json!({ "$bytes": encoded })
        }
        LinkedData::List(items) => Value::Array(items.iter().map(to_json).collect()),
        LinkedData::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect(),
        ),
        LinkedData::Link(cid) => serde_json::json!({ "$link": cid.to_string() }),
    }
}
