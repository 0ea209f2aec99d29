//! Wire protocol types exchanged between localities.
//!
//! Payloads (shards, collective contributions) travel as postcard bytes so
//! the RPC surface stays independent of element types. Every fetch reply
//! carries the protocol version of the sender.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::tiling::TilingSpan;

/// Protocol version. Incremented on breaking wire format changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// A rectangular sub-range of a shard in the owner's local coordinates.
pub type WireRegion = Vec<TilingSpan>;

/// Reply to a fetch request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FetchReply {
    pub version: u32,
    pub payload: Vec<u8>,
}

impl FetchReply {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    /// Decode the payload after checking the sender's protocol version.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MeshError> {
        if self.version != PROTOCOL_VERSION {
            return Err(MeshError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: self.version,
            });
        }
        decode(&self.payload)
    }
}

/// One participant's input to a collective.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Contribution {
    /// An encoded local value.
    Value(Vec<u8>),
    /// The participant failed before reaching the collective; everyone
    /// waiting on the same key fails with this reason.
    Abort(String),
}

/// Serialize to postcard bytes.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, MeshError> {
    Ok(postcard::to_allocvec(value)?)
}

/// Deserialize from postcard bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MeshError> {
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_tensor::{Array, Tensor};

    #[test]
    fn fetch_reply_roundtrip() {
        let t: Array = Tensor::from_vec(vec![1i64, 2, 3, 4], &[2, 2]).into();
        let reply = FetchReply::new(encode(&t).unwrap());
        let back: Array = reply.decode().unwrap();
        assert_eq!(back, t);
    }

    #[test]
    fn fetch_reply_version_checked() {
        let reply = FetchReply {
            version: 999,
            payload: encode(&1u64).unwrap(),
        };
        let r: Result<u64, _> = reply.decode();
        assert_eq!(
            r,
            Err(MeshError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: 999
            })
        );
    }

    #[test]
    fn garbage_is_a_serde_error() {
        let r: Result<String, _> = decode(&[0xff, 0xff, 0xff]);
        assert!(matches!(r, Err(MeshError::Serde(_))));
    }
}
