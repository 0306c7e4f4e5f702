//! Checksummed, versioned file encoding for checkpoint snapshots
//!
//! Layout (all integers little endian):
//!
//! | bytes | content |
//! |---|---|
//! | 8 | magic `IOTCKPT1` |
//! | 4 | format version |
//! | 8 | payload length |
//! | 32 | BLAKE3 digest of the payload |
//! | n | JSON payload |

use crate::snapshot::Snapshot;
use iotswarm_core::{IotSwarmError, IotSwarmResult};

pub const MAGIC: &[u8; 8] = b"IOTCKPT1";
pub const FORMAT_VERSION: u32 = 1;

const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 4 + 8 + DIGEST_LEN;

pub fn encode(snapshot: &Snapshot) -> IotSwarmResult<Vec<u8>> {
    let payload = serde_json::to_vec(snapshot)?;
    let digest = blake3::hash(&payload);

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    bytes.extend_from_slice(digest.as_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

/// Decode a snapshot, reporting any damage as [`IotSwarmError::StateCorruption`]
pub fn decode(bytes: &[u8]) -> IotSwarmResult<Snapshot> {
    if bytes.len() < HEADER_LEN {
        return Err(IotSwarmError::corruption(format!(
            "truncated header ({} bytes)",
            bytes.len()
        )));
    }

    let (magic, rest) = bytes.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(IotSwarmError::corruption("bad magic"));
    }

    let (version, rest) = rest.split_at(4);
    let version = u32::from_le_bytes([version[0], version[1], version[2], version[3]]);
    if version != FORMAT_VERSION {
        return Err(IotSwarmError::corruption(format!(
            "unsupported format version {version}"
        )));
    }

    let (length, rest) = rest.split_at(8);
    let mut length_bytes = [0u8; 8];
    length_bytes.copy_from_slice(length);
    let length = u64::from_le_bytes(length_bytes);

    let (digest, payload) = rest.split_at(DIGEST_LEN);
    if payload.len() as u64 != length {
        return Err(IotSwarmError::corruption(format!(
            "payload length {} does not match header length {length}",
            payload.len()
        )));
    }

    if blake3::hash(payload).as_bytes() != digest {
        return Err(IotSwarmError::corruption("checksum mismatch"));
    }

    let snapshot: Snapshot = serde_json::from_slice(payload)
        .map_err(|e| IotSwarmError::corruption(format!("invalid payload: {e}")))?;

    if let Some((table, site)) = snapshot.misfiled() {
        return Err(IotSwarmError::corruption(format!(
            "record stored under {table}/{site} names a different pair"
        )));
    }

    Ok(snapshot)
}
