//! Chain data types shared by every component.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ─── Hashes and byte strings ──────────────────────────────────────────────────

/// A block hash as reported by the node (`0x`-prefixed hex).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHash(pub String);

impl BlockHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlockHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlockHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque bytes, `0x`-hex on the wire. Used for storage keys/values,
/// headers, extrinsics and call payloads.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    /// Parse a hex string, with or without `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s.strip_prefix("0x").unwrap_or(s)).map(Self)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(&self.0))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(v: &[u8]) -> Self {
        Self(v.to_vec())
    }
}

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Bytes::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ─── Runtime ──────────────────────────────────────────────────────────────────

/// Runtime specification reported with `withRuntime = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeVersion {
    pub spec_name: String,
    pub impl_name: String,
    pub spec_version: u32,
    pub impl_version: u32,
    #[serde(default)]
    pub transaction_version: Option<u32>,
    /// Runtime API id → version.
    #[serde(default)]
    pub apis: BTreeMap<String, u32>,
}

// ─── Blocks ───────────────────────────────────────────────────────────────────

/// A block the node has promised not to prune until it is unpinned.
#[derive(Debug, Clone, PartialEq)]
pub struct PinnedBlock {
    pub hash: BlockHash,
    pub number: u64,
    pub parent: BlockHash,
    /// The block itself changed the runtime.
    pub runtime_upgraded: bool,
    pub finalized: bool,
    /// Runtime this block executes with (inherited from the parent unless upgraded).
    pub runtime: Option<Arc<RuntimeVersion>>,
    /// Set when the node announced the block with an invalid runtime.
    pub invalid_runtime: Option<String>,
}

/// Decode the block number out of a SCALE-encoded header.
///
/// The header starts with the 32-byte parent hash followed by the
/// compact-encoded number.
pub fn header_number(header: &[u8]) -> Option<u64> {
    let rest = header.get(32..)?;
    let first = *rest.first()?;
    match first & 0b11 {
        0b00 => Some(u64::from(first >> 2)),
        0b01 => {
            let raw = u16::from_le_bytes([*rest.first()?, *rest.get(1)?]);
            Some(u64::from(raw >> 2))
        }
        0b10 => {
            let raw = u32::from_le_bytes(rest.get(..4)?.try_into().ok()?);
            Some(u64::from(raw >> 2))
        }
        _ => {
            let len = usize::from(first >> 2) + 4;
            if len > 8 {
                return None;
            }
            let bytes = rest.get(1..1 + len)?;
            let mut buf = [0u8; 8];
            buf[..len].copy_from_slice(bytes);
            Some(u64::from_le_bytes(buf))
        }
    }
}

/// Parent hash of a SCALE-encoded header (its first 32 bytes).
pub fn header_parent(header: &[u8]) -> Option<BlockHash> {
    header
        .get(..32)
        .map(|parent| BlockHash(format!("0x{}", hex::encode(parent))))
}

// ─── Storage ──────────────────────────────────────────────────────────────────

/// What to fetch for a storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageQueryType {
    Value,
    Hash,
    ClosestDescendantMerkleValue,
    DescendantsValues,
    DescendantsHashes,
}

/// One entry of a batched storage request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageQueryItem {
    pub key: Bytes,
    #[serde(rename = "type")]
    pub query_type: StorageQueryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination_start_key: Option<Bytes>,
}

impl StorageQueryItem {
    pub fn value(key: Bytes) -> Self {
        Self {
            key,
            query_type: StorageQueryType::Value,
            pagination_start_key: None,
        }
    }

    pub fn new(key: Bytes, query_type: StorageQueryType) -> Self {
        Self {
            key,
            query_type,
            pagination_start_key: None,
        }
    }
}

/// One item produced by a storage operation. Descendant queries produce
/// several items per request entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageResultItem {
    pub key: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closest_descendant_merkle_value: Option<Bytes>,
}
