use bincode::{Decode, Encode};
use hex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 32-byte block identifier. The all-zero value means "no block".
#[derive(Encode, Decode, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub const ZERO: BlockHash = BlockHash([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseHashError {
    #[error("invalid hex in block hash: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("block hash must be 32 bytes, got {0}")]
    Length(usize),
}

impl FromStr for BlockHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(normalized)?;
        if bytes.len() != 32 {
            return Err(ParseHashError::Length(bytes.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(BlockHash(out))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// block header
#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub previous_hash: BlockHash,
    pub merkle_root: BlockHash,
    pub timestamp: i64, // unix seconds
    pub nonce: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Result<BlockHash, bincode::error::EncodeError> {
        compute_header_hash(self)
    }
}

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let h1 = Sha256::digest(data);
    let h2 = Sha256::digest(h1);
    let mut out = [0u8; 32];
    out.copy_from_slice(&h2);
    out
}

/// Deterministic serialization: use bincode (v2 Encode trait)
pub fn serialize_header(header: &BlockHeader) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let config = bincode::config::standard().with_fixed_int_encoding(); // u64 = 8 bytes
    bincode::encode_to_vec(header, config)
}

/// Compute hash from the header (sha256d)
pub fn compute_header_hash(header: &BlockHeader) -> Result<BlockHash, bincode::error::EncodeError> {
    let bytes = serialize_header(header)?;
    Ok(BlockHash(sha256d(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_header_and_hash() {
        let header = BlockHeader {
            height: 1,
            previous_hash: BlockHash([0u8; 32]),
            merkle_root: BlockHash([0x11; 32]),
            timestamp: 1234567890,
            nonce: 42,
        };

        let bytes = serialize_header(&header).unwrap();
        // 8 + 32 + 32 + 8 + 8 with fixed-int encoding
        assert_eq!(bytes.len(), 88);

        let hash = compute_header_hash(&header).unwrap();
        assert!(!hash.is_zero());

        let mut other = header.clone();
        other.nonce = 43;
        assert_ne!(compute_header_hash(&other).unwrap(), hash);
    }

    #[test]
    fn hash_hex_parsing() {
        let hash = BlockHash([0xab; 32]);
        let text = hash.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<BlockHash>().unwrap(), hash);
        assert_eq!(format!("0x{}", text).parse::<BlockHash>().unwrap(), hash);

        assert!(matches!(
            "abcd".parse::<BlockHash>(),
            Err(ParseHashError::Length(2))
        ));
        assert!(matches!(
            "zz".repeat(32).parse::<BlockHash>(),
            Err(ParseHashError::Hex(_))
        ));
    }

    #[test]
    fn zero_sentinel() {
        assert!(BlockHash::ZERO.is_zero());
        assert!(BlockHash::default().is_zero());
        assert!(!BlockHash([1u8; 32]).is_zero());
    }

    #[test]
    fn serde_as_hex_string() {
        let hash = BlockHash([0x01; 32]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: BlockHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
