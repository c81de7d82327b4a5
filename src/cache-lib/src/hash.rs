use crate::{CacheError, CacheResult};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

pub const MAX_HASH_BYTE_LENGTH: usize = 33;
pub const SHORT_HASH_BYTE_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Unknown,
    Sha256,
    Vso0,
    DedupChunk,
    DedupNode,
}

impl HashAlgorithm {
    /// Meaningful payload length for this tag. The remainder of the
    /// fixed-width buffer is always zero.
    pub fn byte_length(&self) -> usize {
        match self {
            HashAlgorithm::Unknown => 0,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Vso0 => 33,
            HashAlgorithm::DedupChunk => 32,
            HashAlgorithm::DedupNode => 32,
        }
    }

    pub fn tag_byte(&self) -> u8 {
        match self {
            HashAlgorithm::Unknown => 0,
            HashAlgorithm::Sha256 => 1,
            HashAlgorithm::Vso0 => 2,
            HashAlgorithm::DedupChunk => 3,
            HashAlgorithm::DedupNode => 4,
        }
    }

    pub fn from_tag_byte(tag: u8) -> CacheResult<Self> {
        match tag {
            1 => Ok(HashAlgorithm::Sha256),
            2 => Ok(HashAlgorithm::Vso0),
            3 => Ok(HashAlgorithm::DedupChunk),
            4 => Ok(HashAlgorithm::DedupNode),
            _ => Err(CacheError::InvalidHash(format!(
                "unknown hash algorithm tag: {}",
                tag
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Unknown => "unknown",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Vso0 => "vso0",
            HashAlgorithm::DedupChunk => "dedup-chunk",
            HashAlgorithm::DedupNode => "dedup-node",
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        match s {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "vso0" => Ok(HashAlgorithm::Vso0),
            "dedup-chunk" => Ok(HashAlgorithm::DedupChunk),
            "dedup-node" => Ok(HashAlgorithm::DedupNode),
            _ => Err(CacheError::InvalidHash(format!(
                "unknown hash algorithm: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tagged content identifier: hash algorithm plus a fixed-width byte
/// payload whose meaningful prefix length is a function of the tag.
#[derive(Clone, Copy)]
pub struct ContentHash {
    algorithm: HashAlgorithm,
    bytes: [u8; MAX_HASH_BYTE_LENGTH],
}

impl ContentHash {
    pub fn new(algorithm: HashAlgorithm, payload: &[u8]) -> CacheResult<Self> {
        if algorithm == HashAlgorithm::Unknown {
            return Err(CacheError::InvalidHash(
                "hash algorithm must not be unknown".to_string(),
            ));
        }
        let len = algorithm.byte_length();
        if payload.len() < len {
            return Err(CacheError::InvalidHash(format!(
                "payload too short for {}: expected {} got {}",
                algorithm,
                len,
                payload.len()
            )));
        }
        let mut bytes = [0u8; MAX_HASH_BYTE_LENGTH];
        bytes[..len].copy_from_slice(&payload[..len]);
        Ok(Self { algorithm, bytes })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The meaningful payload slice (length depends on the tag).
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.algorithm.byte_length()]
    }

    /// Truncated hex form for logging.
    pub fn short_hash(&self) -> String {
        let len = SHORT_HASH_BYTE_LENGTH.min(self.algorithm.byte_length());
        hex::encode(&self.bytes[..len])
    }

    /// One tag byte followed by the meaningful-length payload.
    pub fn serialize_trimmed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.algorithm.byte_length());
        out.push(self.algorithm.tag_byte());
        out.extend_from_slice(self.payload());
        out
    }

    /// One tag byte followed by the fixed maximum payload.
    pub fn serialize_full(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + MAX_HASH_BYTE_LENGTH);
        out.push(self.algorithm.tag_byte());
        out.extend_from_slice(&self.bytes);
        out
    }

    /// Accepts both the trimmed and the full serialized form.
    pub fn deserialize(data: &[u8]) -> CacheResult<Self> {
        if data.is_empty() {
            return Err(CacheError::InvalidHash("empty hash buffer".to_string()));
        }
        let algorithm = HashAlgorithm::from_tag_byte(data[0])?;
        let payload = &data[1..];
        let len = algorithm.byte_length();
        if payload.len() != len && payload.len() != MAX_HASH_BYTE_LENGTH {
            return Err(CacheError::InvalidHash(format!(
                "bad payload length for {}: {}",
                algorithm,
                payload.len()
            )));
        }
        Self::new(algorithm, payload)
    }
}

impl PartialEq for ContentHash {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && self.payload() == other.payload()
    }
}

impl Eq for ContentHash {}

impl Hash for ContentHash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.algorithm.tag_byte().hash(state);
        self.payload().hash(state);
    }
}

impl Ord for ContentHash {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes
            .cmp(&other.bytes)
            .then(self.algorithm.tag_byte().cmp(&other.algorithm.tag_byte()))
    }
}

impl PartialOrd for ContentHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, hex::encode(self.payload()))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.short_hash())
    }
}

impl FromStr for ContentHash {
    type Err = CacheError;

    // Accepts "algo:hex" and "hex:algo".
    fn from_str(s: &str) -> CacheResult<Self> {
        let (first, second) = s.split_once(':').ok_or_else(|| {
            CacheError::InvalidHash(format!("missing ':' separator in hash: {}", s))
        })?;
        let (algo_str, hex_str) = if HashAlgorithm::from_str(first).is_ok() {
            (first, second)
        } else {
            (second, first)
        };
        let algorithm = HashAlgorithm::from_str(algo_str)?;
        let payload = hex::decode(hex_str)
            .map_err(|e| CacheError::InvalidHash(format!("bad hex in hash {}: {}", s, e)))?;
        if payload.len() != algorithm.byte_length() {
            return Err(CacheError::InvalidHash(format!(
                "bad payload length for {}: {}",
                algorithm,
                payload.len()
            )));
        }
        Self::new(algorithm, &payload)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_str(&s).map_err(D::Error::custom)
    }
}
