use crate::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size is unknown; verify after copy.
pub const UNKNOWN_CONTENT_SIZE: i64 = -1;

/// Stable identifier a cluster-state service assigns to one worker.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MachineId(pub u32);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Opaque address of a peer; only the remote file copier interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineLocation(String);

impl MachineLocation {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentHashWithSize {
    pub hash: ContentHash,
    pub size: i64,
}

impl ContentHashWithSize {
    pub fn new(hash: ContentHash, size: i64) -> Self {
        Self { hash, size }
    }

    pub fn with_unknown_size(hash: ContentHash) -> Self {
        Self {
            hash,
            size: UNKNOWN_CONTENT_SIZE,
        }
    }

    pub fn has_known_size(&self) -> bool {
        self.size != UNKNOWN_CONTENT_SIZE
    }
}

impl fmt::Display for ContentHashWithSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} size:{}]", self.hash.short_hash(), self.size)
    }
}

/// Which index answered a location query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationOrigin {
    Local,
    Global,
}

/// Hash plus candidate peers in search order. `filtered_out_locations`
/// keeps known-inactive peers as a hint for the host; they are never
/// contacted.
#[derive(Debug, Clone)]
pub struct ContentHashWithSizeAndLocations {
    pub hash_info: ContentHashWithSize,
    pub locations: Vec<MachineLocation>,
    pub filtered_out_locations: Vec<MachineLocation>,
    pub origin: LocationOrigin,
}

impl ContentHashWithSizeAndLocations {
    pub fn new(hash_info: ContentHashWithSize, locations: Vec<MachineLocation>) -> Self {
        Self {
            hash_info,
            locations,
            filtered_out_locations: Vec::new(),
            origin: LocationOrigin::Global,
        }
    }
}
