use cache_lib::{ContentHash, MachineLocation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result code of one remote file copy, the union reported by the
/// underlying copy transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CopyCode {
    Success,
    FileNotFoundError,
    ServerUnavailable,
    UnknownServerError,
    RpcError,
    Unknown,
    ConnectionTimeout,
    TimeToFirstByteTimeout,
    CopyTimeout,
    CopyBandwidthTimeout,
    DestinationPathError,
    InvalidHash,
    Cancelled,
}

impl CopyCode {
    pub fn is_success(&self) -> bool {
        matches!(self, CopyCode::Success)
    }

    /// Peer unreachable or misbehaving; the replica is marked bad for
    /// the rest of the pass.
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            CopyCode::ServerUnavailable
                | CopyCode::UnknownServerError
                | CopyCode::RpcError
                | CopyCode::Unknown
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CopyCode::ConnectionTimeout
                | CopyCode::TimeToFirstByteTimeout
                | CopyCode::CopyTimeout
                | CopyCode::CopyBandwidthTimeout
        )
    }
}

/// Outcome of one `copy_to` call against a peer.
#[derive(Debug, Clone)]
pub struct CopyFileResult {
    pub code: CopyCode,
    pub size: Option<u64>,
    pub minimum_speed_mbps: Option<f64>,
    pub header_response_time: Option<Duration>,
    pub time_spent_hashing: Option<Duration>,
    pub time_spent_writing_to_disk: Option<Duration>,
    pub error_message: Option<String>,
}

impl CopyFileResult {
    pub fn success(size: u64) -> Self {
        Self {
            code: CopyCode::Success,
            size: Some(size),
            minimum_speed_mbps: None,
            header_response_time: None,
            time_spent_hashing: None,
            time_spent_writing_to_disk: None,
            error_message: None,
        }
    }

    pub fn from_code(code: CopyCode) -> Self {
        Self {
            code,
            size: None,
            minimum_speed_mbps: None,
            header_response_time: None,
            time_spent_hashing: None,
            time_spent_writing_to_disk: None,
            error_message: None,
        }
    }

    pub fn with_error(code: CopyCode, message: impl Into<String>) -> Self {
        let mut result = Self::from_code(code);
        result.error_message = Some(message.into());
        result
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

/// Per-peer signal consumed by higher-level routing. Fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineReputation {
    Good,
    Bad,
    Missing,
    Timeout,
}

/// Which tier satisfied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    LocalCache,
    DatacenterCache,
    BackingStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccessMode {
    ReadOnly,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileReplacementMode {
    ReplaceExisting,
    FailIfExists,
    SkipIfExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRealizationMode {
    Any,
    Copy,
    HardLink,
    Move,
}

/// Caller's scheduling hint for a place; stores may use it to order
/// competing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UrgencyHint {
    Low,
    #[default]
    Nominal,
    High,
}

/// Why a copy was requested, for admission accounting and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyReason {
    Place,
    OpenStream,
    ProactiveBackground,
    Replication,
}

#[derive(Debug, Clone)]
pub enum PlaceFileResult {
    Placed {
        hash: ContentHash,
        size: i64,
        source: ContentSource,
        already_exists: bool,
    },
    NotPlacedContentNotFound {
        message: String,
    },
    NotPlacedError {
        message: String,
    },
    Cancelled {
        message: String,
    },
}

impl PlaceFileResult {
    pub fn is_placed(&self) -> bool {
        matches!(self, PlaceFileResult::Placed { .. })
    }

    pub fn source(&self) -> Option<ContentSource> {
        match self {
            PlaceFileResult::Placed { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn size(&self) -> Option<i64> {
        match self {
            PlaceFileResult::Placed { size, .. } => Some(*size),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PutResult {
    Success {
        hash: ContentHash,
        size: i64,
        source: ContentSource,
        already_existed: bool,
    },
    /// The store refused the put; non-retryable.
    Rejected {
        message: String,
    },
    Failure {
        message: String,
    },
    Cancelled {
        message: String,
    },
}

impl PutResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PutResult::Success { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PutResult::Cancelled { .. })
    }

    pub fn hash(&self) -> Option<ContentHash> {
        match self {
            PutResult::Success { hash, .. } => Some(*hash),
            _ => None,
        }
    }

    pub fn already_existed(&self) -> bool {
        matches!(
            self,
            PutResult::Success {
                already_existed: true,
                ..
            }
        )
    }
}

/// One copy attempt as seen by the host, for reputation bookkeeping.
#[derive(Debug, Clone)]
pub struct CopyAttemptInfo {
    pub location: MachineLocation,
    /// The candidate came from the build ring rather than the location
    /// index.
    pub from_ring: bool,
    pub attempt: u32,
    pub replica_index: usize,
    pub queue_wait: Duration,
    pub code: CopyCode,
}
