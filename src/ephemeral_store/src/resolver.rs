use crate::{BandwidthConfiguration, CopyAttemptInfo, CopyFileResult, MachineReputation};
use async_trait::async_trait;
use cache_lib::{CacheError, CacheResult, ContentHash, ContentHashWithSize, MachineId, MachineLocation};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationOpCode {
    Add,
    Remove,
}

/// One event from the content location index's log for a hash.
#[derive(Debug, Clone)]
pub struct LocationOperation {
    pub op: LocationOpCode,
    pub machine: MachineId,
}

/// A resolver answer for one hash: reported size plus the event log,
/// oldest first.
#[derive(Debug, Clone)]
pub struct ResolvedContentEntry {
    pub hash: ContentHash,
    pub size: i64,
    pub operations: Vec<LocationOperation>,
}

impl ResolvedContentEntry {
    /// Machines that still hold the content after replaying the log.
    pub fn existing(&self) -> BTreeSet<MachineId> {
        let mut machines = BTreeSet::new();
        for operation in &self.operations {
            match operation.op {
                LocationOpCode::Add => {
                    machines.insert(operation.machine);
                }
                LocationOpCode::Remove => {
                    machines.remove(&operation.machine);
                }
            }
        }
        machines
    }
}

/// Content location index ("content resolver"). Interface only; the
/// index itself lives outside the core.
#[async_trait]
pub trait ContentResolver: Send + Sync {
    async fn get_locations(
        &self,
        hashes: &[ContentHash],
        cancel: &CancellationToken,
    ) -> CacheResult<Vec<ResolvedContentEntry>>;

    async fn get_single_location(
        &self,
        hash: &ContentHash,
        cancel: &CancellationToken,
    ) -> CacheResult<ResolvedContentEntry> {
        let entries = self
            .get_locations(std::slice::from_ref(hash), cancel)
            .await?;
        entries
            .into_iter()
            .next()
            .ok_or_else(|| CacheError::NotFound(format!("no resolver entry for {}", hash.short_hash())))
    }
}

/// Cluster membership view. Eventually consistent with peer events.
pub trait ClusterState: Send + Sync {
    fn primary_machine_id(&self) -> MachineId;

    /// None means the machine is not present in cluster state at all.
    fn location_of(&self, id: MachineId) -> Option<MachineLocation>;

    fn is_inactive(&self, id: MachineId) -> bool;
}

/// Local view of which peers claim a hash, fed by peer events.
#[async_trait]
pub trait ContentTracker: Send + Sync {
    async fn get_local_record(
        &self,
        hash: &ContentHash,
        cancel: &CancellationToken,
    ) -> CacheResult<Vec<MachineId>>;
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub bandwidth: Option<BandwidthConfiguration>,
    pub absolute_timeout: Option<Duration>,
    pub compression_hint: bool,
}

/// The wire copy transport. The core never interprets locations or
/// speaks the protocol; it hands the transport a write stream.
#[async_trait]
pub trait RemoteFileCopier: Send + Sync {
    async fn copy_to(
        &self,
        source: &MachineLocation,
        hash_info: &ContentHashWithSize,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        options: &CopyOptions,
        cancel: &CancellationToken,
    ) -> CacheResult<CopyFileResult>;
}

/// Host callbacks consumed by the copy engine.
pub trait CopyHost: Send + Sync {
    fn working_folder(&self) -> &Path;

    /// Fire-and-forget reputation notification.
    fn report_reputation(&self, location: &MachineLocation, reputation: MachineReputation);

    /// Optional annotation to log with the attempt.
    fn report_copy_result(
        &self,
        info: &CopyAttemptInfo,
        result: &CopyFileResult,
    ) -> Option<String>;
}
