use crate::{
    ContentReadSeek, ContentResolver, ContentSource, ContentStore, ContentTracker,
    ClusterState, CopyAttemptInfo, CopyCode, CopyFileResult, CopyHost, CopyOptions,
    EphemeralCacheConfig, EphemeralHost, EphemeralSession, FileAccessMode, FileRealizationMode,
    FileReplacementMode, LocationOpCode, LocationOperation, MachineReputation, PlaceFileResult,
    PutResult, RemoteFileCopier, ResolvedContentEntry, TrustedContentStore, UrgencyHint,
};
use async_trait::async_trait;
use cache_lib::{
    CacheError, CacheResult, ContentHash, ContentHashWithSize, ContentHasher, MachineId,
    MachineLocation,
};
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub fn hash_of(data: &[u8]) -> ContentHash {
    ContentHasher::new(None).unwrap().calc_from_bytes(data)
}

/// In-memory store standing in for the local and persistent sessions.
pub struct MemoryStore {
    name: &'static str,
    contents: Mutex<HashMap<ContentHash, Vec<u8>>>,
    pub put_count: AtomicU64,
    pub trusted_put_count: AtomicU64,
    pub place_count: AtomicU64,
    put_delay: Mutex<Duration>,
    suppress_already_exists: AtomicBool,
}

impl MemoryStore {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            contents: Mutex::new(HashMap::new()),
            put_count: AtomicU64::new(0),
            trusted_put_count: AtomicU64::new(0),
            place_count: AtomicU64::new(0),
            put_delay: Mutex::new(Duration::ZERO),
            suppress_already_exists: AtomicBool::new(false),
        })
    }

    pub fn insert(&self, data: &[u8]) -> ContentHash {
        let hash = hash_of(data);
        self.contents.lock().unwrap().insert(hash, data.to_vec());
        hash
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.contents.lock().unwrap().contains_key(hash)
    }

    pub fn get(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        self.contents.lock().unwrap().get(hash).cloned()
    }

    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = delay;
    }

    /// Makes every put report `already_existed = false`, so the
    /// session's upload pipeline is always exercised.
    pub fn suppress_already_exists(&self) {
        self.suppress_already_exists.store(true, Ordering::SeqCst);
    }

    fn store_bytes(&self, hash: ContentHash, data: Vec<u8>) -> PutResult {
        let mut contents = self.contents.lock().unwrap();
        let already = contents.contains_key(&hash)
            && !self.suppress_already_exists.load(Ordering::SeqCst);
        let size = data.len() as i64;
        contents.insert(hash, data);
        PutResult::Success {
            hash,
            size,
            source: ContentSource::LocalCache,
            already_existed: already,
        }
    }

    async fn maybe_delay(&self) {
        let delay = *self.put_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn pin(&self, hash: &ContentHash, _cancel: &CancellationToken) -> CacheResult<()> {
        if self.contains(hash) {
            Ok(())
        } else {
            Err(CacheError::NotFound(format!(
                "{} not in {}",
                hash.short_hash(),
                self.name
            )))
        }
    }

    async fn pin_bulk(
        &self,
        hashes: &[ContentHash],
        cancel: &CancellationToken,
    ) -> Vec<(ContentHash, CacheResult<()>)> {
        let mut results = Vec::with_capacity(hashes.len());
        for hash in hashes {
            results.push((*hash, self.pin(hash, cancel).await));
        }
        results
    }

    async fn place_file(
        &self,
        hash: &ContentHash,
        path: &Path,
        _access: FileAccessMode,
        _replacement: FileReplacementMode,
        _realization: FileRealizationMode,
        _urgency: UrgencyHint,
        _cancel: &CancellationToken,
    ) -> CacheResult<PlaceFileResult> {
        let data = self.get(hash);
        match data {
            Some(data) => {
                self.place_count.fetch_add(1, Ordering::SeqCst);
                tokio::fs::write(path, &data)
                    .await
                    .map_err(|e| CacheError::IoError(e.to_string()))?;
                Ok(PlaceFileResult::Placed {
                    hash: *hash,
                    size: data.len() as i64,
                    source: ContentSource::LocalCache,
                    already_exists: false,
                })
            }
            None => Ok(PlaceFileResult::NotPlacedContentNotFound {
                message: format!("{} not in {}", hash.short_hash(), self.name),
            }),
        }
    }

    async fn put_file(
        &self,
        _algorithm: cache_lib::HashAlgorithm,
        path: &Path,
        _realization: FileRealizationMode,
        _cancel: &CancellationToken,
    ) -> CacheResult<PutResult> {
        self.maybe_delay().await;
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| CacheError::IoError(e.to_string()))?;
        self.put_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.store_bytes(hash_of(&data), data))
    }

    async fn put_stream(
        &self,
        _algorithm: cache_lib::HashAlgorithm,
        stream: &mut dyn ContentReadSeek,
        _cancel: &CancellationToken,
    ) -> CacheResult<PutResult> {
        self.maybe_delay().await;
        let mut data = Vec::new();
        stream
            .read_to_end(&mut data)
            .await
            .map_err(|e| CacheError::IoError(e.to_string()))?;
        self.put_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.store_bytes(hash_of(&data), data))
    }
}

#[async_trait]
impl TrustedContentStore for MemoryStore {
    async fn put_trusted_file(
        &self,
        hash_info: &ContentHashWithSize,
        path: &Path,
        _realization: FileRealizationMode,
        _cancel: &CancellationToken,
    ) -> CacheResult<PutResult> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| CacheError::IoError(e.to_string()))?;
        self.trusted_put_count.fetch_add(1, Ordering::SeqCst);
        // No re-hash: the caller asserts the hash.
        Ok(self.store_bytes(hash_info.hash, data))
    }
}

#[derive(Clone)]
pub enum CopyScript {
    Data(Vec<u8>),
    Fail(CopyCode, Option<String>),
}

/// Remote copier whose behavior per location is scripted by the test:
/// the nth attempt against a location runs the nth step, the last step
/// repeating.
pub struct ScriptedCopier {
    scripts: Mutex<HashMap<MachineLocation, Vec<CopyScript>>>,
    attempts: Mutex<Vec<(MachineLocation, Instant)>>,
    copy_delay: Mutex<Duration>,
}

impl ScriptedCopier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            copy_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_copy_delay(&self, delay: Duration) {
        *self.copy_delay.lock().unwrap() = delay;
    }

    pub fn script(&self, location: &MachineLocation, steps: Vec<CopyScript>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(location.clone(), steps);
    }

    pub fn attempt_count(&self, location: &MachineLocation) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(attempted, _)| attempted == location)
            .count()
    }

    pub fn attempt_times(&self, location: &MachineLocation) -> Vec<Instant> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(attempted, _)| attempted == location)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteFileCopier for ScriptedCopier {
    async fn copy_to(
        &self,
        source: &MachineLocation,
        _hash_info: &ContentHashWithSize,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        _options: &CopyOptions,
        cancel: &CancellationToken,
    ) -> CacheResult<CopyFileResult> {
        if cancel.is_cancelled() {
            return Ok(CopyFileResult::from_code(CopyCode::Cancelled));
        }
        let delay = *self.copy_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        let index = {
            let mut attempts = self.attempts.lock().unwrap();
            let index = attempts
                .iter()
                .filter(|(attempted, _)| attempted == source)
                .count();
            attempts.push((source.clone(), Instant::now()));
            index
        };
        let step = {
            let scripts = self.scripts.lock().unwrap();
            scripts
                .get(source)
                .map(|steps| steps[index.min(steps.len() - 1)].clone())
        };
        match step {
            None => Ok(CopyFileResult::from_code(CopyCode::FileNotFoundError)),
            Some(CopyScript::Data(data)) => {
                writer
                    .write_all(&data)
                    .await
                    .map_err(|e| CacheError::IoError(e.to_string()))?;
                Ok(CopyFileResult::success(data.len() as u64))
            }
            Some(CopyScript::Fail(code, message)) => Ok(match message {
                Some(message) => CopyFileResult::with_error(code, message),
                None => CopyFileResult::from_code(code),
            }),
        }
    }
}

pub struct MockResolver {
    entries: Mutex<HashMap<ContentHash, ResolvedContentEntry>>,
    pub query_count: AtomicU64,
}

impl MockResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            query_count: AtomicU64::new(0),
        })
    }

    pub fn set_locations(&self, hash: ContentHash, size: i64, machines: &[MachineId]) {
        let operations = machines
            .iter()
            .map(|machine| LocationOperation {
                op: LocationOpCode::Add,
                machine: *machine,
            })
            .collect();
        self.entries.lock().unwrap().insert(
            hash,
            ResolvedContentEntry {
                hash,
                size,
                operations,
            },
        );
    }
}

#[async_trait]
impl ContentResolver for MockResolver {
    async fn get_locations(
        &self,
        hashes: &[ContentHash],
        _cancel: &CancellationToken,
    ) -> CacheResult<Vec<ResolvedContentEntry>> {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.lock().unwrap();
        Ok(hashes
            .iter()
            .filter_map(|hash| entries.get(hash).cloned())
            .collect())
    }
}

pub struct MockClusterState {
    me: MachineId,
    locations: Mutex<HashMap<MachineId, MachineLocation>>,
    inactive: Mutex<HashSet<MachineId>>,
}

impl MockClusterState {
    pub fn new(me: MachineId) -> Arc<Self> {
        Arc::new(Self {
            me,
            locations: Mutex::new(HashMap::new()),
            inactive: Mutex::new(HashSet::new()),
        })
    }

    pub fn add_machine(&self, id: MachineId, location: MachineLocation) {
        self.locations.lock().unwrap().insert(id, location);
    }

    pub fn set_inactive(&self, id: MachineId) {
        self.inactive.lock().unwrap().insert(id);
    }
}

impl ClusterState for MockClusterState {
    fn primary_machine_id(&self) -> MachineId {
        self.me
    }

    fn location_of(&self, id: MachineId) -> Option<MachineLocation> {
        self.locations.lock().unwrap().get(&id).cloned()
    }

    fn is_inactive(&self, id: MachineId) -> bool {
        self.inactive.lock().unwrap().contains(&id)
    }
}

pub struct MockTracker {
    records: Mutex<HashMap<ContentHash, Vec<MachineId>>>,
}

impl MockTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_record(&self, hash: ContentHash, machines: Vec<MachineId>) {
        self.records.lock().unwrap().insert(hash, machines);
    }
}

#[async_trait]
impl ContentTracker for MockTracker {
    async fn get_local_record(
        &self,
        hash: &ContentHash,
        _cancel: &CancellationToken,
    ) -> CacheResult<Vec<MachineId>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }
}

/// Copy host that records every reputation and attempt report.
pub struct RecordingCopyHost {
    working_folder: PathBuf,
    pub reputations: Mutex<Vec<(MachineLocation, MachineReputation)>>,
    pub attempts: Mutex<Vec<CopyAttemptInfo>>,
}

impl RecordingCopyHost {
    pub fn new(working_folder: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            working_folder: working_folder.into(),
            reputations: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
        })
    }

    pub fn reputations_for(&self, location: &MachineLocation) -> Vec<MachineReputation> {
        self.reputations
            .lock()
            .unwrap()
            .iter()
            .filter(|(reported, _)| reported == location)
            .map(|(_, reputation)| *reputation)
            .collect()
    }
}

impl CopyHost for RecordingCopyHost {
    fn working_folder(&self) -> &Path {
        &self.working_folder
    }

    fn report_reputation(&self, location: &MachineLocation, reputation: MachineReputation) {
        self.reputations
            .lock()
            .unwrap()
            .push((location.clone(), reputation));
    }

    fn report_copy_result(
        &self,
        info: &CopyAttemptInfo,
        _result: &CopyFileResult,
    ) -> Option<String> {
        self.attempts.lock().unwrap().push(info.clone());
        None
    }
}

pub struct TestHarness {
    pub local: Arc<MemoryStore>,
    pub persistent: Arc<MemoryStore>,
    pub resolver: Arc<MockResolver>,
    pub cluster: Arc<MockClusterState>,
    pub tracker: Arc<MockTracker>,
    pub copier: Arc<ScriptedCopier>,
    pub host: Arc<EphemeralHost>,
    pub session: Arc<EphemeralSession>,
    pub workdir: tempfile::TempDir,
}

pub const PRIMARY: MachineId = MachineId(1);

pub fn build_harness(config: EphemeralCacheConfig) -> TestHarness {
    let workdir = tempfile::tempdir().unwrap();
    let local = MemoryStore::new("local");
    let persistent = MemoryStore::new("persistent");
    let resolver = MockResolver::new();
    let cluster = MockClusterState::new(PRIMARY);
    let tracker = MockTracker::new();
    let copier = ScriptedCopier::new();

    let host = EphemeralHost::new(
        Arc::new(config),
        cluster.clone(),
        resolver.clone(),
        tracker.clone(),
        copier.clone(),
        workdir.path().join("workspace"),
        None,
    )
    .unwrap();

    let session = Arc::new(EphemeralSession::new(
        local.clone(),
        persistent.clone(),
        host.clone(),
    ));

    TestHarness {
        local,
        persistent,
        resolver,
        cluster,
        tracker,
        copier,
        host,
        session,
        workdir,
    }
}

/// Files left under the workspace after an operation; must be empty on
/// every exit path.
pub fn workspace_files(host: &EphemeralHost) -> Vec<PathBuf> {
    std::fs::read_dir(host.workspace.root())
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .collect()
        })
        .unwrap_or_default()
}

/// Quick per-test config with short retry intervals.
pub fn fast_config() -> EphemeralCacheConfig {
    EphemeralCacheConfig {
        retry_intervals_ms: vec![10, 10, 10],
        ..Default::default()
    }
}
