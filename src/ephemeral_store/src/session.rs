use crate::{
    ContentReadSeek, ContentSource, ContentStore, ContentStream, CopyReason, CopyRequest,
    EphemeralHost, FileAccessMode, FileRealizationMode, FileReplacementMode, HandleCopy,
    PlaceFileResult, PutResult, TrustedContentStore, UrgencyHint,
};
use cache_lib::{
    CacheError, CacheResult, ContentHash, ContentHashWithSize, ContentHashWithSizeAndLocations,
    HashAlgorithm, LocationOrigin, MachineId,
};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncSeekExt;
use tokio_util::sync::CancellationToken;

/// Cheap per-session counters for host telemetry.
#[derive(Default)]
pub struct SessionCounters {
    local_hits: AtomicU64,
    datacenter_hits: AtomicU64,
    backing_hits: AtomicU64,
    elided_puts: AtomicU64,
    failed_copies: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCounterSnapshot {
    pub local_hits: u64,
    pub datacenter_hits: u64,
    pub backing_hits: u64,
    pub elided_puts: u64,
    pub failed_copies: u64,
}

impl SessionCounters {
    fn snapshot(&self) -> SessionCounterSnapshot {
        SessionCounterSnapshot {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            datacenter_hits: self.datacenter_hits.load(Ordering::Relaxed),
            backing_hits: self.backing_hits.load(Ordering::Relaxed),
            elided_puts: self.elided_puts.load(Ordering::Relaxed),
            failed_copies: self.failed_copies.load(Ordering::Relaxed),
        }
    }
}

/// Whether the persistent-fallback local populate runs in the
/// background or completes before the call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocalPopulate {
    Background,
    Sequenced,
}

/// Three-tier content session for one build: a small fast local store,
/// the peer-to-peer datacenter layer, and the durable backing store.
/// Tier order within one request is strict: local, then datacenter,
/// then backing store.
pub struct EphemeralSession {
    local: Arc<dyn TrustedContentStore>,
    persistent: Arc<dyn ContentStore>,
    host: Arc<EphemeralHost>,
    counters: SessionCounters,
}

impl EphemeralSession {
    /// The local store must support trusted puts (the type bound
    /// carries the capability the datacenter copy path depends on).
    pub fn new(
        local: Arc<dyn TrustedContentStore>,
        persistent: Arc<dyn ContentStore>,
        host: Arc<EphemeralHost>,
    ) -> Self {
        Self {
            local,
            persistent,
            host,
            counters: SessionCounters::default(),
        }
    }

    pub fn counters(&self) -> SessionCounterSnapshot {
        self.counters.snapshot()
    }

    /// The local store is too small to authoritatively pin build
    /// content; pins go straight to the backing store.
    pub async fn pin(&self, hash: &ContentHash, cancel: &CancellationToken) -> CacheResult<()> {
        self.persistent.pin(hash, cancel).await
    }

    pub async fn pin_bulk(
        &self,
        hashes: &[ContentHash],
        cancel: &CancellationToken,
    ) -> Vec<(ContentHash, CacheResult<()>)> {
        self.persistent.pin_bulk(hashes, cancel).await
    }

    pub async fn place_file(
        &self,
        hash: &ContentHash,
        path: &Path,
        access: FileAccessMode,
        replacement: FileReplacementMode,
        realization: FileRealizationMode,
        urgency: UrgencyHint,
        cancel: &CancellationToken,
    ) -> CacheResult<PlaceFileResult> {
        let result = self
            .place_file_impl(
                hash,
                path,
                access,
                replacement,
                realization,
                urgency,
                LocalPopulate::Background,
                cancel,
            )
            .await;
        Ok(Self::to_place_result(hash, result))
    }

    /// Places into a working-folder temp file and returns a read
    /// stream whose backing file the OS reclaims when the stream
    /// closes. The persistent-fallback local populate is sequenced
    /// before the temp path is unlinked, so the local put never
    /// observes a deleted file.
    pub async fn open_stream(
        &self,
        hash: &ContentHash,
        cancel: &CancellationToken,
    ) -> CacheResult<ContentStream> {
        let temp_path = self.host.workspace.random_temp_path(hash);
        let place = self
            .place_file_impl(
                hash,
                &temp_path,
                FileAccessMode::ReadOnly,
                FileReplacementMode::ReplaceExisting,
                FileRealizationMode::Any,
                UrgencyHint::Nominal,
                LocalPopulate::Sequenced,
                cancel,
            )
            .await;

        let place = match place {
            Ok(place) => place,
            Err(e) => {
                remove_quietly(&temp_path).await;
                return Err(e);
            }
        };
        match place {
            PlaceFileResult::Placed { .. } => {}
            PlaceFileResult::Cancelled { message } => {
                remove_quietly(&temp_path).await;
                return Err(CacheError::Cancelled(message));
            }
            PlaceFileResult::NotPlacedContentNotFound { message } => {
                remove_quietly(&temp_path).await;
                return Err(CacheError::NotFound(message));
            }
            PlaceFileResult::NotPlacedError { message } => {
                remove_quietly(&temp_path).await;
                return Err(CacheError::Internal(message));
            }
        }

        let file = tokio::fs::File::open(&temp_path).await.map_err(|e| {
            CacheError::IoError(format!(
                "open placed stream file {} failed: {}",
                temp_path.to_string_lossy(),
                e
            ))
        })?;
        // Unlink while the read handle is open; the handle owns the
        // bytes from here on.
        remove_quietly(&temp_path).await;
        Ok(Box::new(file))
    }

    pub async fn put_file(
        &self,
        algorithm: HashAlgorithm,
        path: &Path,
        realization: FileRealizationMode,
        cancel: &CancellationToken,
    ) -> CacheResult<PutResult> {
        if realization == FileRealizationMode::Move {
            return Ok(PutResult::Rejected {
                message: "put_file with move realization is not supported: the backing store \
                          must not consume the source file"
                    .to_string(),
            });
        }
        let result = self
            .put_file_impl(algorithm, path, realization, cancel)
            .await;
        Ok(Self::to_put_result(result))
    }

    /// Requires a seekable input; the original position is restored
    /// before each subsequent read because the local put may have
    /// consumed the stream.
    pub async fn put_stream(
        &self,
        algorithm: HashAlgorithm,
        stream: &mut dyn ContentReadSeek,
        cancel: &CancellationToken,
    ) -> CacheResult<PutResult> {
        let result = self.put_stream_impl(algorithm, stream, cancel).await;
        Ok(Self::to_put_result(result))
    }

    /// True iff at least one live peer other than this machine claims
    /// the hash, per the local tracker or the remote resolver. The
    /// predicate deliberately races with event propagation; callers
    /// keep correctness by checking authoritative stores when it says
    /// no.
    pub async fn exists_elsewhere(
        &self,
        hash: &ContentHash,
        cancel: &CancellationToken,
    ) -> CacheResult<bool> {
        let me = self.host.cluster.primary_machine_id();
        let is_live_peer = |id: MachineId| {
            id != me
                && !self.host.cluster.is_inactive(id)
                && self.host.cluster.location_of(id).is_some()
        };

        match self.host.tracker.get_local_record(hash, cancel).await {
            Ok(machines) => {
                if machines.iter().any(|id| is_live_peer(*id)) {
                    return Ok(true);
                }
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!(
                    "exists_elsewhere: local tracker query for {} failed: {}",
                    hash.short_hash(),
                    e
                );
            }
        }

        match self.host.resolver.get_single_location(hash, cancel).await {
            Ok(entry) => Ok(entry.existing().into_iter().any(is_live_peer)),
            Err(e) if e.is_cancelled() => Err(e),
            Err(_) => Ok(false),
        }
    }

    fn to_place_result(
        hash: &ContentHash,
        result: CacheResult<PlaceFileResult>,
    ) -> PlaceFileResult {
        match result {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => PlaceFileResult::Cancelled {
                message: e.to_string(),
            },
            Err(e) => PlaceFileResult::NotPlacedError {
                message: format!("place of {} failed: {}", hash.short_hash(), e),
            },
        }
    }

    fn to_put_result(result: CacheResult<PutResult>) -> PutResult {
        match result {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => PutResult::Cancelled {
                message: e.to_string(),
            },
            Err(e) => PutResult::Failure {
                message: e.to_string(),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn place_file_impl(
        &self,
        hash: &ContentHash,
        path: &Path,
        access: FileAccessMode,
        replacement: FileReplacementMode,
        realization: FileRealizationMode,
        urgency: UrgencyHint,
        populate: LocalPopulate,
        cancel: &CancellationToken,
    ) -> CacheResult<PlaceFileResult> {
        if let Some(placed) = self
            .try_place_local(hash, path, access, replacement, realization, urgency, cancel)
            .await?
        {
            return Ok(placed);
        }

        let gate = self.host.gate.acquire(*hash, cancel).await?;
        if !gate.wait_free() {
            // Another thread may have just populated the local store
            // with this very hash.
            if let Some(placed) = self
                .try_place_local(hash, path, access, replacement, realization, urgency, cancel)
                .await?
            {
                return Ok(placed);
            }
        }

        let datacenter = self
            .try_place_from_datacenter(hash, path, access, replacement, realization, urgency, cancel)
            .await?;
        match datacenter {
            PlaceFileResult::Placed {
                size,
                already_exists,
                ..
            } => {
                self.host
                    .elision_cache
                    .try_add(hash, size, self.host.config.put_elision_ttl());
                self.counters.datacenter_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(PlaceFileResult::Placed {
                    hash: *hash,
                    size,
                    source: ContentSource::DatacenterCache,
                    already_exists,
                });
            }
            PlaceFileResult::Cancelled { message } => {
                return Ok(PlaceFileResult::Cancelled { message });
            }
            PlaceFileResult::NotPlacedContentNotFound { message }
            | PlaceFileResult::NotPlacedError { message } => {
                debug!(
                    "place_file: datacenter miss for {}: {}",
                    hash.short_hash(),
                    message
                );
            }
        }

        let persistent = self
            .persistent
            .place_file(hash, path, access, replacement, realization, urgency, cancel)
            .await?;
        match persistent {
            PlaceFileResult::Placed {
                size,
                already_exists,
                ..
            } => {
                self.host
                    .elision_cache
                    .try_add(hash, size, self.host.config.put_elision_ttl());
                self.counters.backing_hits.fetch_add(1, Ordering::Relaxed);
                self.populate_local(hash, path, populate).await;
                Ok(PlaceFileResult::Placed {
                    hash: *hash,
                    size,
                    source: ContentSource::BackingStore,
                    already_exists,
                })
            }
            PlaceFileResult::Cancelled { message } => Ok(PlaceFileResult::Cancelled { message }),
            PlaceFileResult::NotPlacedError { message } => {
                Ok(PlaceFileResult::NotPlacedError { message })
            }
            PlaceFileResult::NotPlacedContentNotFound { .. } => {
                Ok(PlaceFileResult::NotPlacedContentNotFound {
                    message: format!(
                        "{} not found locally, in the datacenter, or in the backing store",
                        hash.short_hash()
                    ),
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_place_local(
        &self,
        hash: &ContentHash,
        path: &Path,
        access: FileAccessMode,
        replacement: FileReplacementMode,
        realization: FileRealizationMode,
        urgency: UrgencyHint,
        cancel: &CancellationToken,
    ) -> CacheResult<Option<PlaceFileResult>> {
        match self
            .local
            .place_file(hash, path, access, replacement, realization, urgency, cancel)
            .await
        {
            Ok(PlaceFileResult::Placed {
                size,
                already_exists,
                ..
            }) => {
                self.host
                    .elision_cache
                    .try_add(hash, size, self.host.config.put_elision_ttl());
                self.counters.local_hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(PlaceFileResult::Placed {
                    hash: *hash,
                    size,
                    source: ContentSource::LocalCache,
                    already_exists,
                }))
            }
            Ok(_) => Ok(None),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => {
                warn!(
                    "place_file: local place of {} failed: {}",
                    hash.short_hash(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Best-effort copy of a just-placed file into the local store.
    /// Errors are ignored: local population only saves future work.
    async fn populate_local(&self, hash: &ContentHash, path: &Path, populate: LocalPopulate) {
        let local = self.local.clone();
        let algorithm = hash.algorithm();
        let hash = *hash;
        let path = path.to_path_buf();
        let populate_once = async move {
            let result = local
                .put_file(
                    algorithm,
                    &path,
                    FileRealizationMode::Any,
                    &CancellationToken::new(),
                )
                .await;
            match result {
                Ok(put) if put.is_success() => {}
                Ok(put) => debug!(
                    "populate_local: local put of {} did not succeed: {:?}",
                    hash.short_hash(),
                    put
                ),
                Err(e) => debug!(
                    "populate_local: local put of {} failed: {}",
                    hash.short_hash(),
                    e
                ),
            }
        };
        match populate {
            LocalPopulate::Background => {
                tokio::spawn(populate_once);
            }
            LocalPopulate::Sequenced => populate_once.await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_place_from_datacenter(
        &self,
        hash: &ContentHash,
        path: &Path,
        access: FileAccessMode,
        replacement: FileReplacementMode,
        realization: FileRealizationMode,
        urgency: UrgencyHint,
        cancel: &CancellationToken,
    ) -> CacheResult<PlaceFileResult> {
        let entry = match self.host.resolver.get_single_location(hash, cancel).await {
            Ok(entry) => entry,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                return Ok(PlaceFileResult::NotPlacedContentNotFound {
                    message: format!(
                        "no locations resolved for {}: {}",
                        hash.short_hash(),
                        e
                    ),
                });
            }
        };

        let me = self.host.cluster.primary_machine_id();
        let existing = entry.existing();
        let mut active = Vec::new();
        let mut inactive = Vec::new();
        let mut invalid = 0usize;
        for id in &existing {
            if *id == me {
                continue;
            }
            match self.host.cluster.location_of(*id) {
                Some(location) if !self.host.cluster.is_inactive(*id) => active.push(location),
                Some(location) => inactive.push(location),
                None => {
                    invalid += 1;
                    warn!(
                        "place_file: resolver listed machine {} for {} but cluster state does \
                         not know it",
                        id,
                        hash.short_hash()
                    );
                }
            }
        }

        if active.is_empty() {
            return Ok(PlaceFileResult::NotPlacedContentNotFound {
                message: format!(
                    "no active replicas for {}: resolver listed {} machines ({} inactive, {} \
                     unknown to cluster state)",
                    hash.short_hash(),
                    existing.len(),
                    inactive.len(),
                    invalid
                ),
            });
        }

        let expected = ContentHashWithSize::new(*hash, entry.size);
        let hash_info = ContentHashWithSizeAndLocations {
            hash_info: expected,
            locations: active,
            filtered_out_locations: inactive,
            origin: LocationOrigin::Global,
        };

        let local = self.local.clone();
        let cancel_for_put = cancel.clone();
        let handle_copy: HandleCopy = Box::new(move |copy_result, temp_path, _attempt| {
            let local = local.clone();
            let cancel = cancel_for_put.clone();
            Box::pin(async move {
                let size = copy_result.size.map(|s| s as i64).unwrap_or(expected.size);
                let verified = ContentHashWithSize::new(expected.hash, size);
                // Trusted put: the copy engine already stream-verified
                // the hash.
                local
                    .put_trusted_file(&verified, &temp_path, FileRealizationMode::Copy, &cancel)
                    .await
            })
        });

        let request = CopyRequest {
            hash_info,
            reason: CopyReason::Place,
            compression_hint: false,
            in_ring_machines: Vec::new(),
            working_folder_override: None,
            handle_copy,
        };

        let put = self.host.copier.try_copy_and_put(&request, cancel).await?;
        match put {
            PutResult::Success { .. } => {
                // Realize the final path, access and replacement
                // semantics through the local store.
                match self
                    .local
                    .place_file(hash, path, access, replacement, realization, urgency, cancel)
                    .await?
                {
                    PlaceFileResult::Placed {
                        size,
                        already_exists,
                        ..
                    } => Ok(PlaceFileResult::Placed {
                        hash: *hash,
                        size,
                        source: ContentSource::DatacenterCache,
                        already_exists,
                    }),
                    other => Ok(PlaceFileResult::NotPlacedError {
                        message: format!(
                            "local place after datacenter copy of {} failed: {:?}",
                            hash.short_hash(),
                            other
                        ),
                    }),
                }
            }
            PutResult::Cancelled { message } => Ok(PlaceFileResult::Cancelled { message }),
            PutResult::Rejected { message } | PutResult::Failure { message } => {
                self.counters.failed_copies.fetch_add(1, Ordering::Relaxed);
                Ok(PlaceFileResult::NotPlacedContentNotFound { message })
            }
        }
    }

    async fn put_file_impl(
        &self,
        algorithm: HashAlgorithm,
        path: &Path,
        realization: FileRealizationMode,
        cancel: &CancellationToken,
    ) -> CacheResult<PutResult> {
        let local_put = self
            .local
            .put_file(algorithm, path, realization, cancel)
            .await?;
        let (hash, size) = match &local_put {
            PutResult::Success {
                hash,
                size,
                already_existed,
                ..
            } => {
                if *already_existed {
                    // A previous put in this build cycle already went
                    // through the upload pipeline.
                    return Ok(local_put);
                }
                (*hash, *size)
            }
            _ => return Ok(local_put),
        };

        self.finish_put(hash, size, cancel, move || async move {
            self.persistent
                .put_file(algorithm, path, realization, cancel)
                .await
        })
        .await
    }

    async fn put_stream_impl(
        &self,
        algorithm: HashAlgorithm,
        stream: &mut dyn ContentReadSeek,
        cancel: &CancellationToken,
    ) -> CacheResult<PutResult> {
        let start_pos = stream.seek(SeekFrom::Current(0)).await.map_err(|e| {
            CacheError::InvalidParam(format!("put_stream requires a seekable input: {}", e))
        })?;

        let local_put = self.local.put_stream(algorithm, stream, cancel).await?;
        let (hash, size) = match &local_put {
            PutResult::Success {
                hash,
                size,
                already_existed,
                ..
            } => {
                if *already_existed {
                    return Ok(local_put);
                }
                (*hash, *size)
            }
            _ => return Ok(local_put),
        };

        // The local put consumed the stream; rewind before any
        // further read.
        stream.seek(SeekFrom::Start(start_pos)).await.map_err(|e| {
            CacheError::IoError(format!("rewind stream for remote put failed: {}", e))
        })?;

        self.finish_put(hash, size, cancel, move || async move {
            self.persistent.put_stream(algorithm, stream, cancel).await
        })
        .await
    }

    /// Shared upload pipeline after a successful local put: elision
    /// check, single-flight gate, cluster-wide existence probe, and
    /// only then the backing-store upload.
    async fn finish_put<F, Fut>(
        &self,
        hash: ContentHash,
        size: i64,
        cancel: &CancellationToken,
        upload: F,
    ) -> CacheResult<PutResult>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CacheResult<PutResult>>,
    {
        let ttl = self.host.config.put_elision_ttl();
        let elided = PutResult::Success {
            hash,
            size,
            source: ContentSource::DatacenterCache,
            already_existed: true,
        };

        if self.host.elision_cache.try_get(&hash).is_some() {
            self.counters.elided_puts.fetch_add(1, Ordering::Relaxed);
            return Ok(elided);
        }

        let gate = self.host.gate.acquire(hash, cancel).await?;
        if !gate.wait_free() && self.host.elision_cache.try_get(&hash).is_some() {
            self.counters.elided_puts.fetch_add(1, Ordering::Relaxed);
            return Ok(elided);
        }

        if self.exists_elsewhere(&hash, cancel).await.unwrap_or(false) {
            self.host.elision_cache.try_add(&hash, size, ttl);
            self.counters.elided_puts.fetch_add(1, Ordering::Relaxed);
            return Ok(elided);
        }

        let remote_put = upload().await?;
        match remote_put {
            PutResult::Success {
                already_existed, ..
            } => {
                self.host.elision_cache.try_add(&hash, size, ttl);
                Ok(PutResult::Success {
                    hash,
                    size,
                    source: ContentSource::BackingStore,
                    already_existed,
                })
            }
            other => Ok(other),
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                "remove temp file {} failed: {}",
                path.to_string_lossy(),
                e
            );
        }
    }
}
