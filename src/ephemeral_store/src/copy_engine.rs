use crate::{
    random_temp_path, CopyAttemptInfo, CopyCode, CopyFileResult, CopyHost, CopyOptions,
    CopyReason, CopyScheduler, EphemeralCacheConfig, HashingWriter, MachineReputation, PutResult,
    RemoteFileCopier, ScheduleResult, SchedulerFailureCode,
};
use cache_lib::{
    CacheError, CacheResult, ContentHashWithSize, ContentHashWithSizeAndLocations, HashAlgorithm,
    MachineLocation, UNKNOWN_CONTENT_SIZE,
};
use futures::future::BoxFuture;
use rand::Rng;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Continuation that commits copied bytes into the local store and
/// returns the put outcome. Invoked once per successful byte-accurate
/// copy; the engine may call it again for a different replica after a
/// hash mismatch, so it must be free of side effects on failure paths
/// other than best-effort writes to the local store.
pub type HandleCopy =
    Box<dyn Fn(CopyFileResult, PathBuf, u32) -> BoxFuture<'static, CacheResult<PutResult>> + Send + Sync>;

pub struct CopyRequest {
    pub hash_info: ContentHashWithSizeAndLocations,
    pub reason: CopyReason,
    pub compression_hint: bool,
    /// Peers in the current build's declared ring, appended after
    /// index-registered locations.
    pub in_ring_machines: Vec<MachineLocation>,
    pub working_folder_override: Option<PathBuf>,
    pub handle_copy: HandleCopy,
}

#[derive(Debug, Clone)]
pub struct CandidateLocation {
    pub location: MachineLocation,
    pub from_ring: bool,
}

impl CopyRequest {
    /// Index-registered locations first (original order), then in-ring
    /// machines not already present.
    pub fn all_location_candidates(&self) -> Vec<CandidateLocation> {
        let mut candidates: Vec<CandidateLocation> = self
            .hash_info
            .locations
            .iter()
            .map(|location| CandidateLocation {
                location: location.clone(),
                from_ring: false,
            })
            .collect();
        for machine in &self.in_ring_machines {
            if !self.hash_info.locations.contains(machine) {
                candidates.push(CandidateLocation {
                    location: machine.clone(),
                    from_ring: true,
                });
            }
        }
        candidates
    }
}

struct WalkState {
    missing: HashSet<usize>,
    bad: HashSet<usize>,
    last_failure_time: Vec<Option<Instant>>,
    total_retries: u32,
    last_result: Option<CopyFileResult>,
}

impl WalkState {
    fn new(candidate_count: usize) -> Self {
        Self {
            missing: HashSet::new(),
            bad: HashSet::new(),
            last_failure_time: vec![None; candidate_count],
            total_retries: 0,
            last_result: None,
        }
    }

    fn describe_last(&self) -> String {
        match &self.last_result {
            Some(result) => format!(
                "{:?}{}",
                result.code,
                result
                    .error_message
                    .as_ref()
                    .map(|m| format!(" ({})", m))
                    .unwrap_or_default()
            ),
            None => "none".to_string(),
        }
    }
}

enum WalkOutcome {
    Succeeded(PutResult),
    Cancelled,
    Failed { reason: String, should_retry: bool },
}

enum ReplicaStep {
    Succeeded(PutResult),
    Cancelled,
    NextReplica,
    StopPass { reason: String, should_retry: bool },
}

fn jitter_interval(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    interval.mul_f64(factor)
}

fn is_out_of_disk_space(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("no space left")
        || lower.contains("not enough space")
        || lower.contains("disk full")
}

fn error_to_copy_result(err: CacheError) -> CopyFileResult {
    let code = match &err {
        CacheError::Cancelled(_) => CopyCode::Cancelled,
        CacheError::Timeout(_) => CopyCode::CopyTimeout,
        CacheError::NotFound(_) => CopyCode::FileNotFoundError,
        CacheError::RemoteError(_) => CopyCode::RpcError,
        _ => CopyCode::Unknown,
    };
    CopyFileResult::with_error(code, err.to_string())
}

/// Retrieves a content-addressed blob from a set of candidate peers,
/// streaming into a temp file and committing through the caller's
/// continuation. Owns retry, scheduling and trusted-hash verification;
/// the transport and the stores stay behind traits.
pub struct ContentCopier {
    config: Arc<EphemeralCacheConfig>,
    scheduler: CopyScheduler,
    remote: Arc<dyn RemoteFileCopier>,
    host: Arc<dyn CopyHost>,
}

impl ContentCopier {
    pub fn new(
        config: Arc<EphemeralCacheConfig>,
        remote: Arc<dyn RemoteFileCopier>,
        host: Arc<dyn CopyHost>,
    ) -> Self {
        let scheduler = CopyScheduler::new(&config);
        Self {
            config,
            scheduler,
            remote,
            host,
        }
    }

    // Trusted streaming needs a locally computable digest; other
    // algorithm tags fall back to the store's own verification.
    fn use_trusted_hash(&self, expected: &ContentHashWithSize) -> bool {
        expected.size >= self.config.trusted_hash_file_size_boundary
            && expected.hash.algorithm() == HashAlgorithm::Sha256
    }

    pub async fn try_copy_and_put(
        &self,
        request: &CopyRequest,
        cancel: &CancellationToken,
    ) -> CacheResult<PutResult> {
        let expected = request.hash_info.hash_info;
        let candidates = request.all_location_candidates();
        if candidates.is_empty() {
            return Ok(PutResult::Failure {
                message: format!("no candidate locations for {}", expected.hash.short_hash()),
            });
        }

        let mut retry_intervals = self.config.retry_intervals();
        if retry_intervals.is_empty() {
            retry_intervals.push(Duration::ZERO);
        }
        let mut state = WalkState::new(candidates.len());
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(PutResult::Cancelled {
                    message: format!("copy of {} cancelled", expected.hash.short_hash()),
                });
            }

            let max_replicas = if attempt < self.config.copy_attempts_with_restricted_replicas {
                self.config
                    .restricted_copy_replica_count
                    .min(candidates.len())
            } else {
                candidates.len()
            };
            let interval = retry_intervals[attempt as usize];

            let outcome = self
                .walk_locations_and_copy_and_put(
                    request,
                    &candidates,
                    &mut state,
                    attempt,
                    max_replicas,
                    interval,
                    cancel,
                )
                .await;

            match outcome {
                WalkOutcome::Succeeded(put) => return Ok(put),
                WalkOutcome::Cancelled => {
                    return Ok(PutResult::Cancelled {
                        message: format!("copy of {} cancelled", expected.hash.short_hash()),
                    });
                }
                WalkOutcome::Failed {
                    reason,
                    should_retry,
                } => {
                    if state.missing.len() == candidates.len() {
                        error!(
                            "try_copy_and_put: all {} replicas report {} missing",
                            candidates.len(),
                            expected.hash.short_hash()
                        );
                        return Ok(PutResult::Failure {
                            message: format!(
                                "content {} missing from all {} replicas",
                                expected.hash.short_hash(),
                                candidates.len()
                            ),
                        });
                    }
                    if !should_retry {
                        error!(
                            "try_copy_and_put: giving up on {}: {}",
                            expected.hash.short_hash(),
                            reason
                        );
                        return Ok(PutResult::Failure { message: reason });
                    }
                    attempt += 1;
                    if attempt as usize >= retry_intervals.len() {
                        error!(
                            "try_copy_and_put: retry table exhausted for {}, last result: {}",
                            expected.hash.short_hash(),
                            state.describe_last()
                        );
                        return Ok(PutResult::Failure {
                            message: format!(
                                "retry table exhausted for {}, last result: {}",
                                expected.hash.short_hash(),
                                state.describe_last()
                            ),
                        });
                    }
                    warn!(
                        "try_copy_and_put: attempt {} for {} failed: {}, retrying",
                        attempt - 1,
                        expected.hash.short_hash(),
                        reason
                    );
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn walk_locations_and_copy_and_put(
        &self,
        request: &CopyRequest,
        candidates: &[CandidateLocation],
        state: &mut WalkState,
        attempt: u32,
        max_replicas: usize,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> WalkOutcome {
        // Bad marks are per-pass: transient network errors must not
        // stick. Missing marks persist for the whole request.
        state.bad.clear();
        let expected = request.hash_info.hash_info;
        let working_folder = request
            .working_folder_override
            .clone()
            .unwrap_or_else(|| self.host.working_folder().to_path_buf());

        for replica_index in 0..max_replicas {
            let candidate = &candidates[replica_index];

            if state.total_retries + replica_index as u32 >= self.config.max_retry_count {
                return WalkOutcome::Failed {
                    reason: format!(
                        "max retry count {} reached for {}, last result: {}",
                        self.config.max_retry_count,
                        expected.hash.short_hash(),
                        state.describe_last()
                    ),
                    should_retry: false,
                };
            }

            if state.missing.contains(&replica_index) {
                continue;
            }

            if let Some(last_failure) = state.last_failure_time[replica_index] {
                let jittered = jitter_interval(interval);
                let elapsed = last_failure.elapsed();
                if jittered > elapsed {
                    tokio::select! {
                        _ = tokio::time::sleep(jittered - elapsed) => {}
                        _ = cancel.cancelled() => return WalkOutcome::Cancelled,
                    }
                }
            }

            let temp_path = random_temp_path(&working_folder, &expected.hash);
            let step = self
                .copy_one_replica(
                    request,
                    candidate,
                    replica_index,
                    attempt,
                    &expected,
                    &temp_path,
                    state,
                    cancel,
                )
                .await;

            state.last_failure_time[replica_index] = Some(Instant::now());
            if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "walk_locations: remove temp file {} failed: {}",
                        temp_path.to_string_lossy(),
                        e
                    );
                }
            }

            match step {
                ReplicaStep::Succeeded(put) => return WalkOutcome::Succeeded(put),
                ReplicaStep::Cancelled => return WalkOutcome::Cancelled,
                ReplicaStep::StopPass {
                    reason,
                    should_retry,
                } => {
                    return WalkOutcome::Failed {
                        reason,
                        should_retry,
                    }
                }
                ReplicaStep::NextReplica => {}
            }
        }

        WalkOutcome::Failed {
            reason: format!(
                "attempt {}: no replica produced a usable copy of {} ({} bad, {} missing), \
                 last result: {}",
                attempt,
                expected.hash.short_hash(),
                state.bad.len(),
                state.missing.len(),
                state.describe_last()
            ),
            should_retry: true,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_one_replica(
        &self,
        request: &CopyRequest,
        candidate: &CandidateLocation,
        replica_index: usize,
        attempt: u32,
        expected: &ContentHashWithSize,
        temp_path: &Path,
        state: &mut WalkState,
        cancel: &CancellationToken,
    ) -> ReplicaStep {
        state.total_retries += 1;
        // Past half of the allowed retries the per-attempt bandwidth
        // profile falls through to the default.
        let effective_attempt = if state.total_retries > self.config.max_retry_count / 2 {
            -1
        } else {
            attempt as i32
        };

        let schedule = self
            .scheduler
            .schedule_pull(request.reason, effective_attempt, || {
                self.copy_file_to_temp(
                    &candidate.location,
                    expected,
                    temp_path,
                    effective_attempt,
                    request.compression_hint,
                    cancel,
                )
            })
            .await;

        let (copy_result, summary) = match schedule {
            ScheduleResult::Executed(result, summary) => (result, summary),
            ScheduleResult::Failed(SchedulerFailureCode::Timeout) => {
                warn!(
                    "copy_one_replica: scheduler admission timed out for {} at {}",
                    expected.hash.short_hash(),
                    candidate.location
                );
                state.last_result = Some(CopyFileResult::with_error(
                    CopyCode::CopyTimeout,
                    "scheduler admission timeout",
                ));
                return ReplicaStep::NextReplica;
            }
        };

        let info = CopyAttemptInfo {
            location: candidate.location.clone(),
            from_ring: candidate.from_ring,
            attempt,
            replica_index,
            queue_wait: summary.queue_wait,
            code: copy_result.code,
        };
        if let Some(annotation) = self.host.report_copy_result(&info, &copy_result) {
            debug!(
                "copy_one_replica: host annotation for {} at {}: {}",
                expected.hash.short_hash(),
                candidate.location,
                annotation
            );
        }

        match copy_result.code {
            CopyCode::Success => {
                self.host
                    .report_reputation(&candidate.location, MachineReputation::Good);
            }
            CopyCode::FileNotFoundError => {
                self.host
                    .report_reputation(&candidate.location, MachineReputation::Missing);
                state.missing.insert(replica_index);
                info!(
                    "copy_one_replica: {} missing at {}, skipping replica for remaining passes",
                    expected.hash.short_hash(),
                    candidate.location
                );
                state.last_result = Some(copy_result);
                return ReplicaStep::NextReplica;
            }
            code @ (CopyCode::ConnectionTimeout
            | CopyCode::TimeToFirstByteTimeout
            | CopyCode::CopyTimeout
            | CopyCode::CopyBandwidthTimeout) => {
                self.host
                    .report_reputation(&candidate.location, MachineReputation::Timeout);
                state.bad.insert(replica_index);
                warn!(
                    "copy_one_replica: {:?} copying {} from {}",
                    code,
                    expected.hash.short_hash(),
                    candidate.location
                );
                state.last_result = Some(copy_result);
                return ReplicaStep::NextReplica;
            }
            code @ (CopyCode::ServerUnavailable
            | CopyCode::UnknownServerError
            | CopyCode::RpcError
            | CopyCode::Unknown) => {
                self.host
                    .report_reputation(&candidate.location, MachineReputation::Bad);
                state.bad.insert(replica_index);
                warn!(
                    "copy_one_replica: {:?} copying {} from {}: {}",
                    code,
                    expected.hash.short_hash(),
                    candidate.location,
                    copy_result.error_message.as_deref().unwrap_or("")
                );
                state.last_result = Some(copy_result);
                return ReplicaStep::NextReplica;
            }
            CopyCode::DestinationPathError => {
                let message = copy_result.error_message.clone().unwrap_or_default();
                let out_of_disk = is_out_of_disk_space(&message);
                let reason = if out_of_disk {
                    format!("destination out of disk space: {}", message)
                } else {
                    format!("destination path error: {}", message)
                };
                state.last_result = Some(copy_result);
                return ReplicaStep::StopPass {
                    reason,
                    should_retry: !out_of_disk,
                };
            }
            CopyCode::InvalidHash => {
                // No reputation change: the diagnostic already names
                // the replica and the next one may serve good bytes.
                warn!(
                    "copy_one_replica: invalid hash from {} for {}: {}",
                    candidate.location,
                    expected.hash.short_hash(),
                    copy_result.error_message.as_deref().unwrap_or("")
                );
                state.last_result = Some(copy_result);
                return ReplicaStep::NextReplica;
            }
            CopyCode::Cancelled => return ReplicaStep::Cancelled,
        }

        if expected.size != UNKNOWN_CONTENT_SIZE {
            if let Some(observed) = copy_result.size {
                if observed as i64 != expected.size {
                    warn!(
                        "copy_one_replica: size mismatch for {} from {}: expected {} got {}",
                        expected.hash.short_hash(),
                        candidate.location,
                        expected.size,
                        observed
                    );
                    state.last_result = Some(CopyFileResult::with_error(
                        CopyCode::InvalidHash,
                        format!("size mismatch: expected {} got {}", expected.size, observed),
                    ));
                    return ReplicaStep::NextReplica;
                }
            }
        }

        let put = (request.handle_copy)(copy_result.clone(), temp_path.to_path_buf(), attempt).await;
        match put {
            Ok(put) => match &put {
                PutResult::Success { hash, .. } => {
                    if *hash == expected.hash {
                        ReplicaStep::Succeeded(put)
                    } else {
                        self.host
                            .report_reputation(&candidate.location, MachineReputation::Bad);
                        warn!(
                            "copy_one_replica: put of bytes from {} produced {} but expected {}",
                            candidate.location,
                            hash.short_hash(),
                            expected.hash.short_hash()
                        );
                        state.last_result = Some(copy_result);
                        ReplicaStep::NextReplica
                    }
                }
                PutResult::Cancelled { .. } => ReplicaStep::Cancelled,
                PutResult::Rejected { message } | PutResult::Failure { message } => {
                    ReplicaStep::StopPass {
                        reason: format!("local put failed: {}", message),
                        should_retry: false,
                    }
                }
            },
            Err(e) if e.is_cancelled() => ReplicaStep::Cancelled,
            Err(e) => ReplicaStep::StopPass {
                reason: format!("local put failed: {}", e),
                should_retry: false,
            },
        }
    }

    async fn copy_file_to_temp(
        &self,
        location: &MachineLocation,
        expected: &ContentHashWithSize,
        temp_path: &Path,
        effective_attempt: i32,
        compression_hint: bool,
        cancel: &CancellationToken,
    ) -> CopyFileResult {
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp_path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                return CopyFileResult::with_error(
                    CopyCode::DestinationPathError,
                    format!("open temp file {} failed: {}", temp_path.to_string_lossy(), e),
                );
            }
        };
        if expected.size > 0 {
            if let Err(e) = file.set_len(expected.size as u64).await {
                return CopyFileResult::with_error(
                    CopyCode::DestinationPathError,
                    format!("preallocate {} bytes failed: {}", expected.size, e),
                );
            }
        }

        let options = CopyOptions {
            bandwidth: Some(self.scheduler.bandwidth_for_attempt(effective_attempt)),
            absolute_timeout: None,
            compression_hint,
        };

        if self.use_trusted_hash(expected) {
            let mut writer = match HashingWriter::new(
                file,
                expected.size,
                self.config.parallel_hashing_file_size_boundary,
            ) {
                Ok(writer) => writer,
                Err(e) => {
                    return CopyFileResult::with_error(
                        CopyCode::Unknown,
                        format!("create hashing stream failed: {}", e),
                    );
                }
            };
            let result = self
                .remote
                .copy_to(location, expected, &mut writer, &options, cancel)
                .await;
            return match result {
                Ok(copy_result) if copy_result.is_success() => {
                    if let Err(e) = writer.flush().await {
                        return CopyFileResult::with_error(
                            CopyCode::DestinationPathError,
                            format!("flush temp file failed: {}", e),
                        );
                    }
                    let summary = match writer.finalize().await {
                        Ok(summary) => summary,
                        Err(e) => {
                            return CopyFileResult::with_error(
                                CopyCode::Unknown,
                                format!("finalize hashing stream failed: {}", e),
                            );
                        }
                    };
                    if summary.hash != expected.hash {
                        return CopyFileResult {
                            code: CopyCode::InvalidHash,
                            size: Some(summary.bytes_written),
                            minimum_speed_mbps: copy_result.minimum_speed_mbps,
                            header_response_time: copy_result.header_response_time,
                            time_spent_hashing: Some(summary.time_spent_hashing),
                            time_spent_writing_to_disk: Some(summary.time_spent_writing_to_disk),
                            error_message: Some(format!(
                                "streamed bytes hash to {} expected {} (found size {}, expected size {}, min bandwidth {:?} MB/s)",
                                summary.hash.short_hash(),
                                expected.hash.short_hash(),
                                summary.bytes_written,
                                expected.size,
                                copy_result.minimum_speed_mbps
                            )),
                        };
                    }
                    let mut verified = copy_result;
                    verified.size = Some(summary.bytes_written);
                    verified.time_spent_hashing = Some(summary.time_spent_hashing);
                    verified.time_spent_writing_to_disk = Some(summary.time_spent_writing_to_disk);
                    verified
                }
                Ok(copy_result) => copy_result,
                Err(e) => error_to_copy_result(e),
            };
        }

        let result = self
            .remote
            .copy_to(location, expected, &mut file, &options, cancel)
            .await;
        match result {
            Ok(copy_result) => {
                if copy_result.is_success() {
                    if let Err(e) = file.flush().await {
                        return CopyFileResult::with_error(
                            CopyCode::DestinationPathError,
                            format!("flush temp file failed: {}", e),
                        );
                    }
                }
                copy_result
            }
            Err(e) => error_to_copy_result(e),
        }
    }
}
