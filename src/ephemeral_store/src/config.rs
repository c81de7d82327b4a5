use cache_lib::{CacheError, CacheResult, ContentHash};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const TEMP_FILE_EXT: &str = "tmp";

/// Per-attempt bandwidth requirement: at least `required_bytes` must
/// arrive within every `interval_ms` window or the transport reports
/// `CopyBandwidthTimeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthConfiguration {
    pub interval_ms: u64,
    pub required_bytes: u64,
}

impl BandwidthConfiguration {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for BandwidthConfiguration {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            required_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EphemeralCacheConfig {
    pub copy_attempts_with_restricted_replicas: u32,
    pub restricted_copy_replica_count: usize,
    /// Bytes after which inline hashing moves off the write path; -1
    /// disables the parallel upgrade.
    pub parallel_hashing_file_size_boundary: i64,
    /// Minimum size for trusted-hash streaming; -1 means always trusted.
    pub trusted_hash_file_size_boundary: i64,
    pub max_retry_count: u32,
    pub retry_intervals_ms: Vec<u64>,
    pub put_elision_ttl_secs: u64,
    pub max_concurrent_pulls: usize,
    pub max_concurrent_pushes: usize,
    pub scheduler_admission_timeout_secs: u64,
    /// Indexed by attempt number; attempts past the table (or forced
    /// index -1) use the default profile.
    pub bandwidth_configurations: Vec<BandwidthConfiguration>,
}

impl Default for EphemeralCacheConfig {
    fn default() -> Self {
        Self {
            copy_attempts_with_restricted_replicas: 0,
            restricted_copy_replica_count: 3,
            parallel_hashing_file_size_boundary: -1,
            trusted_hash_file_size_boundary: -1,
            max_retry_count: 32,
            retry_intervals_ms: vec![20, 200, 1_000, 5_000, 10_000, 30_000, 60_000, 120_000],
            put_elision_ttl_secs: 600,
            max_concurrent_pulls: 16,
            max_concurrent_pushes: 8,
            scheduler_admission_timeout_secs: 600,
            bandwidth_configurations: Vec::new(),
        }
    }
}

impl EphemeralCacheConfig {
    pub fn retry_intervals(&self) -> Vec<Duration> {
        self.retry_intervals_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn put_elision_ttl(&self) -> Duration {
        Duration::from_secs(self.put_elision_ttl_secs)
    }

    pub fn scheduler_admission_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler_admission_timeout_secs)
    }
}

/// Unique temp path for one copy attempt. Names must be globally
/// unique per call because the working folder is shared across
/// concurrent copies.
pub fn random_temp_path(folder: &Path, hash: &ContentHash) -> PathBuf {
    folder.join(format!(
        "{}-{:08x}.{}",
        hash.short_hash(),
        rand::random::<u32>(),
        TEMP_FILE_EXT
    ))
}

/// The per-build working folder. Everything under it is transient;
/// lifetime is bounded by a single build.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            CacheError::IoError(format!(
                "create working folder {} failed: {}",
                root.to_string_lossy(),
                e
            ))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn random_temp_path(&self, hash: &ContentHash) -> PathBuf {
        random_temp_path(&self.root, hash)
    }

    /// Remove temp files a previous crash of the same build left
    /// behind. Best effort.
    pub async fn cleanup(&self) {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(e) => {
                debug!("workspace cleanup: read_dir failed: {}", e);
                return;
            }
        };
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(TEMP_FILE_EXT) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(
                        "workspace cleanup: remove {} failed: {}",
                        path.to_string_lossy(),
                        e
                    );
                }
            }
        }
    }
}
