use crate::{
    ClusterState, ContentCopier, ContentResolver, ContentTracker, CopyAttemptInfo,
    CopyFileResult, CopyHost, EphemeralCacheConfig, MachineReputation, RemoteFileCopier,
    Workspace,
};
use cache_lib::{CacheResult, ElisionCache, MachineLocation, SingleFlightGate};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// No-op reputation adapter for when the session itself acts as the
/// copy caller; it only carries the working-folder path.
pub struct DummyCopyHost {
    working_folder: PathBuf,
}

impl DummyCopyHost {
    pub fn new(working_folder: impl Into<PathBuf>) -> Self {
        Self {
            working_folder: working_folder.into(),
        }
    }
}

impl CopyHost for DummyCopyHost {
    fn working_folder(&self) -> &Path {
        &self.working_folder
    }

    fn report_reputation(&self, _location: &MachineLocation, _reputation: MachineReputation) {}

    fn report_copy_result(
        &self,
        _info: &CopyAttemptInfo,
        _result: &CopyFileResult,
    ) -> Option<String> {
        None
    }
}

/// Shared per-build state behind every ephemeral session: cluster
/// view, content resolver, copy engine, single-flight gate, elision
/// cache and the working folder. The host outlives all sessions;
/// sessions hold it through an Arc and never the other way around.
pub struct EphemeralHost {
    pub config: Arc<EphemeralCacheConfig>,
    pub cluster: Arc<dyn ClusterState>,
    pub resolver: Arc<dyn ContentResolver>,
    pub tracker: Arc<dyn ContentTracker>,
    pub copier: ContentCopier,
    pub gate: SingleFlightGate,
    pub elision_cache: ElisionCache,
    pub workspace: Workspace,
}

impl EphemeralHost {
    pub fn new(
        config: Arc<EphemeralCacheConfig>,
        cluster: Arc<dyn ClusterState>,
        resolver: Arc<dyn ContentResolver>,
        tracker: Arc<dyn ContentTracker>,
        remote: Arc<dyn RemoteFileCopier>,
        workspace_root: impl Into<PathBuf>,
        copy_host: Option<Arc<dyn CopyHost>>,
    ) -> CacheResult<Arc<Self>> {
        let workspace = Workspace::new(workspace_root)?;
        let copy_host =
            copy_host.unwrap_or_else(|| Arc::new(DummyCopyHost::new(workspace.root())));
        let copier = ContentCopier::new(config.clone(), remote, copy_host);
        Ok(Arc::new(Self {
            config,
            cluster,
            resolver,
            tracker,
            copier,
            gate: SingleFlightGate::new(),
            elision_cache: ElisionCache::new(),
            workspace,
        }))
    }
}
