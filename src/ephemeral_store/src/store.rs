use crate::{
    FileAccessMode, FileRealizationMode, FileReplacementMode, PlaceFileResult, PutResult,
    UrgencyHint,
};
use async_trait::async_trait;
use cache_lib::{CacheResult, ContentHash, ContentHashWithSize, HashAlgorithm};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncSeek};
use tokio_util::sync::CancellationToken;

// Combined reader trait for seekable content streams.
pub trait ContentReadSeek: AsyncRead + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncSeek + Unpin + Send> ContentReadSeek for T {}

pub type ContentStream = Box<dyn ContentReadSeek>;

/// Surface of a backing content session (local or persistent). Both
/// stores are external collaborators; the ephemeral core only
/// orchestrates them.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn pin(&self, hash: &ContentHash, cancel: &CancellationToken) -> CacheResult<()>;

    async fn pin_bulk(
        &self,
        hashes: &[ContentHash],
        cancel: &CancellationToken,
    ) -> Vec<(ContentHash, CacheResult<()>)>;

    async fn place_file(
        &self,
        hash: &ContentHash,
        path: &Path,
        access: FileAccessMode,
        replacement: FileReplacementMode,
        realization: FileRealizationMode,
        urgency: UrgencyHint,
        cancel: &CancellationToken,
    ) -> CacheResult<PlaceFileResult>;

    /// The store hashes the file itself and stores the bytes.
    async fn put_file(
        &self,
        algorithm: HashAlgorithm,
        path: &Path,
        realization: FileRealizationMode,
        cancel: &CancellationToken,
    ) -> CacheResult<PutResult>;

    async fn put_stream(
        &self,
        algorithm: HashAlgorithm,
        stream: &mut dyn ContentReadSeek,
        cancel: &CancellationToken,
    ) -> CacheResult<PutResult>;
}

/// A local store that can accept bytes without re-hashing, because the
/// caller asserts the hash. The datacenter copy path requires this
/// capability: the copy engine has already stream-verified the hash.
#[async_trait]
pub trait TrustedContentStore: ContentStore {
    async fn put_trusted_file(
        &self,
        hash_info: &ContentHashWithSize,
        path: &Path,
        realization: FileRealizationMode,
        cancel: &CancellationToken,
    ) -> CacheResult<PutResult>;
}
