use crate::{CacheError, CacheResult, ContentHash, HashAlgorithm};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

const COPY_HASH_BUFFER_SIZE: usize = 1024 * 64;

/// Incremental content hasher. Only sha256 is computable locally; the
/// other algorithm tags come from external stores and are consumed as
/// opaque values.
pub struct ContentHasher {
    algorithm: HashAlgorithm,
    inner: Sha256,
    pos: u64,
}

impl ContentHasher {
    pub fn new(algorithm: Option<HashAlgorithm>) -> CacheResult<Self> {
        let algorithm = algorithm.unwrap_or(HashAlgorithm::Sha256);
        if algorithm != HashAlgorithm::Sha256 {
            return Err(CacheError::Unsupported(format!(
                "cannot compute {} locally",
                algorithm
            )));
        }
        Ok(Self {
            algorithm,
            inner: Sha256::new(),
            pos: 0,
        })
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Total bytes fed so far.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn update_from_bytes(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.pos += data.len() as u64;
    }

    pub fn finalize(self) -> ContentHash {
        let digest = self.inner.finalize();
        ContentHash::new(self.algorithm, &digest).unwrap()
    }

    pub fn calc_from_bytes(mut self, data: &[u8]) -> ContentHash {
        self.update_from_bytes(data);
        self.finalize()
    }

    pub async fn calc_from_reader<R>(mut self, reader: &mut R) -> CacheResult<(ContentHash, u64)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buffer = vec![0u8; COPY_HASH_BUFFER_SIZE];
        loop {
            let read = reader.read(&mut buffer).await.map_err(|e| {
                warn!("calc_from_reader: read failed! {}", e);
                CacheError::IoError(e.to_string())
            })?;
            if read == 0 {
                break;
            }
            self.update_from_bytes(&buffer[..read]);
        }
        let read_size = self.pos;
        Ok((self.finalize(), read_size))
    }
}
