use cache_lib::{CacheError, CacheResult, ContentHash, ContentHasher};
use pin_project::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Hash computed over everything the writer saw, with time accounting
/// split between hashing and the inner sink.
#[derive(Debug)]
pub struct HashingSummary {
    pub hash: ContentHash,
    pub bytes_written: u64,
    pub time_spent_hashing: Duration,
    pub time_spent_writing_to_disk: Duration,
}

enum HashState {
    /// Hash on the write path.
    Inline(Option<ContentHasher>),
    /// Hash on a separate task fed through a channel; writes no longer
    /// wait for digest updates.
    Parallel {
        tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
        join: Option<JoinHandle<(ContentHash, Duration)>>,
    },
}

fn spawn_parallel(state: &mut HashState) {
    let hasher = match state {
        HashState::Inline(hasher) => hasher.take().unwrap(),
        HashState::Parallel { .. } => return,
    };
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let join = tokio::spawn(async move {
        let mut hasher = hasher;
        let mut busy = Duration::ZERO;
        while let Some(chunk) = rx.recv().await {
            let started = Instant::now();
            hasher.update_from_bytes(&chunk);
            busy += started.elapsed();
        }
        (hasher.finalize(), busy)
    });
    *state = HashState::Parallel {
        tx: Some(tx),
        join: Some(join),
    };
}

/// Write stream that hashes the bytes flowing through it. Hashing is
/// inline until the byte count crosses `parallel_boundary`, then moves
/// to a concurrent task; when the total size is known to exceed the
/// boundary up front, hashing is concurrent from byte zero. A boundary
/// of -1 keeps hashing inline for the whole stream.
#[pin_project]
pub struct HashingWriter<W> {
    #[pin]
    inner: W,
    state: HashState,
    bytes_written: u64,
    parallel_boundary: i64,
    time_spent_hashing: Duration,
    time_spent_writing: Duration,
}

impl<W: AsyncWrite> HashingWriter<W> {
    pub fn new(inner: W, expected_size: i64, parallel_boundary: i64) -> CacheResult<Self> {
        let mut state = HashState::Inline(Some(ContentHasher::new(None)?));
        if parallel_boundary >= 0 && expected_size >= parallel_boundary && expected_size >= 0 {
            spawn_parallel(&mut state);
        }
        Ok(Self {
            inner,
            state,
            bytes_written: 0,
            parallel_boundary,
            time_spent_hashing: Duration::ZERO,
            time_spent_writing: Duration::ZERO,
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Consumes the writer and returns the computed hash. The caller
    /// is responsible for having flushed the inner sink.
    pub async fn finalize(mut self) -> CacheResult<HashingSummary> {
        let (hash, parallel_busy) = match &mut self.state {
            HashState::Inline(hasher) => (hasher.take().unwrap().finalize(), Duration::ZERO),
            HashState::Parallel { tx, join } => {
                // Closing the channel lets the hashing task drain and
                // finish.
                tx.take();
                let join = join.take().unwrap();
                join.await
                    .map_err(|e| CacheError::Internal(format!("hashing task failed: {}", e)))?
            }
        };
        Ok(HashingSummary {
            hash,
            bytes_written: self.bytes_written,
            time_spent_hashing: self.time_spent_hashing + parallel_busy,
            time_spent_writing_to_disk: self.time_spent_writing,
        })
    }
}

impl<W: AsyncWrite> AsyncWrite for HashingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let write_started = Instant::now();
        let written = match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => written,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        };
        *this.time_spent_writing += write_started.elapsed();

        match this.state {
            HashState::Inline(hasher) => {
                let hash_started = Instant::now();
                hasher.as_mut().unwrap().update_from_bytes(&buf[..written]);
                *this.time_spent_hashing += hash_started.elapsed();
            }
            HashState::Parallel { tx, .. } => {
                if let Some(tx) = tx.as_ref() {
                    if tx.send(buf[..written].to_vec()).is_err() {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            "hashing task stopped receiving",
                        )));
                    }
                }
            }
        }
        *this.bytes_written += written as u64;

        if *this.parallel_boundary >= 0
            && matches!(this.state, HashState::Inline(_))
            && *this.bytes_written >= *this.parallel_boundary as u64
        {
            spawn_parallel(this.state);
        }

        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
