//! Range-aware chunk reader over the upstream file RPC.
//!
//! Exposes a byte window `[start, end]` of a remote file as a sequential
//! stream of `Bytes`. Fetches are always aligned to [`CHUNK_SIZE`] and at
//! most one chunk long, as the upstream `upload.getFile` RPC requires;
//! the reader trims each fetched chunk to the requested window before
//! yielding it. Chunks are fetched strictly in ascending offset order and
//! nothing is cached beyond the chunk currently being sliced.
//!
//! Retry policy is a property of the reader and invisible to the HTTP
//! layer: transient RPC failures are retried up to
//! [`FETCH_MAX_ATTEMPTS`] times with doubling backoff, and a flood-wait
//! pauses for the interval the platform reports before counting as an
//! attempt.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use grammers_client::InvocationError;
use grammers_tl_types as tl;
use tracing::{debug, warn};

use common::{FileInfo, FileLocation};

use crate::config::{CHUNK_SIZE, FETCH_MAX_ATTEMPTS, FETCH_RETRY_BASE_DELAY_MS};
use crate::workers::WorkerLease;

/// Upstream fetch failure, classified for the retry loop.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Worth retrying in place: network hiccups, server-side 5xx RPC errors.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// The platform asked us to back off for this many seconds.
    #[error("upstream flood wait of {0}s")]
    FloodWait(u32),
    /// Not recoverable within this request (bad location, expired file
    /// reference, CDN redirect).
    #[error("upstream failure: {0}")]
    Permanent(String),
}

/// Seam between the reader and the upstream RPC, so the reassembly and
/// retry logic can be exercised against in-memory data.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    /// Fetch up to `limit` bytes at `offset`. Offset is chunk-aligned and
    /// `limit` is exactly one chunk; the final chunk of a file may come
    /// back shorter and the returned length is trusted.
    async fn fetch(&self, location: &FileLocation, offset: i64, limit: i32)
    -> Result<Bytes, FetchError>;
}

/// Production fetcher: issues `upload.getFile` on the leased worker's
/// session. Owning the lease ties the worker to the response lifetime;
/// dropping the stream (client gone, stream finished) releases it.
pub struct TelegramFetcher {
    lease: WorkerLease,
}

impl TelegramFetcher {
    pub fn new(lease: WorkerLease) -> Self {
        Self { lease }
    }
}

#[async_trait]
impl ChunkFetcher for TelegramFetcher {
    async fn fetch(
        &self,
        location: &FileLocation,
        offset: i64,
        limit: i32,
    ) -> Result<Bytes, FetchError> {
        let request = tl::functions::upload::GetFile {
            precise: false,
            cdn_supported: false,
            location: tl::enums::InputFileLocation::InputDocumentFileLocation(
                tl::types::InputDocumentFileLocation {
                    id: location.id,
                    access_hash: location.access_hash,
                    file_reference: location.file_reference.clone(),
                    thumb_size: String::new(),
                },
            ),
            offset,
            limit,
        };
        match self.lease.client().invoke(&request).await {
            Ok(tl::enums::upload::File::File(file)) => Ok(Bytes::from(file.bytes)),
            Ok(tl::enums::upload::File::CdnRedirect(_)) => Err(FetchError::Permanent(
                "cdn redirect is not supported".to_string(),
            )),
            Err(error) => Err(classify_invocation_error(error)),
        }
    }
}

fn classify_invocation_error(error: InvocationError) -> FetchError {
    match error {
        InvocationError::Rpc(rpc) => {
            if rpc.name == "FLOOD_WAIT" {
                FetchError::FloodWait(rpc.value.unwrap_or(1))
            } else if rpc.code >= 500 {
                FetchError::Transient(rpc.to_string())
            } else {
                FetchError::Permanent(rpc.to_string())
            }
        }
        other => FetchError::Transient(other.to_string()),
    }
}

/// Stateful reader for one HTTP response.
pub struct FileStream<F> {
    file: FileInfo,
    start: i64,
    /// Inclusive; always `< file.size`.
    end: i64,
    fetcher: F,
}

impl<F: ChunkFetcher + 'static> FileStream<F> {
    pub fn new(file: FileInfo, start: i64, end: i64, fetcher: F) -> Self {
        debug_assert!(end < file.size);
        Self {
            file,
            start,
            end,
            fetcher,
        }
    }

    /// Turn the reader into the byte stream that backs the response body.
    ///
    /// Yields the intersection of each fetched chunk with `[start, end]`,
    /// ending after `end` is delivered or the upstream reports no more
    /// data. Errors terminate the stream; by then headers are long gone,
    /// so the HTTP layer can only drop the connection.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, FetchError>> + Send {
        try_stream! {
            let Self { file, start, end, fetcher } = self;
            let mut cursor = start;
            while cursor <= end {
                let chunk_base = (cursor / CHUNK_SIZE) * CHUNK_SIZE;
                let chunk =
                    fetch_with_retry(&fetcher, &file.location, chunk_base, CHUNK_SIZE as i32)
                        .await?;
                let from = (cursor - chunk_base) as usize;
                let to = (chunk.len() as i64).min(end - chunk_base + 1) as usize;
                if from >= to {
                    // Upstream came back short of the cursor: end of file.
                    break;
                }
                yield chunk.slice(from..to);
                cursor = chunk_base + to as i64;
            }
        }
    }
}

async fn fetch_with_retry<F: ChunkFetcher>(
    fetcher: &F,
    location: &FileLocation,
    offset: i64,
    limit: i32,
) -> Result<Bytes, FetchError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match fetcher.fetch(location, offset, limit).await {
            Ok(chunk) => return Ok(chunk),
            Err(FetchError::FloodWait(seconds)) if attempt < FETCH_MAX_ATTEMPTS => {
                warn!(seconds, offset, "upstream flood wait, pausing");
                tokio::time::sleep(Duration::from_secs(u64::from(seconds))).await;
            }
            Err(FetchError::Transient(reason)) if attempt < FETCH_MAX_ATTEMPTS => {
                debug!(attempt, offset, reason = %reason, "transient chunk fetch failure, retrying");
                tokio::time::sleep(Duration::from_millis(
                    FETCH_RETRY_BASE_DELAY_MS << (attempt - 1),
                ))
                .await;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory fetcher that checks the alignment contract and can inject
    /// failures before succeeding.
    struct MemoryFetcher {
        data: Vec<u8>,
        offsets_seen: Arc<Mutex<Vec<i64>>>,
        failures_left: AtomicU32,
        failure: fn() -> FetchError,
    }

    impl MemoryFetcher {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                offsets_seen: Arc::new(Mutex::new(Vec::new())),
                failures_left: AtomicU32::new(0),
                failure: || FetchError::Transient("injected".to_string()),
            }
        }

        fn failing(data: Vec<u8>, failures: u32, failure: fn() -> FetchError) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                failure,
                ..Self::new(data)
            }
        }
    }

    #[async_trait]
    impl ChunkFetcher for MemoryFetcher {
        async fn fetch(
            &self,
            _location: &FileLocation,
            offset: i64,
            limit: i32,
        ) -> Result<Bytes, FetchError> {
            assert_eq!(offset % CHUNK_SIZE, 0, "offset must be chunk-aligned");
            assert_eq!(limit as i64, CHUNK_SIZE, "limit must be one chunk");
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err((self.failure)());
            }
            self.offsets_seen.lock().unwrap().push(offset);
            let from = (offset as usize).min(self.data.len());
            let to = (offset as usize + limit as usize).min(self.data.len());
            Ok(Bytes::copy_from_slice(&self.data[from..to]))
        }
    }

    fn test_file(size: i64) -> FileInfo {
        FileInfo {
            location: FileLocation {
                id: 1,
                access_hash: 2,
                file_reference: Vec::new(),
            },
            size,
            mime_type: "video/mp4".to_string(),
            file_name: "test.mp4".to_string(),
        }
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn collect(
        data: &[u8],
        start: i64,
        end: i64,
        fetcher: MemoryFetcher,
    ) -> Result<Vec<u8>, FetchError> {
        let stream = FileStream::new(test_file(data.len() as i64), start, end, fetcher).into_stream();
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    #[tokio::test]
    async fn test_full_file_roundtrip() {
        let data = patterned(3_000_000);
        let fetcher = MemoryFetcher::new(data.clone());
        let out = collect(&data, 0, data.len() as i64 - 1, fetcher).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_window_crossing_chunk_boundaries() {
        let data = patterned(3_000_000);
        let (start, end) = (1_048_576, 2_097_151);
        let fetcher = MemoryFetcher::new(data.clone());
        let out = collect(&data, start, end, fetcher).await.unwrap();
        assert_eq!(out.len() as i64, end - start + 1);
        assert_eq!(out, &data[start as usize..=end as usize]);
    }

    #[tokio::test]
    async fn test_unaligned_window() {
        let data = patterned(3_000_000);
        let (start, end) = (1_500_000, 2_500_000);
        let fetcher = MemoryFetcher::new(data.clone());
        let out = collect(&data, start, end, fetcher).await.unwrap();
        assert_eq!(out, &data[start as usize..=end as usize]);
    }

    #[tokio::test]
    async fn test_single_byte_windows() {
        let data = patterned(2_500_000);
        for pos in [0i64, 1_048_575, 1_048_576, 2_499_999] {
            let fetcher = MemoryFetcher::new(data.clone());
            let out = collect(&data, pos, pos, fetcher).await.unwrap();
            assert_eq!(out, vec![data[pos as usize]], "window at byte {pos}");
        }
    }

    #[tokio::test]
    async fn test_offsets_ascend_and_align() {
        let data = patterned(3_000_000);
        let fetcher = MemoryFetcher::new(data.clone());
        let offsets_seen = Arc::clone(&fetcher.offsets_seen);
        let out = collect(&data, 100, 2_500_000, fetcher).await.unwrap();
        assert_eq!(out, &data[100..=2_500_000]);
        assert_eq!(*offsets_seen.lock().unwrap(), vec![0, CHUNK_SIZE, 2 * CHUNK_SIZE]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let data = patterned(500_000);
        let fetcher = MemoryFetcher::failing(data.clone(), FETCH_MAX_ATTEMPTS - 1, || {
            FetchError::Transient("injected".to_string())
        });
        let out = collect(&data, 0, data.len() as i64 - 1, fetcher).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_persistent_transient_failure_surfaces() {
        let data = patterned(500_000);
        let fetcher = MemoryFetcher::failing(data.clone(), FETCH_MAX_ATTEMPTS, || {
            FetchError::Transient("injected".to_string())
        });
        let err = collect(&data, 0, data.len() as i64 - 1, fetcher).await.unwrap_err();
        assert!(matches!(err, FetchError::Transient(_)));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let data = patterned(500_000);
        let fetcher = MemoryFetcher::failing(data.clone(), 1, || {
            FetchError::Permanent("gone".to_string())
        });
        let err = collect(&data, 0, data.len() as i64 - 1, fetcher).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flood_wait_pauses_before_retry() {
        let data = patterned(100_000);
        let fetcher = MemoryFetcher::failing(data.clone(), 1, || FetchError::FloodWait(7));
        let before = tokio::time::Instant::now();
        let out = collect(&data, 0, data.len() as i64 - 1, fetcher).await.unwrap();
        assert_eq!(out, data);
        assert!(before.elapsed() >= Duration::from_secs(7));
    }
}
