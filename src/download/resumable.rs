use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::transport::Transport;
use crate::error::{PatchError, Result};
use crate::util;

pub const BLOCK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed { bytes: u64 },
    /// The cancel flag was raised; the file is left partial and resumes next time.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Wait before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay + self.base_delay * attempt
    }
}

/// `(downloaded, total)`; total is `None` when the source cannot report a size.
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Single-file downloader that resumes partial files and retries failed transfers.
pub struct ResumableDownloader {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    cancel: Arc<AtomicBool>,
    progress: Option<Arc<ProgressFn>>,
}

impl ResumableDownloader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retry: RetryPolicy::default(),
            cancel: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<ProgressFn>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Download `url` into `folder`, named after the last URL segment.
    pub async fn download(&self, url: &str, folder: &Path) -> Result<Outcome> {
        let name = util::url_file_name(url)
            .ok_or_else(|| PatchError::transport(url, "URL does not name a file"))?;
        self.download_to(url, &folder.join(name)).await
    }

    pub async fn download_to(&self, url: &str, file: &Path) -> Result<Outcome> {
        self.with_retries(url, || self.transfer(url, file)).await
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        self.with_retries(url, || self.transport.fetch_bytes(url))
            .await
    }

    /// Run `attempt` until it succeeds or fails for good. Retryable failures wait
    /// `base + base * n` before attempt `n + 1`; running out of attempts is reported
    /// as a transport error carrying the URL.
    pub(crate) async fn with_retries<T, F, Fut>(&self, url: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = 0u32;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures >= self.retry.max_attempts {
                        return Err(PatchError::transport(
                            url,
                            format!("gave up after {failures} attempts: {e}"),
                        ));
                    }
                    let delay = self.retry.delay(failures);
                    warn!(url, attempt = failures, error = %e, "Download failed, retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn report(&self, downloaded: u64, total: Option<u64>) {
        if let Some(progress) = &self.progress {
            progress(downloaded, total);
        }
    }

    async fn transfer(&self, url: &str, file: &Path) -> Result<Outcome> {
        let total = self.transport.remote_size(url).await?;
        let existing = tokio::fs::metadata(file).await.ok().map(|m| m.len());

        let wanted = match (total, existing) {
            (Some(total), Some(len)) if len == total => {
                debug!(url, "Already downloaded");
                self.report(total, Some(total));
                return Ok(Outcome::Completed { bytes: total });
            }
            (Some(total), Some(len)) if len < total => len,
            _ => 0,
        };

        let opened = self.transport.open(url, wanted).await?;
        let start = if opened.offset == wanted {
            wanted
        } else {
            debug!(url, wanted, "Source ignored the range, restarting");
            0
        };
        if start > 0 {
            debug!(url, offset = start, "Resuming download");
        }

        crate::fsops::ensure_parent(file)?;
        let mut out = if start > 0 {
            OpenOptions::new().append(true).open(file).await
        } else {
            tokio::fs::File::create(file).await
        }
        .map_err(|e| PatchError::io(file, e))?;

        let mut reader = opened.reader;
        let mut block = vec![0u8; BLOCK_SIZE];
        let mut downloaded = start;

        loop {
            if self.cancel.load(Ordering::Relaxed) {
                out.flush().await.map_err(|e| PatchError::io(file, e))?;
                debug!(url, downloaded, "Download cancelled");
                return Ok(Outcome::Cancelled);
            }

            let n = reader
                .read(&mut block)
                .await
                .map_err(|e| PatchError::transport(url, e))?;
            if n == 0 {
                break;
            }
            out.write_all(&block[..n])
                .await
                .map_err(|e| PatchError::io(file, e))?;
            downloaded += n as u64;
            self.report(downloaded, total);
        }
        out.flush().await.map_err(|e| PatchError::io(file, e))?;

        if let Some(total) = total {
            if downloaded != total {
                return Err(PatchError::transport(
                    url,
                    format!("stream ended at {downloaded} of {total} bytes"),
                ));
            }
        }
        Ok(Outcome::Completed { bytes: downloaded })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::test_server::TestServer;
    use crate::download::transport::{FileTransport, HttpTransport, Opened};
    use crate::config::NetworkSettings;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, AtomicU64};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, ReadBuf};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(1),
        }
    }

    /// Yields its bytes, then fails instead of reporting end of stream.
    struct DroppedConnection(Cursor<Vec<u8>>);

    impl AsyncRead for DroppedConnection {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.0.position() as usize >= self.0.get_ref().len() {
                return Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                )));
            }
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    /// In-memory source whose first `failures` transfers break after `cut` bytes.
    struct FlakySource {
        body: Vec<u8>,
        failures: AtomicU32,
        cut: usize,
        offsets: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Transport for FlakySource {
        async fn remote_size(&self, _url: &str) -> Result<Option<u64>> {
            Ok(Some(self.body.len() as u64))
        }

        async fn open(&self, _url: &str, offset: u64) -> Result<Opened> {
            self.offsets.lock().unwrap().push(offset);
            let start = offset as usize;
            let reader: crate::download::ByteReader = if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                let end = (start + self.cut).min(self.body.len());
                Box::new(DroppedConnection(Cursor::new(self.body[start..end].to_vec())))
            } else {
                Box::new(Cursor::new(self.body[start..].to_vec()))
            };
            Ok(Opened { offset, reader })
        }

        async fn fetch_bytes(&self, _url: &str) -> Result<Vec<u8>> {
            Ok(self.body.clone())
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_resumes_partial_file_over_http() {
        let content = body(1000);
        let server = TestServer::start(content.clone(), true).await;
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("file.bin");
        std::fs::write(&target, &content[..400]).unwrap();

        let transport = Arc::new(HttpTransport::new(&NetworkSettings::default()).unwrap());
        let downloader = ResumableDownloader::new(transport).with_retry(fast());
        let outcome = downloader
            .download(&server.url("file.bin"), temp.path())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Completed { bytes: 1000 });
        assert_eq!(*server.ranges.lock().unwrap(), vec![400]);
        assert_eq!(std::fs::read(&target).unwrap(), content);
    }

    #[tokio::test]
    async fn test_restarts_when_range_is_ignored() {
        let content = body(1000);
        let server = TestServer::start(content.clone(), false).await;
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("file.bin");
        std::fs::write(&target, &content[..400]).unwrap();

        let transport = Arc::new(HttpTransport::new(&NetworkSettings::default()).unwrap());
        ResumableDownloader::new(transport)
            .download_to(&server.url("file.bin"), &target)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), content);
    }

    #[tokio::test]
    async fn test_oversized_partial_is_discarded() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("remote.bin");
        let target = temp.path().join("local.bin");
        std::fs::write(&source, b"short").unwrap();
        std::fs::write(&target, b"much longer than the source").unwrap();

        ResumableDownloader::new(Arc::new(FileTransport))
            .download_to(source.to_str().unwrap(), &target)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"short");
    }

    #[tokio::test]
    async fn test_retries_continue_from_what_arrived() {
        let content = body(100_000);
        let source = Arc::new(FlakySource {
            body: content.clone(),
            failures: AtomicU32::new(2),
            cut: 30_000,
            offsets: Mutex::new(Vec::new()),
        });
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("big.bin");

        let outcome = ResumableDownloader::new(source.clone())
            .with_retry(fast())
            .download_to("mem://big.bin", &target)
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Completed { bytes: 100_000 });
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 30_000, 60_000]);
        assert_eq!(std::fs::read(&target).unwrap(), content);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let source = Arc::new(FlakySource {
            body: body(1000),
            failures: AtomicU32::new(u32::MAX),
            cut: 0,
            offsets: Mutex::new(Vec::new()),
        });
        let temp = tempfile::tempdir().unwrap();
        let err = ResumableDownloader::new(source.clone())
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            })
            .download_to("mem://x", &temp.path().join("x"))
            .await
            .unwrap_err();

        match err {
            PatchError::Transport { url, .. } => assert_eq!(url, "mem://x"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(source.offsets.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_leaves_partial_file() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("remote.bin");
        std::fs::write(&source, body(BLOCK_SIZE * 4)).unwrap();
        let target = temp.path().join("local.bin");

        let downloader = ResumableDownloader::new(Arc::new(FileTransport));
        let flag = downloader.cancel_flag();
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_callback = seen.clone();
        let downloader = downloader.with_progress(Arc::new(move |done: u64, total: Option<u64>| {
            assert_eq!(total, Some((BLOCK_SIZE * 4) as u64));
            seen_in_callback.store(done, Ordering::SeqCst);
            flag.store(true, Ordering::SeqCst);
        }));

        let outcome = downloader
            .download_to(source.to_str().unwrap(), &target)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
        let partial = std::fs::metadata(&target).unwrap().len();
        assert_eq!(partial, seen.load(Ordering::SeqCst));
        assert!(partial < (BLOCK_SIZE * 4) as u64);
    }

    #[tokio::test]
    async fn test_missing_source_is_not_retried() {
        let temp = tempfile::tempdir().unwrap();
        let err = ResumableDownloader::new(Arc::new(FileTransport))
            .download_to(
                temp.path().join("nope").to_str().unwrap(),
                &temp.path().join("out"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Missing { .. }));
    }

    #[test]
    fn test_backoff_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(200));
    }
}
