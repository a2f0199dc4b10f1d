use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::resumable::{Outcome, ResumableDownloader, RetryPolicy};
use super::transport::transport_for;
use crate::codec;
use crate::config::LauncherSettings;
use crate::error::{PatchError, Result};

/// One file to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadEntry {
    pub remote_url: String,
    pub destination_file: PathBuf,
    /// Declared size, used to order the batch.
    pub size: u64,
    pub relative_path: String,
}

/// Called once per landed entry. Runs on the blocking pool, so it may hash or move
/// files, and several calls may run at the same time.
pub type OnEach = dyn for<'e> Fn(&'e DownloadEntry) -> Result<()> + Send + Sync;

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch_one(&self, entry: &DownloadEntry) -> Result<()>;

    /// Fetch every entry, calling `on_each` once after each one lands, possibly while
    /// other entries are still in flight. The first entry that fails for good, or the
    /// first callback error, aborts the whole batch. Returns the number fetched.
    async fn fetch_many(&self, entries: Vec<DownloadEntry>, on_each: Arc<OnEach>)
        -> Result<usize>;

    async fn fetch_string(&self, url: &str) -> Result<String>;
}

/// Fetch and decode a JSON document.
pub async fn fetch_document<T: DeserializeOwned>(
    downloader: &dyn Downloader,
    url: &str,
) -> Result<T> {
    codec::decode(&downloader.fetch_string(url).await?)
}

/// Available parallelism minus one, at least one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Build the downloader described by the settings.
pub fn downloader_for(settings: &LauncherSettings) -> Result<Arc<dyn Downloader>> {
    let transport = transport_for(&settings.remote_url, &settings.network)?;
    let inner = ResumableDownloader::new(Arc::from(transport)).with_retry(RetryPolicy {
        max_attempts: settings.download_attempts,
        base_delay: Duration::from_millis(settings.retry_delay_ms),
    });
    if settings.parallel_downloads {
        Ok(Arc::new(ParallelDownloader::new(inner)))
    } else {
        Ok(Arc::new(SequentialDownloader::new(inner)))
    }
}

async fn fetch_entry(inner: &ResumableDownloader, entry: &DownloadEntry) -> Result<()> {
    debug!(file = %entry.relative_path, url = %entry.remote_url, "Downloading");
    match inner
        .download_to(&entry.remote_url, &entry.destination_file)
        .await?
    {
        Outcome::Completed { .. } => Ok(()),
        Outcome::Cancelled => Err(PatchError::Cancelled),
    }
}

async fn finish_entry(on_each: &Arc<OnEach>, entry: DownloadEntry) -> Result<()> {
    let on_each = Arc::clone(on_each);
    tokio::task::spawn_blocking(move || on_each(&entry)).await?
}

async fn fetch_text(inner: &ResumableDownloader, url: &str) -> Result<String> {
    let bytes = inner.fetch_bytes(url).await?;
    String::from_utf8(bytes).map_err(|e| PatchError::codec(url, e))
}

/// Fetches one entry at a time, in the order given.
pub struct SequentialDownloader {
    inner: ResumableDownloader,
}

impl SequentialDownloader {
    pub fn new(inner: ResumableDownloader) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Downloader for SequentialDownloader {
    async fn fetch_one(&self, entry: &DownloadEntry) -> Result<()> {
        fetch_entry(&self.inner, entry).await
    }

    async fn fetch_many(&self, entries: Vec<DownloadEntry>, on_each: Arc<OnEach>) -> Result<usize> {
        let count = entries.len();
        for entry in entries {
            fetch_entry(&self.inner, &entry).await?;
            finish_entry(&on_each, entry).await?;
        }
        Ok(count)
    }

    async fn fetch_string(&self, url: &str) -> Result<String> {
        fetch_text(&self.inner, url).await
    }
}

/// Smallest files first, spread over a fixed set of spawned workers that pull from
/// one shared queue.
pub struct ParallelDownloader {
    inner: Arc<ResumableDownloader>,
    workers: usize,
}

impl ParallelDownloader {
    pub fn new(inner: ResumableDownloader) -> Self {
        Self::with_workers(inner, default_workers())
    }

    pub fn with_workers(inner: ResumableDownloader, workers: usize) -> Self {
        Self {
            inner: Arc::new(inner),
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

fn next_entry(queue: &Mutex<VecDeque<DownloadEntry>>) -> Option<DownloadEntry> {
    match queue.lock() {
        Ok(mut queue) => queue.pop_front(),
        Err(poisoned) => poisoned.into_inner().pop_front(),
    }
}

#[async_trait]
impl Downloader for ParallelDownloader {
    async fn fetch_one(&self, entry: &DownloadEntry) -> Result<()> {
        fetch_entry(&self.inner, entry).await
    }

    async fn fetch_many(
        &self,
        mut entries: Vec<DownloadEntry>,
        on_each: Arc<OnEach>,
    ) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }
        entries.sort_by_key(|e| e.size);
        let workers = self.workers.min(entries.len());
        info!(files = entries.len(), workers, "Starting batch download");

        let queue = Arc::new(Mutex::new(VecDeque::from(entries)));
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let queue = Arc::clone(&queue);
            let inner = Arc::clone(&self.inner);
            let on_each = Arc::clone(&on_each);
            tasks.spawn(async move {
                let mut done = 0usize;
                while let Some(entry) = next_entry(&queue) {
                    fetch_entry(&inner, &entry).await?;
                    finish_entry(&on_each, entry).await?;
                    done += 1;
                }
                debug!(worker = id, files = done, "Worker finished");
                Ok::<usize, PatchError>(done)
            });
        }

        let mut fetched = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined? {
                Ok(done) => fetched += done,
                Err(e) => {
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }
        Ok(fetched)
    }

    async fn fetch_string(&self, url: &str) -> Result<String> {
        fetch_text(&self.inner, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::FileTransport;
    use std::collections::HashMap;

    fn entries(temp: &std::path::Path, count: usize) -> Vec<DownloadEntry> {
        let remote = temp.join("remote");
        std::fs::create_dir_all(&remote).unwrap();
        // Reverse size order so sorting is observable.
        (0..count)
            .map(|i| {
                let size = (count - i) * 1000 + 7;
                let name = format!("file_{i}.bin");
                std::fs::write(remote.join(&name), vec![i as u8; size]).unwrap();
                DownloadEntry {
                    remote_url: format!("file://{}", remote.join(&name).display()),
                    destination_file: temp.join("local").join(&name),
                    size: size as u64,
                    relative_path: name,
                }
            })
            .collect()
    }

    fn downloader() -> ResumableDownloader {
        ResumableDownloader::new(Arc::new(FileTransport))
    }

    #[tokio::test]
    async fn test_each_entry_reported_exactly_once() {
        for workers in 1..=4 {
            let temp = tempfile::tempdir().unwrap();
            let batch = entries(temp.path(), 9);
            let parallel = ParallelDownloader::with_workers(downloader(), workers);

            let seen: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
            let counter = Arc::clone(&seen);
            let fetched = parallel
                .fetch_many(
                    batch.clone(),
                    Arc::new(move |entry: &DownloadEntry| -> Result<()> {
                        *counter
                            .lock()
                            .unwrap()
                            .entry(entry.relative_path.clone())
                            .or_default() += 1;
                        Ok(())
                    }),
                )
                .await
                .unwrap();

            assert_eq!(fetched, 9);
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 9);
            assert!(seen.values().all(|&n| n == 1));
            for entry in &batch {
                assert_eq!(
                    std::fs::metadata(&entry.destination_file).unwrap().len(),
                    entry.size
                );
            }
        }
    }

    #[tokio::test]
    async fn test_callbacks_of_different_workers_overlap() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
        use std::time::Instant;

        let temp = tempfile::tempdir().unwrap();
        let batch = entries(temp.path(), 2);
        let parallel = ParallelDownloader::with_workers(downloader(), 2);

        // Each callback waits for the other one to start; a serialized batch never
        // sees both at once.
        let started = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (started_in, overlapped_in) = (Arc::clone(&started), Arc::clone(&overlapped));
        parallel
            .fetch_many(
                batch,
                Arc::new(move |_: &DownloadEntry| -> Result<()> {
                    started_in.fetch_add(1, Ordering::SeqCst);
                    let deadline = Instant::now() + Duration::from_secs(5);
                    while Instant::now() < deadline {
                        if started_in.load(Ordering::SeqCst) == 2 {
                            overlapped_in.store(true, Ordering::SeqCst);
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert!(overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_single_worker_goes_smallest_first() {
        let temp = tempfile::tempdir().unwrap();
        let batch = entries(temp.path(), 5);
        let parallel = ParallelDownloader::with_workers(downloader(), 1);

        let order: Arc<Mutex<Vec<u64>>> = Arc::default();
        let seen = Arc::clone(&order);
        parallel
            .fetch_many(
                batch,
                Arc::new(move |entry: &DownloadEntry| -> Result<()> {
                    seen.lock().unwrap().push(entry.size);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        let order = order.lock().unwrap().clone();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[tokio::test]
    async fn test_failure_aborts_the_batch() {
        let temp = tempfile::tempdir().unwrap();
        let mut batch = entries(temp.path(), 3);
        batch[1].remote_url = format!("file://{}", temp.path().join("gone.bin").display());

        let sequential = SequentialDownloader::new(downloader());
        let err = sequential
            .fetch_many(batch.clone(), Arc::new(|_: &DownloadEntry| -> Result<()> { Ok(()) }))
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Missing { .. }));

        let parallel = ParallelDownloader::with_workers(downloader(), 2);
        assert!(parallel
            .fetch_many(batch, Arc::new(|_: &DownloadEntry| -> Result<()> { Ok(()) }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_callback_error_aborts_the_batch() {
        let temp = tempfile::tempdir().unwrap();
        let batch = entries(temp.path(), 3);
        let parallel = ParallelDownloader::with_workers(downloader(), 2);
        let err = parallel
            .fetch_many(
                batch,
                Arc::new(|entry: &DownloadEntry| -> Result<()> {
                    Err(PatchError::Integrity {
                        path: entry.relative_path.clone(),
                        expected: "a".into(),
                        actual: "b".into(),
                    })
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_fetch_document() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("builds_index.json");
        std::fs::write(&path, r#"{ "available_builds": ["1.0.0", "1.2.0"] }"#).unwrap();

        let sequential = SequentialDownloader::new(downloader());
        let index: crate::format::BuildsIndex =
            fetch_document(&sequential, &format!("file://{}", path.display()))
                .await
                .unwrap();
        assert_eq!(index.last().map(|v| v.to_string()), Some("1.2.0".to_string()));
    }

    #[test]
    fn test_default_workers_is_at_least_one() {
        assert!(default_workers() >= 1);
    }
}
