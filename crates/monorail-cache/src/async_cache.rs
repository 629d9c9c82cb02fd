use std::{sync::Arc, time::Duration};

use futures::{stream::FuturesUnordered, StreamExt};
use monorail_paths::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::{multiplexer::CacheMultiplexer, CacheError, CacheHitMetadata};

/// How long shutdown waits for in-flight writes before giving up, so a
/// stalled tier cannot hold the process open.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(1500);

const WORKER_REQUEST_BUFFER: usize = 1;

/// Decouples `put` callers from the underlying tiers.
///
/// Writes are fire-and-forget: they are handed to a bounded worker pool and
/// their results are discarded (a diagnostic is logged). Back-pressure comes
/// from the size-one request channel: a `put` only blocks once every worker
/// is busy and the channel slot is taken. Reads pass straight through.
pub struct AsyncCache {
    real_cache: Arc<CacheMultiplexer>,
    writer_sender: mpsc::Sender<WorkerRequest>,
}

enum WorkerRequest {
    Put(CacheItem),
    Shutdown(oneshot::Sender<()>),
}

struct CacheItem {
    anchor: AbsoluteSystemPathBuf,
    hash: String,
    files: Vec<AnchoredSystemPathBuf>,
    duration: u64,
}

impl AsyncCache {
    pub fn new(real_cache: CacheMultiplexer, max_workers: usize) -> AsyncCache {
        let real_cache = Arc::new(real_cache);
        let (writer_sender, mut write_consumer) =
            mpsc::channel::<WorkerRequest>(WORKER_REQUEST_BUFFER);

        let worker_cache = real_cache.clone();
        tokio::spawn(async move {
            let mut workers = FuturesUnordered::new();

            while let Some(request) = write_consumer.recv().await {
                match request {
                    WorkerRequest::Put(item) => {
                        // Cap concurrency by retiring one worker before
                        // spawning the next.
                        if workers.len() >= max_workers {
                            workers.next().await;
                        }

                        let cache = worker_cache.clone();
                        workers.push(tokio::spawn(async move {
                            let CacheItem {
                                anchor,
                                hash,
                                files,
                                duration,
                            } = item;
                            // Write errors are deliberately dropped: the
                            // scheduler already accepted the task's outputs
                            // and the write was an optimization.
                            if let Err(err) = cache.put(&anchor, &hash, &files, duration).await {
                                warn!("failed to store {hash} in cache: {err}");
                            }
                        }));
                    }
                    WorkerRequest::Shutdown(ack) => {
                        while workers.next().await.is_some() {}
                        let _ = ack.send(());
                        return;
                    }
                }
            }

            // All senders dropped without an explicit shutdown; drain anyway.
            while workers.next().await.is_some() {}
        });

        AsyncCache {
            real_cache,
            writer_sender,
        }
    }

    /// Queues a write. Blocks only when all workers are busy and the request
    /// buffer is full.
    #[tracing::instrument(skip_all)]
    pub async fn put(
        &self,
        anchor: AbsoluteSystemPathBuf,
        hash: &str,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    ) -> Result<(), CacheError> {
        self.writer_sender
            .send(WorkerRequest::Put(CacheItem {
                anchor,
                hash: hash.to_string(),
                files,
                duration,
            }))
            .await
            .map_err(|_| CacheError::CacheShuttingDown)
    }

    #[tracing::instrument(skip_all)]
    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        self.real_cache.fetch(anchor, hash).await
    }

    #[tracing::instrument(skip_all)]
    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        self.real_cache.exists(hash).await
    }

    pub fn clean(&self, anchor: &AbsoluteSystemPath) {
        self.real_cache.clean(anchor);
    }

    pub fn clean_all(&self) {
        self.real_cache.clean_all();
    }

    /// Drains queued and in-flight writes. Must run before process exit for
    /// the fire-and-forget writes to be durable; waits no longer than
    /// [`SHUTDOWN_TIMEOUT`]. Errors are logged, never returned.
    #[tracing::instrument(skip_all)]
    pub async fn shutdown(self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .writer_sender
            .send(WorkerRequest::Shutdown(ack_tx))
            .await
            .is_err()
        {
            warn!("cache workers already stopped");
            return;
        }

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => warn!("cache workers stopped without acknowledging shutdown"),
            Err(_) => warn!("timed out waiting for cache writes to drain"),
        }
    }
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use camino::Utf8Path;
    use monorail_api_client::ApiClient;
    use monorail_paths::AbsoluteSystemPathBuf;
    use tempfile::tempdir;

    use super::*;
    use crate::{fs::FsCache, CacheOpts};

    fn fs_only_multiplexer(
        repo_root: &AbsoluteSystemPath,
    ) -> Result<CacheMultiplexer, CacheError> {
        let opts = CacheOpts {
            cache_dir: "cache".into(),
            skip_remote: true,
            ..Default::default()
        };
        let client =
            ApiClient::new("http://localhost:9", 10, "0.1.0").expect("client construction");
        CacheMultiplexer::new(&opts, repo_root, client, None, None, None)
    }

    #[tokio::test]
    async fn test_shutdown_drains_all_writes() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;
        repo_root_path
            .join_component("out.txt")
            .create_with_contents("built")?;
        let files = vec![monorail_paths::AnchoredSystemPathBuf::from_raw("out.txt")?];

        let cache = AsyncCache::new(fs_only_multiplexer(&repo_root_path)?, 10);

        let hashes: Vec<String> = (0..100).map(|i| format!("{i:016x}")).collect();
        for hash in &hashes {
            cache
                .put(repo_root_path.clone(), hash, files.clone(), 100)
                .await?;
        }

        cache.shutdown().await;

        // Every queued artifact must exist after shutdown returns.
        let fs = FsCache::new(Utf8Path::new("cache"), &repo_root_path, None)?;
        for hash in &hashes {
            assert!(fs.exists(hash)?.is_some(), "missing artifact {hash}");
        }

        Ok(())
    }

    #[tokio::test]
    async fn test_reads_pass_through_synchronously() -> Result<()> {
        let repo_root = tempdir()?;
        let repo_root_path = AbsoluteSystemPathBuf::try_from(repo_root.path())?;
        repo_root_path
            .join_component("out.txt")
            .create_with_contents("built")?;
        let files = vec![monorail_paths::AnchoredSystemPathBuf::from_raw("out.txt")?];

        let cache = AsyncCache::new(fs_only_multiplexer(&repo_root_path)?, 2);

        assert!(cache.exists("0123456789abcdef").await?.is_none());

        cache
            .put(repo_root_path.clone(), "0123456789abcdef", files, 42)
            .await?;
        cache.shutdown().await;

        // shutdown consumed the cache; a fresh sync view sees the artifact.
        let fs = FsCache::new(Utf8Path::new("cache"), &repo_root_path, None)?;
        assert!(fs.exists("0123456789abcdef")?.is_some());

        Ok(())
    }
}
