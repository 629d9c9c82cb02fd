#![deny(clippy::all)]

//! The task artifact cache.
//!
//! The cache records the file outputs of previously executed tasks under
//! their fingerprint and restores them on later runs, substituting an
//! expensive task execution with file restoration. Storage is tiered: a local
//! directory, an optional remote service, and a no-op fallback, composed by
//! [`CacheMultiplexer`] with read-through and write-back promotion between
//! tiers.

/// A wrapper that offloads cache writes to a bounded worker pool.
mod async_cache;
/// The artifact container: creation and restoration of file trees.
pub mod cache_archive;
/// File system tier.
pub mod fs;
/// Remote tier.
pub mod http;
/// Ordered composition of tiers.
mod multiplexer;
/// The tier that never hits and never stores.
pub mod noop;
/// HMAC tags binding artifact bytes to a team identity.
pub mod signature_authentication;
#[cfg(test)]
mod test_cases;

pub use async_cache::AsyncCache;
use camino::Utf8PathBuf;
pub use multiplexer::{CacheMultiplexer, OnCacheRemoved};
use monorail_paths::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signature_authentication::SignatureError;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error(
        "artifact verification failed: downloaded artifact is missing required x-artifact-tag \
         header"
    )]
    ArtifactTagMissing,
    #[error("invalid artifact verification tag")]
    InvalidTag,
    #[error("failed to contact remote cache: {0}")]
    ApiClientError(Box<monorail_api_client::Error>),
    #[error("signing artifact failed: {0}")]
    SignatureError(#[from] SignatureError),
    #[error("invalid duration")]
    InvalidDuration,
    #[error("Invalid file path: {0}")]
    PathError(#[from] monorail_paths::PathError),
    #[error("links in the cache are cyclic")]
    CycleDetected,
    #[error("Invalid file path, link target does not exist: {0}")]
    LinkTargetDoesNotExist(String),
    #[error("Invalid tar, link target does not exist on header")]
    LinkTargetNotOnHeader,
    #[error("attempted to restore unsupported file type: {0:?}")]
    RestoreUnsupportedFileType(tar::EntryType),
    // We don't carry the `FileType` because there's no simple way to display
    // it nicely.
    #[error("attempted to create unsupported file type")]
    CreateUnsupportedFileType,
    #[error("tar file is malformed")]
    MalformedTar,
    #[error("file name is not Windows-safe: {0}")]
    WindowsUnsafeName(String),
    #[error("tar attempts to write outside of directory: {0}")]
    LinkOutsideOfDirectory(String),
    #[error("Invalid cache metadata file")]
    InvalidMetadata(#[source] serde_json::Error),
    #[error("Failed to write cache metadata file")]
    MetadataWriteFailure(#[source] serde_json::Error),
    #[error("Unable to perform write as cache is shutting down")]
    CacheShuttingDown,
}

impl From<monorail_api_client::Error> for CacheError {
    fn from(value: monorail_api_client::Error) -> Self {
        CacheError::ApiClientError(Box::new(value))
    }
}

impl CacheError {
    /// Whether the underlying failure is the remote service telling us to
    /// stop using it. The multiplexer removes tiers that report this.
    pub fn is_cache_disabled(&self) -> bool {
        matches!(
            self,
            CacheError::ApiClientError(err)
                if matches!(&**err, monorail_api_client::Error::CacheDisabled { .. })
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum CacheSource {
    Local,
    Remote,
}

/// The hit side of a cache query: where the artifact came from, and how long
/// the original task ran. A miss is the absence of this record.
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub struct CacheHitMetadata {
    pub source: CacheSource,
    pub time_saved: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheOpts {
    pub cache_dir: Utf8PathBuf,
    pub skip_remote: bool,
    pub skip_filesystem: bool,
    pub remote_cache_read_only: bool,
    pub workers: u32,
    pub remote_cache_opts: Option<RemoteCacheOpts>,
}

pub const DEFAULT_CACHE_DIR: &str = "node_modules/.cache/monorail";
pub const DEFAULT_WORKERS: u32 = 10;

impl Default for CacheOpts {
    fn default() -> Self {
        Self {
            cache_dir: DEFAULT_CACHE_DIR.into(),
            skip_remote: false,
            skip_filesystem: false,
            remote_cache_read_only: false,
            workers: DEFAULT_WORKERS,
            remote_cache_opts: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteCacheOpts {
    pub team_id: Option<String>,
    pub signature: bool,
}

impl RemoteCacheOpts {
    pub fn new(team_id: Option<String>, signature: bool) -> Self {
        Self { team_id, signature }
    }
}

/// The cache as handed to the task scheduler: the multiplexed tiers, behind
/// the async write queue when `workers > 0`.
pub enum Cache {
    Async(AsyncCache),
    Sync(CacheMultiplexer),
}

impl Cache {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        client: monorail_api_client::ApiClient,
        api_auth: Option<monorail_api_client::ApiAuth>,
        analytics_recorder: Option<monorail_analytics::AnalyticsSender>,
        on_cache_removed: Option<OnCacheRemoved>,
    ) -> Result<Self, CacheError> {
        let multiplexer = CacheMultiplexer::new(
            opts,
            repo_root,
            client,
            api_auth,
            analytics_recorder,
            on_cache_removed,
        )?;

        if opts.workers > 0 {
            Ok(Cache::Async(AsyncCache::new(
                multiplexer,
                opts.workers as usize,
            )))
        } else {
            Ok(Cache::Sync(multiplexer))
        }
    }

    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: Vec<AnchoredSystemPathBuf>,
        duration: u64,
    ) -> Result<(), CacheError> {
        match self {
            Cache::Async(cache) => cache.put(anchor.to_owned(), hash, files, duration).await,
            Cache::Sync(cache) => cache.put(anchor, hash, &files, duration).await,
        }
    }

    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        match self {
            Cache::Async(cache) => cache.fetch(anchor, hash).await,
            Cache::Sync(cache) => cache.fetch(anchor, hash).await,
        }
    }

    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        match self {
            Cache::Async(cache) => cache.exists(hash).await,
            Cache::Sync(cache) => cache.exists(hash).await,
        }
    }

    /// Reserved for external cleanup tooling; tiers may treat this as a
    /// no-op.
    pub fn clean(&self, anchor: &AbsoluteSystemPath) {
        match self {
            Cache::Async(cache) => cache.clean(anchor),
            Cache::Sync(cache) => cache.clean(anchor),
        }
    }

    pub fn clean_all(&self) {
        match self {
            Cache::Async(cache) => cache.clean_all(),
            Cache::Sync(cache) => cache.clean_all(),
        }
    }

    pub async fn shutdown(self) {
        match self {
            Cache::Async(cache) => cache.shutdown().await,
            Cache::Sync(_) => {}
        }
    }
}
