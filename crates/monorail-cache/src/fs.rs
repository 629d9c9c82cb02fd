use camino::Utf8Path;
use monorail_analytics::AnalyticsSender;
use monorail_api_client::analytics::{self, AnalyticsEvent};
use monorail_paths::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    cache_archive::{CacheReader, CacheWriter},
    CacheError, CacheHitMetadata, CacheSource,
};

/// The local tier: a directory of artifacts addressed by fingerprint.
///
/// Layout under the cache directory:
/// - `<hash>.tar.zst` (preferred) or `<hash>.tar` — the artifact body
/// - `<hash>-meta.json` — sidecar recording the original task duration
pub struct FsCache {
    cache_directory: AbsoluteSystemPathBuf,
    analytics_recorder: Option<AnalyticsSender>,
}

#[derive(Debug, Deserialize, Serialize)]
struct CacheMetadata {
    hash: String,
    duration: u64,
}

impl CacheMetadata {
    fn read(path: &AbsoluteSystemPath) -> Result<CacheMetadata, CacheError> {
        serde_json::from_str(&path.read_to_string()?).map_err(CacheError::InvalidMetadata)
    }
}

impl FsCache {
    pub fn new(
        cache_dir: &Utf8Path,
        repo_root: &AbsoluteSystemPath,
        analytics_recorder: Option<AnalyticsSender>,
    ) -> Result<Self, CacheError> {
        let cache_directory = AbsoluteSystemPathBuf::from_unknown(repo_root, cache_dir);
        cache_directory.create_dir_all()?;

        Ok(FsCache {
            cache_directory,
            analytics_recorder,
        })
    }

    fn log_fetch(&self, event: analytics::CacheEvent, hash: &str, duration: u64) {
        // A failure to record analytics is not worth failing the cache.
        if let Some(analytics_recorder) = &self.analytics_recorder {
            let analytics_event = AnalyticsEvent {
                session_id: None,
                source: analytics::CacheSource::Local,
                event,
                hash: hash.to_string(),
                duration,
            };

            let _ = analytics_recorder.send(analytics_event);
        }
    }

    fn body_path(&self, hash: &str) -> Option<AbsoluteSystemPathBuf> {
        let compressed = self
            .cache_directory
            .join_component(&format!("{hash}.tar.zst"));
        if compressed.exists() {
            return Some(compressed);
        }

        let uncompressed = self.cache_directory.join_component(&format!("{hash}.tar"));
        uncompressed.exists().then_some(uncompressed)
    }

    #[tracing::instrument(skip_all)]
    pub fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let Some(cache_path) = self.body_path(hash) else {
            debug!("cache miss for {hash} in {}", self.cache_directory);
            self.log_fetch(analytics::CacheEvent::Miss, hash, 0);
            return Ok(None);
        };

        let mut cache_reader = CacheReader::open(&cache_path)?;

        let restored_files = cache_reader.restore(anchor)?;

        // A missing or unreadable sidecar does not invalidate the artifact;
        // the replayed run just can't report time saved.
        let duration = CacheMetadata::read(
            &self
                .cache_directory
                .join_component(&format!("{hash}-meta.json")),
        )
        .map(|meta| meta.duration)
        .unwrap_or_else(|err| {
            debug!("no usable metadata sidecar for {hash}: {err}");
            0
        });

        self.log_fetch(analytics::CacheEvent::Hit, hash, duration);

        Ok(Some((
            CacheHitMetadata {
                time_saved: duration,
                source: CacheSource::Local,
            },
            restored_files,
        )))
    }

    /// Reports whether the artifact body is present. Only the body files are
    /// consulted; the sidecar is not read, so no time-saved figure is
    /// available here.
    #[tracing::instrument(skip_all)]
    pub(crate) fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        Ok(self.body_path(hash).map(|_| CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: 0,
        }))
    }

    #[tracing::instrument(skip_all)]
    pub fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let cache_path = self
            .cache_directory
            .join_component(&format!("{hash}.tar.zst"));

        let mut cache_item = CacheWriter::create(&cache_path)?;

        for file in files {
            cache_item.add_file(anchor, file)?;
        }

        // Renames the temp file onto the final path; an error before this
        // point cleans the partial artifact up via the writer's Drop.
        cache_item.finish()?;

        let metadata_path = self
            .cache_directory
            .join_component(&format!("{hash}-meta.json"));

        let meta = CacheMetadata {
            hash: hash.to_string(),
            duration,
        };

        let meta_json = serde_json::to_string(&meta).map_err(CacheError::MetadataWriteFailure)?;

        // The sidecar gets the same write-to-temp-then-rename treatment so a
        // concurrent reader never sees a torn file.
        let temp_metadata_path = self
            .cache_directory
            .join_component(&format!(".{hash}-meta.json.{}.tmp", std::process::id()));

        temp_metadata_path.create_with_contents(&meta_json)?;
        temp_metadata_path.rename(&metadata_path)?;

        Ok(())
    }

    /// Reserved for external cleanup tooling.
    pub fn clean(&self, _anchor: &AbsoluteSystemPath) {}

    pub fn clean_all(&self) {}
}
