use std::sync::{Arc, RwLock};

use futures::future::join_all;
use monorail_analytics::AnalyticsSender;
use monorail_api_client::{ApiAuth, ApiClient};
use monorail_paths::{AbsoluteSystemPath, AnchoredSystemPathBuf};
use tracing::{debug, warn};

use crate::{
    fs::FsCache,
    http::HttpCache,
    noop::NoopCache,
    signature_authentication::{ArtifactSignatureAuthenticator, SignatureError},
    CacheError, CacheHitMetadata, CacheOpts,
};

/// Invoked when a tier reports itself disabled and is dropped from the live
/// list; receives the disabling error's message. Called exactly once per
/// removed tier, however many operations observe the condition concurrently.
pub type OnCacheRemoved = Arc<dyn Fn(&str) + Send + Sync>;

pub(crate) enum CacheTier {
    Fs(FsCache),
    Http(Box<HttpCache>),
    Noop(NoopCache),
}

impl CacheTier {
    fn name(&self) -> &'static str {
        match self {
            CacheTier::Fs(_) => "filesystem",
            CacheTier::Http(_) => "remote",
            CacheTier::Noop(_) => "noop",
        }
    }

    async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        match self {
            CacheTier::Fs(fs) => fs.put(anchor, hash, files, duration),
            CacheTier::Http(http) => http.put(anchor, hash, files, duration).await,
            CacheTier::Noop(noop) => noop.put(anchor, hash, files, duration),
        }
    }

    async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        match self {
            CacheTier::Fs(fs) => fs.fetch(anchor, hash),
            CacheTier::Http(http) => http.fetch(hash).await,
            CacheTier::Noop(noop) => noop.fetch(anchor, hash),
        }
    }

    async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        match self {
            CacheTier::Fs(fs) => fs.exists(hash),
            CacheTier::Http(http) => http.exists(hash).await,
            CacheTier::Noop(noop) => noop.exists(hash),
        }
    }

    fn clean(&self, anchor: &AbsoluteSystemPath) {
        match self {
            CacheTier::Fs(fs) => fs.clean(anchor),
            CacheTier::Http(http) => http.clean(anchor),
            CacheTier::Noop(noop) => noop.clean(anchor),
        }
    }

    fn clean_all(&self) {
        match self {
            CacheTier::Fs(fs) => fs.clean_all(),
            CacheTier::Http(http) => http.clean_all(),
            CacheTier::Noop(noop) => noop.clean_all(),
        }
    }
}

/// Ordered composition of cache tiers.
///
/// Reads go through the tiers in priority order (index 0 first) and a hit in
/// a lower tier is written back into every higher tier. Writes fan out to all
/// tiers in parallel. A tier that reports `CacheDisabled` is removed from the
/// live list for the rest of the run.
pub struct CacheMultiplexer {
    // Shared mutable state: operations snapshot the list under the read
    // lock and never hold it across I/O; removal briefly takes the write
    // lock.
    tiers: RwLock<Vec<Arc<CacheTier>>>,
    on_cache_removed: Option<OnCacheRemoved>,
}

impl CacheMultiplexer {
    pub fn new(
        opts: &CacheOpts,
        repo_root: &AbsoluteSystemPath,
        client: ApiClient,
        api_auth: Option<ApiAuth>,
        analytics_recorder: Option<AnalyticsSender>,
        on_cache_removed: Option<OnCacheRemoved>,
    ) -> Result<Self, CacheError> {
        let use_fs_cache = !opts.skip_filesystem;
        let use_http_cache = !opts.skip_remote && api_auth.is_some();

        // The two flags are not mutually exclusive, so it is possible to
        // configure yourself out of having a cache. That is worth a warning,
        // not a failed build.
        if !use_fs_cache && !use_http_cache {
            warn!("no caches are enabled");
        }

        let mut tiers: Vec<Arc<CacheTier>> = Vec::new();

        if use_fs_cache {
            tiers.push(Arc::new(CacheTier::Fs(FsCache::new(
                &opts.cache_dir,
                repo_root,
                analytics_recorder.clone(),
            )?)));
        }

        if use_http_cache {
            if let Some(api_auth) = api_auth {
                // Signing without a secret is a configuration error; surface
                // it here instead of on the first artifact exchange.
                let signature_requested = opts
                    .remote_cache_opts
                    .as_ref()
                    .is_some_and(|remote_cache_opts| remote_cache_opts.signature);
                if signature_requested {
                    let signer = ArtifactSignatureAuthenticator::new(
                        api_auth.team_id.clone().unwrap_or_default(),
                        None,
                    );
                    if !signer.is_enabled() {
                        return Err(SignatureError::NoSignatureSecretKey.into());
                    }
                }

                tiers.push(Arc::new(CacheTier::Http(Box::new(HttpCache::new(
                    client,
                    opts,
                    repo_root.to_owned(),
                    api_auth,
                    analytics_recorder,
                )))));
            }
        }

        // The http tier can remove itself at runtime; when it is the only
        // real tier, a noop backstop keeps the list non-empty.
        if !use_fs_cache {
            tiers.push(Arc::new(CacheTier::Noop(NoopCache::new())));
        }

        Ok(CacheMultiplexer {
            tiers: RwLock::new(tiers),
            on_cache_removed,
        })
    }

    fn snapshot(&self) -> Vec<Arc<CacheTier>> {
        self.tiers.read().unwrap().clone()
    }

    #[tracing::instrument(skip_all)]
    pub async fn put(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let tiers = self.snapshot();
        self.store_until(&tiers, tiers.len(), anchor, hash, files, duration)
            .await
    }

    /// Writes the artifact into `tiers[..until]` in parallel. A
    /// `CacheDisabled` error removes the offending tier and does not stop the
    /// others; any other error fails the store once every write has settled.
    async fn store_until(
        &self,
        tiers: &[Arc<CacheTier>],
        until: usize,
        anchor: &AbsoluteSystemPath,
        hash: &str,
        files: &[AnchoredSystemPathBuf],
        duration: u64,
    ) -> Result<(), CacheError> {
        let results = join_all(tiers[..until].iter().map(|tier| async move {
            let result = tier.put(anchor, hash, files, duration).await;
            (tier, result)
        }))
        .await;

        let mut first_error = None;
        for (tier, result) in results {
            if let Err(err) = result {
                if err.is_cache_disabled() {
                    self.remove_tier(tier, &err);
                } else if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    warn!("cache tier {} failed to store {hash}: {err}", tier.name());
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Read-through fetch. Tiers are tried strictly in order so two tiers
    /// never race to restore the same files into the anchor; the first hit is
    /// promoted into every higher-priority tier before returning.
    ///
    /// Tier errors are downgraded to misses here: the scheduler re-executes
    /// the task either way.
    #[tracing::instrument(skip_all)]
    pub async fn fetch(
        &self,
        anchor: &AbsoluteSystemPath,
        hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        let tiers = self.snapshot();

        for (index, tier) in tiers.iter().enumerate() {
            match tier.fetch(anchor, hash).await {
                Ok(Some((metadata, files))) => {
                    if index > 0 {
                        debug!("backfilling faster tiers with {hash}");
                        if let Err(err) = self
                            .store_until(&tiers, index, anchor, hash, &files, metadata.time_saved)
                            .await
                        {
                            warn!("failed to backfill faster tiers with {hash}: {err}");
                        }
                    }
                    return Ok(Some((metadata, files)));
                }
                Ok(None) => {}
                Err(err) if err.is_cache_disabled() => {
                    self.remove_tier(tier, &err);
                }
                Err(err) => {
                    warn!("cache tier {} failed to fetch {hash}: {err}", tier.name());
                }
            }
        }

        Ok(None)
    }

    #[tracing::instrument(skip_all)]
    pub async fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let tiers = self.snapshot();

        for tier in &tiers {
            match tier.exists(hash).await {
                Ok(Some(metadata)) => return Ok(Some(metadata)),
                Ok(None) => {}
                Err(err) if err.is_cache_disabled() => {
                    self.remove_tier(tier, &err);
                }
                Err(err) => {
                    warn!("cache tier {} failed existence check: {err}", tier.name());
                }
            }
        }

        Ok(None)
    }

    pub fn clean(&self, anchor: &AbsoluteSystemPath) {
        for tier in self.snapshot() {
            tier.clean(anchor);
        }
    }

    pub fn clean_all(&self) {
        for tier in self.snapshot() {
            tier.clean_all();
        }
    }

    /// Drops a tier from the live list. Guarded by the write lock so that
    /// concurrent removal requests for the same tier result in exactly one
    /// list mutation and one callback invocation; operations already in
    /// flight finish against their snapshot but can no longer produce a
    /// second removal.
    fn remove_tier(&self, tier: &Arc<CacheTier>, err: &CacheError) {
        let mut tiers = self.tiers.write().unwrap();
        if let Some(position) = tiers.iter().position(|candidate| Arc::ptr_eq(candidate, tier)) {
            tiers.remove(position);
            warn!("removed {} cache tier: {err}", tier.name());
            if let Some(on_cache_removed) = &self.on_cache_removed {
                on_cache_removed(&err.to_string());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tier_count(&self) -> usize {
        self.tiers.read().unwrap().len()
    }
}
