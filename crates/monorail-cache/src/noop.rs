use monorail_paths::{AbsoluteSystemPath, AnchoredSystemPathBuf};

use crate::{CacheError, CacheHitMetadata};

/// The tier of last resort: reports every lookup as a miss and accepts every
/// write without storing anything. Keeping one of these in the tier list
/// means callers never have to special-case an empty composition.
#[derive(Debug, Default)]
pub struct NoopCache;

impl NoopCache {
    pub fn new() -> Self {
        Self
    }

    pub fn fetch(
        &self,
        _anchor: &AbsoluteSystemPath,
        _hash: &str,
    ) -> Result<Option<(CacheHitMetadata, Vec<AnchoredSystemPathBuf>)>, CacheError> {
        Ok(None)
    }

    pub fn exists(&self, _hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        Ok(None)
    }

    pub fn put(
        &self,
        _anchor: &AbsoluteSystemPath,
        _hash: &str,
        _files: &[AnchoredSystemPathBuf],
        _duration: u64,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    pub fn clean(&self, _anchor: &AbsoluteSystemPath) {}

    pub fn clean_all(&self) {}
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use monorail_paths::AbsoluteSystemPath;

    use super::*;

    #[test]
    fn test_noop_is_stateless() -> Result<()> {
        let cache = NoopCache::new();

        #[cfg(unix)]
        let anchor = AbsoluteSystemPath::new("/anchor")?;
        #[cfg(windows)]
        let anchor = AbsoluteSystemPath::new("C:\\anchor")?;

        cache.put(anchor, "f60ad21b4f21d2a9", &[], 100)?;

        // Even a hash that was just "stored" misses.
        assert!(cache.fetch(anchor, "f60ad21b4f21d2a9")?.is_none());
        assert!(cache.exists("f60ad21b4f21d2a9")?.is_none());

        Ok(())
    }
}
