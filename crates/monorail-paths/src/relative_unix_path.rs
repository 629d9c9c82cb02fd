use std::{borrow::Borrow, ops::Deref};

use serde::{Deserialize, Serialize};

use crate::{AnchoredSystemPathBuf, PathError, UNIX_SEPARATOR};

/// A borrowed relative path that always uses forward slashes, regardless of
/// host platform. This is the form entries take inside artifacts and hash
/// inputs, so that fingerprints agree across hosts.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct RelativeUnixPath(str);

impl RelativeUnixPath {
    pub fn new(value: &(impl AsRef<str> + ?Sized)) -> Result<&Self, PathError> {
        let value = value.as_ref();
        if value.starts_with(UNIX_SEPARATOR) {
            return Err(PathError::NotRelative(value.to_string()));
        }
        Ok(Self::new_unchecked(value))
    }

    fn new_unchecked(value: &str) -> &Self {
        // SAFETY: RelativeUnixPath is repr(transparent) over str.
        unsafe { &*(value as *const str as *const RelativeUnixPath) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_owned(&self) -> RelativeUnixPathBuf {
        RelativeUnixPathBuf(self.0.to_string())
    }

    /// Converts to the host separator convention.
    pub fn to_system_path(&self) -> AnchoredSystemPathBuf {
        #[cfg(windows)]
        let system = self.0.replace('/', "\\");
        #[cfg(not(windows))]
        let system = self.0.to_string();

        AnchoredSystemPathBuf::new_unchecked(system.into())
    }
}

impl std::fmt::Display for RelativeUnixPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for RelativeUnixPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The owned form of [`RelativeUnixPath`].
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelativeUnixPathBuf(String);

impl RelativeUnixPathBuf {
    pub fn new(value: impl Into<String>) -> Result<Self, PathError> {
        let value = value.into();
        if value.starts_with(UNIX_SEPARATOR) {
            return Err(PathError::NotRelative(value));
        }
        Ok(Self(value))
    }

    pub(crate) fn new_unchecked(value: String) -> Self {
        Self(value)
    }

    pub fn as_path(&self) -> &RelativeUnixPath {
        RelativeUnixPath::new_unchecked(&self.0)
    }

    /// Normalizes the path the way tar entry names expect: directory entries
    /// carry a trailing slash, nothing else does.
    pub fn make_canonical_for_tar(&mut self, is_dir: bool) {
        if is_dir && !self.0.ends_with(UNIX_SEPARATOR) {
            self.0.push(UNIX_SEPARATOR);
        }
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Deref for RelativeUnixPathBuf {
    type Target = RelativeUnixPath;

    fn deref(&self) -> &Self::Target {
        self.as_path()
    }
}

impl Borrow<RelativeUnixPath> for RelativeUnixPathBuf {
    fn borrow(&self) -> &RelativeUnixPath {
        self.as_path()
    }
}

impl std::fmt::Display for RelativeUnixPathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<str> for RelativeUnixPathBuf {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_canonical_for_tar() {
        let mut dir = RelativeUnixPathBuf::new("dist/assets").unwrap();
        dir.make_canonical_for_tar(true);
        assert_eq!(dir.as_str(), "dist/assets/");

        // Idempotent for directories that already carry the slash.
        dir.make_canonical_for_tar(true);
        assert_eq!(dir.as_str(), "dist/assets/");

        let mut file = RelativeUnixPathBuf::new("dist/index.js").unwrap();
        file.make_canonical_for_tar(false);
        assert_eq!(file.as_str(), "dist/index.js");
    }

    #[test]
    fn test_rejects_rooted() {
        assert!(RelativeUnixPathBuf::new("/rooted").is_err());
    }
}
