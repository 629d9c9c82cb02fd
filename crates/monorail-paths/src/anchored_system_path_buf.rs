use std::{
    borrow::Borrow,
    ops::Deref,
    path::{Path, PathBuf},
};

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::{AnchoredSystemPath, PathError};

/// An owned path expressed relative to some anchor directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnchoredSystemPathBuf(Utf8PathBuf);

impl AnchoredSystemPathBuf {
    /// Validates a raw string as a relative path.
    pub fn from_raw(raw: impl AsRef<str>) -> Result<Self, PathError> {
        Ok(AnchoredSystemPath::new(raw.as_ref())?.to_owned())
    }

    /// Validates a path produced elsewhere on this system, e.g. read out of
    /// an artifact header.
    pub fn from_system_path(path: &Path) -> Result<Self, PathError> {
        let path = Utf8PathBuf::from_path_buf(path.to_path_buf())
            .map_err(|bad| PathError::invalid_unicode(&bad))?;
        if path.is_relative() {
            Ok(Self(path))
        } else {
            Err(PathError::NotRelative(path.into_string()))
        }
    }

    pub(crate) fn new_unchecked(path: Utf8PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &AnchoredSystemPath {
        AnchoredSystemPath::new_unchecked(&self.0)
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }
}

impl Deref for AnchoredSystemPathBuf {
    type Target = AnchoredSystemPath;

    fn deref(&self) -> &Self::Target {
        self.as_path()
    }
}

impl Borrow<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn borrow(&self) -> &AnchoredSystemPath {
        self.as_path()
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self.as_path()
    }
}

impl AsRef<Path> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl TryFrom<&str> for AnchoredSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_raw(value)
    }
}

impl TryFrom<&Path> for AnchoredSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &Path) -> Result<Self, Self::Error> {
        Self::from_system_path(value)
    }
}

impl TryFrom<PathBuf> for AnchoredSystemPathBuf {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        Self::from_system_path(&value)
    }
}

impl std::fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw_rejects_absolute() {
        #[cfg(unix)]
        assert!(AnchoredSystemPathBuf::from_raw("/etc/passwd").is_err());
        assert!(AnchoredSystemPathBuf::from_raw("dist/index.js").is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_to_unix_is_identity_on_unix() {
        let path = AnchoredSystemPathBuf::from_raw("a/b/c").unwrap();
        assert_eq!(path.to_unix().as_str(), "a/b/c");
    }
}
