use std::{
    borrow::Borrow,
    ops::Deref,
    path::{Path, PathBuf},
};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::{AbsoluteSystemPath, PathError};

/// An owned absolute path on the host system, guaranteed UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbsoluteSystemPathBuf(Utf8PathBuf);

impl AbsoluteSystemPathBuf {
    pub fn new(raw: impl Into<Utf8PathBuf>) -> Result<Self, PathError> {
        let path = raw.into();
        if path.is_absolute() {
            Ok(Self(path))
        } else {
            Err(PathError::NotAbsolute(path.into_string()))
        }
    }

    pub(crate) fn new_unchecked(path: Utf8PathBuf) -> Self {
        Self(path)
    }

    /// Interprets a path of unknown provenance: absolute paths are taken as
    /// they are, relative paths are joined onto `base`. The result is
    /// lexically cleaned either way.
    pub fn from_unknown(base: &AbsoluteSystemPath, unknown: impl AsRef<Utf8Path>) -> Self {
        let unknown = unknown.as_ref();
        let joined = if unknown.is_absolute() {
            unknown.as_std_path().to_path_buf()
        } else {
            base.as_std_path().join(unknown.as_std_path())
        };
        let cleaned = path_clean::clean(joined);
        // Joining onto an absolute UTF-8 base preserves both properties.
        Self(
            Utf8PathBuf::from_path_buf(cleaned)
                .unwrap_or_else(|_| unreachable!("both inputs are UTF-8")),
        )
    }

    pub fn as_path(&self) -> &AbsoluteSystemPath {
        AbsoluteSystemPath::new_unchecked(&self.0)
    }

    pub fn into_string(self) -> String {
        self.0.into_string()
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        self.as_path()
    }
}

impl Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        self.as_path()
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self.as_path()
    }
}

impl AsRef<Path> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&Path> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: &Path) -> Result<Self, Self::Error> {
        Ok(AbsoluteSystemPath::from_std_path(value)?.to_owned())
    }
}

impl TryFrom<PathBuf> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        let path =
            Utf8PathBuf::from_path_buf(value).map_err(|bad| PathError::invalid_unicode(&bad))?;
        Self::new(path)
    }
}

impl std::fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
