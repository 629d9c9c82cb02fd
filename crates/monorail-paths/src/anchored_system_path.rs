use std::path::Path;

use camino::Utf8Path;

use crate::{AnchoredSystemPathBuf, PathError, RelativeUnixPathBuf};

/// A borrowed path expressed relative to some anchor directory, in the host
/// platform's separator convention.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AnchoredSystemPath(Utf8Path);

impl AnchoredSystemPath {
    pub fn new(value: &(impl AsRef<str> + ?Sized)) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if path.is_relative() {
            Ok(Self::new_unchecked(path))
        } else {
            Err(PathError::NotRelative(path.to_string()))
        }
    }

    pub(crate) fn new_unchecked(path: &Utf8Path) -> &Self {
        // SAFETY: AnchoredSystemPath is repr(transparent) over Utf8Path.
        unsafe { &*(path as *const Utf8Path as *const AnchoredSystemPath) }
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn as_utf8_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn parent(&self) -> Option<&AnchoredSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn to_owned(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::new_unchecked(self.0.to_path_buf())
    }

    /// Converts to the forward-slash form stored inside artifacts. On unix
    /// systems this is the identity.
    pub fn to_unix(&self) -> RelativeUnixPathBuf {
        #[cfg(windows)]
        let unix = self.0.as_str().replace('\\', "/");
        #[cfg(not(windows))]
        let unix = self.0.as_str().to_string();

        RelativeUnixPathBuf::new_unchecked(unix)
    }
}

impl std::fmt::Display for AnchoredSystemPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPath {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self
    }
}

impl AsRef<Path> for AnchoredSystemPath {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}
