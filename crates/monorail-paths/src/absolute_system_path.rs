use std::{
    fs::{self, File, Metadata, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use camino::Utf8Path;

use crate::{AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf, PathError};

/// A borrowed absolute path on the host system, guaranteed UTF-8.
///
/// Filesystem operations live here rather than on the owned buffer so that
/// callers holding either form can use them.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AbsoluteSystemPath(Utf8Path);

impl AbsoluteSystemPath {
    /// Validates that the given string is an absolute path and coerces it.
    pub fn new(value: &(impl AsRef<str> + ?Sized)) -> Result<&Self, PathError> {
        let path = Utf8Path::new(value.as_ref());
        if path.is_absolute() {
            Ok(Self::new_unchecked(path))
        } else {
            Err(PathError::NotAbsolute(path.to_string()))
        }
    }

    pub fn from_std_path(path: &Path) -> Result<&Self, PathError> {
        let path = Utf8Path::from_path(path).ok_or_else(|| PathError::invalid_unicode(path))?;
        if path.is_absolute() {
            Ok(Self::new_unchecked(path))
        } else {
            Err(PathError::NotAbsolute(path.to_string()))
        }
    }

    pub(crate) fn new_unchecked(path: &Utf8Path) -> &Self {
        // SAFETY: AbsoluteSystemPath is repr(transparent) over Utf8Path.
        unsafe { &*(path as *const Utf8Path as *const AbsoluteSystemPath) }
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

    pub fn to_owned(&self) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.to_path_buf())
    }

    pub fn parent(&self) -> Option<&AbsoluteSystemPath> {
        self.0.parent().map(Self::new_unchecked)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension()
    }

    /// Joins a single path component. The component must not contain a
    /// separator; this is the cheap, non-validating join used for file names
    /// derived from hashes.
    pub fn join_component(&self, component: &str) -> AbsoluteSystemPathBuf {
        debug_assert!(!component.contains(std::path::MAIN_SEPARATOR));
        AbsoluteSystemPathBuf::new_unchecked(self.0.join(component))
    }

    pub fn join_components(&self, components: &[&str]) -> AbsoluteSystemPathBuf {
        let mut path = self.0.to_path_buf();
        for component in components {
            debug_assert!(!component.contains(std::path::MAIN_SEPARATOR));
            path.push(component);
        }
        AbsoluteSystemPathBuf::new_unchecked(path)
    }

    /// Resolves an anchored path against this path as the anchor.
    pub fn resolve(&self, path: &AnchoredSystemPath) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf::new_unchecked(self.0.join(path.as_utf8_path()))
    }

    /// Expresses `path` relative to this path.
    pub fn anchor(&self, path: &AbsoluteSystemPath) -> Result<AnchoredSystemPathBuf, PathError> {
        let stripped = path
            .0
            .strip_prefix(&self.0)
            .map_err(|_| PathError::NotRelative(path.to_string()))?;
        Ok(AnchoredSystemPathBuf::new_unchecked(stripped.to_path_buf()))
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    pub fn create_dir_all(&self) -> Result<(), io::Error> {
        fs::create_dir_all(&self.0)
    }

    pub fn create_with_contents(&self, contents: impl AsRef<[u8]>) -> Result<(), io::Error> {
        fs::write(&self.0, contents)
    }

    pub fn read_to_string(&self) -> Result<String, io::Error> {
        fs::read_to_string(&self.0)
    }

    pub fn open(&self) -> Result<File, io::Error> {
        File::open(&self.0)
    }

    pub fn open_with_options(&self, options: OpenOptions) -> Result<File, io::Error> {
        options.open(&self.0)
    }

    pub fn rename(&self, to: &AbsoluteSystemPath) -> Result<(), io::Error> {
        fs::rename(&self.0, &to.0)
    }

    pub fn remove_file(&self) -> Result<(), io::Error> {
        fs::remove_file(&self.0)
    }

    /// Removes a file or symlink, tolerating a path that is already gone.
    pub fn remove(&self) -> Result<(), io::Error> {
        match fs::remove_file(&self.0) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn metadata(&self) -> Result<Metadata, io::Error> {
        fs::metadata(&self.0)
    }

    pub fn symlink_metadata(&self) -> Result<Metadata, io::Error> {
        fs::symlink_metadata(&self.0)
    }

    pub fn read_link(&self) -> Result<PathBuf, io::Error> {
        fs::read_link(&self.0)
    }

    #[cfg(unix)]
    pub fn symlink_to_file(&self, target: impl AsRef<Path>) -> Result<(), io::Error> {
        std::os::unix::fs::symlink(target.as_ref(), &self.0)
    }

    #[cfg(windows)]
    pub fn symlink_to_file(&self, target: impl AsRef<Path>) -> Result<(), io::Error> {
        std::os::windows::fs::symlink_file(target.as_ref(), &self.0)
    }

    #[cfg(unix)]
    pub fn symlink_to_dir(&self, target: impl AsRef<Path>) -> Result<(), io::Error> {
        std::os::unix::fs::symlink(target.as_ref(), &self.0)
    }

    #[cfg(windows)]
    pub fn symlink_to_dir(&self, target: impl AsRef<Path>) -> Result<(), io::Error> {
        std::os::windows::fs::symlink_dir(target.as_ref(), &self.0)
    }

    #[cfg(unix)]
    pub fn set_mode(&self, mode: u32) -> Result<(), io::Error> {
        use std::os::unix::fs::PermissionsExt;

        let permissions = fs::Permissions::from_mode(mode);
        fs::set_permissions(&self.0, permissions)
    }

    #[cfg(windows)]
    pub fn set_mode(&self, _mode: u32) -> Result<(), io::Error> {
        Ok(())
    }
}

impl std::fmt::Display for AbsoluteSystemPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPath {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl AsRef<Path> for AbsoluteSystemPath {
    fn as_ref(&self) -> &Path {
        self.0.as_std_path()
    }
}
