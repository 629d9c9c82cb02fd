use std::{
    fs,
    path::{Path, PathBuf},
};

use monorail_paths::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf};
use path_clean::clean;

use crate::{cache_archive::restore_regular::safe_mkdir_file, CacheError};

/// One symlink entry lifted out of the stream: where the link lives and the
/// verbatim target recorded for it.
#[derive(Debug)]
pub(crate) struct SymlinkEntry {
    pub path: AnchoredSystemPathBuf,
    pub target: PathBuf,
}

impl SymlinkEntry {
    /// Restores the link without checking that the target exists; used for
    /// the deferred pass, where dangling links are legitimate.
    pub(crate) fn restore_allowing_missing_target(
        &self,
        anchor: &AbsoluteSystemPath,
    ) -> Result<AnchoredSystemPathBuf, CacheError> {
        actually_restore_symlink(anchor, self)?;
        Ok(self.path.clone())
    }
}

/// Restores a symlink whose target already exists; a missing target reports
/// [`CacheError::LinkTargetDoesNotExist`] so the caller can defer the entry.
pub(crate) fn restore_symlink(
    anchor: &AbsoluteSystemPath,
    link: &SymlinkEntry,
) -> Result<AnchoredSystemPathBuf, CacheError> {
    let processed_linkname = canonicalize_linkname(anchor, &link.path, &link.target)?;

    if fs::symlink_metadata(&processed_linkname).is_err() {
        return Err(CacheError::LinkTargetDoesNotExist(
            processed_linkname.to_string_lossy().to_string(),
        ));
    }

    actually_restore_symlink(anchor, link)?;

    Ok(link.path.clone())
}

fn actually_restore_symlink(
    anchor: &AbsoluteSystemPath,
    link: &SymlinkEntry,
) -> Result<(), CacheError> {
    safe_mkdir_file(anchor, &link.path)?;

    let symlink_from = anchor.resolve(&link.path);

    // Clobber whatever sits at the link location; later entries win.
    symlink_from.remove()?;

    // The target is written verbatim. Whether it resolves to a directory only
    // matters on Windows, where the link flavors differ.
    let target_is_dir = canonicalize_linkname(anchor, &link.path, &link.target)
        .ok()
        .and_then(|resolved| fs::metadata(resolved).ok())
        .is_some_and(|meta| meta.is_dir());

    if target_is_dir {
        symlink_from.symlink_to_dir(&link.target)?;
    } else {
        symlink_from.symlink_to_file(&link.target)?;
    }

    Ok(())
}

/// Determines, lexically, where `linkname` will point once restored verbatim
/// at `processed_name` under `anchor`.
///
/// Link targets are restored without modification: no slash conversion, no
/// resolution. An artifact produced on one platform may deliberately target
/// another. The canonical form computed here exists only so deferred links
/// can be ordered and checked for cycles.
pub(crate) fn canonicalize_linkname(
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPath,
    linkname: &Path,
) -> Result<PathBuf, CacheError> {
    let cleaned_linkname = clean(linkname);

    // An absolute target is canonical by rule.
    if cleaned_linkname.is_absolute() {
        return Ok(cleaned_linkname);
    }

    // Everything else is treated as relative to the link's own directory,
    // because that is how the OS will treat it.
    let cleaned_linkname = AnchoredSystemPathBuf::from_system_path(&cleaned_linkname)?;
    let source = anchor.resolve(processed_name);
    let link_dir = source.parent().unwrap_or(anchor);
    let canonicalized = link_dir.resolve(&cleaned_linkname);

    Ok(clean(canonicalized.as_std_path()))
}
