use std::{
    fs,
    path::{Component, Path},
};

use monorail_paths::{
    AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf,
};

use crate::CacheError;

pub fn restore_directory(
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPath,
    mode: u32,
) -> Result<(), CacheError> {
    safe_mkdir_all(anchor, processed_name, mode)
}

/// Creates a directory and all of its parents, refusing to follow any
/// symlink that points outside the anchor. Walks the path one component at a
/// time so a hostile entry can't smuggle a write through an
/// already-restored link.
pub fn safe_mkdir_all(
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPath,
    mode: u32,
) -> Result<(), CacheError> {
    let mut calculated_anchor = anchor.to_owned();
    for component in processed_name.as_std_path().components() {
        let segment = AnchoredSystemPathBuf::from_system_path(Path::new(component.as_os_str()))?;
        calculated_anchor = check_path(anchor, &calculated_anchor, &segment)?;
    }

    // Safe to create now. This can still race with other restorations of the
    // same tree; create_dir_all tolerates directories that already exist.
    let resolved_name = anchor.resolve(processed_name);
    fs::create_dir_all(resolved_name.as_std_path())?;

    #[cfg(unix)]
    resolved_name.set_mode(mode)?;
    #[cfg(windows)]
    let _ = mode;

    Ok(())
}

fn check_path(
    original_anchor: &AbsoluteSystemPath,
    accumulated_anchor: &AbsoluteSystemPath,
    segment: &AnchoredSystemPathBuf,
) -> Result<AbsoluteSystemPathBuf, CacheError> {
    // The segment itself can be sneakily absolute (Windows drive prefixes,
    // device names).
    if segment
        .as_std_path()
        .components()
        .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
    {
        return Err(CacheError::LinkOutsideOfDirectory(segment.to_string()));
    }

    let combined_path = accumulated_anchor.resolve(segment.as_path());
    let Ok(file_info) = combined_path.symlink_metadata() else {
        // Nothing exists there yet, so nothing can redirect us.
        return Ok(combined_path);
    };

    if !file_info.is_symlink() {
        return Ok(combined_path);
    }

    // Resolve the link lexically and check it stays under the anchor. We do
    // not eval the full chain; one level at a time is enough because the next
    // component goes through this check against the computed anchor.
    let link_target = combined_path.read_link()?;
    if link_target.is_absolute() {
        let cleaned = path_clean::clean(&link_target);
        if cleaned.starts_with(original_anchor.as_std_path()) {
            return Ok(AbsoluteSystemPathBuf::try_from(cleaned)?);
        }
    } else {
        let relative_target = AnchoredSystemPathBuf::from_system_path(&link_target)?;
        let computed_target =
            path_clean::clean(accumulated_anchor.resolve(&relative_target).as_std_path());
        if computed_target.starts_with(original_anchor.as_std_path()) {
            return Ok(AbsoluteSystemPathBuf::try_from(computed_target)?);
        }
    }

    Err(CacheError::LinkOutsideOfDirectory(
        link_target.to_string_lossy().to_string(),
    ))
}
