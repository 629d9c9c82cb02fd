use std::{fs::OpenOptions, io, io::Read};

use monorail_paths::{AbsoluteSystemPath, AnchoredSystemPath};
use tar::Entry;

use crate::{cache_archive::restore_directory::safe_mkdir_all, CacheError};

pub fn restore_regular(
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPath,
    entry: &mut Entry<impl Read>,
) -> Result<(), CacheError> {
    let mode = entry.header().mode()?;

    // Walk the parents first so we never write through a symlink that points
    // outside the anchor.
    safe_mkdir_file(anchor, processed_name)?;

    let resolved_path = anchor.resolve(processed_name);
    let mut open_options = OpenOptions::new();
    open_options.write(true).truncate(true).create(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        open_options.mode(mode);
    }
    #[cfg(windows)]
    let _ = mode;

    let mut file = resolved_path.open_with_options(open_options)?;
    io::copy(entry, &mut file)?;

    Ok(())
}

pub fn safe_mkdir_file(
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPath,
) -> Result<(), CacheError> {
    match processed_name.parent() {
        Some(dir) if !dir.as_str().is_empty() => safe_mkdir_all(anchor, dir, 0o755),
        _ => Ok(()),
    }
}
