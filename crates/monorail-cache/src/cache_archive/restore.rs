use std::{
    collections::HashMap,
    io::Read,
    path::{Component, Path},
};

use monorail_paths::{AbsoluteSystemPath, AnchoredSystemPathBuf, PathError};
use petgraph::graph::DiGraph;

use crate::{
    cache_archive::{
        restore_directory::restore_directory,
        restore_regular::restore_regular,
        restore_symlink::{canonicalize_linkname, restore_symlink, SymlinkEntry},
    },
    CacheError,
};

/// Reads an artifact stream back into files.
pub struct CacheReader<'a> {
    reader: Box<dyn Read + 'a>,
}

impl<'a> CacheReader<'a> {
    pub fn from_reader(reader: impl Read + 'a, is_compressed: bool) -> Result<Self, CacheError> {
        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(reader)?)
        } else {
            Box::new(reader)
        };

        Ok(CacheReader { reader })
    }

    pub fn open(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let file = path.open()?;
        let is_compressed = path.extension() == Some("zst");

        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(file)?)
        } else {
            Box::new(file)
        };

        Ok(CacheReader { reader })
    }

    /// Recreates the tree under `anchor`, returning the restored paths in
    /// stream order. Symlinks whose target does not exist yet are deferred
    /// and restored after everything else, in dependency order, so a link is
    /// never traversed before the thing it points at has a chance to exist.
    pub fn restore(
        &mut self,
        anchor: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut restored = Vec::new();
        anchor.create_dir_all()?;

        let mut tr = tar::Archive::new(&mut self.reader);

        Self::restore_entries(&mut tr, &mut restored, anchor)?;
        Ok(restored)
    }

    fn restore_entries<T: Read>(
        tr: &mut tar::Archive<T>,
        restored: &mut Vec<AnchoredSystemPathBuf>,
        anchor: &AbsoluteSystemPath,
    ) -> Result<(), CacheError> {
        // Symlinks whose target is missing on first pass; sorted
        // topologically afterwards.
        let mut deferred_symlinks = Vec::new();

        for entry in tr.entries()? {
            let mut entry = entry?;
            let processed_name = canonicalize_name(&entry.path()?)?;

            match entry.header().entry_type() {
                tar::EntryType::Directory => {
                    let mode = entry.header().mode()?;
                    restore_directory(anchor, &processed_name, mode)?;
                    restored.push(processed_name);
                }
                tar::EntryType::Regular => {
                    restore_regular(anchor, &processed_name, &mut entry)?;
                    restored.push(processed_name);
                }
                tar::EntryType::Symlink => {
                    let target = entry
                        .link_name()?
                        .ok_or(CacheError::LinkTargetNotOnHeader)?
                        .into_owned();
                    let link = SymlinkEntry {
                        path: processed_name,
                        target,
                    };
                    match restore_symlink(anchor, &link) {
                        Err(CacheError::LinkTargetDoesNotExist(_)) => {
                            deferred_symlinks.push(link)
                        }
                        Err(e) => return Err(e),
                        Ok(restored_path) => restored.push(restored_path),
                    }
                }
                ty => return Err(CacheError::RestoreUnsupportedFileType(ty)),
            }
        }

        let mut restored_symlinks =
            Self::topologically_restore_symlinks(anchor, deferred_symlinks)?;
        restored.append(&mut restored_symlinks);
        Ok(())
    }

    fn topologically_restore_symlinks(
        anchor: &AbsoluteSystemPath,
        symlinks: Vec<SymlinkEntry>,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut graph = DiGraph::new();
        let mut entry_lookup = HashMap::new();
        let mut nodes = HashMap::new();
        let mut restored = Vec::new();

        for link in symlinks {
            let processed_sourcename =
                path_clean::clean(anchor.resolve(&link.path).as_std_path());
            let processed_linkname = canonicalize_linkname(anchor, &link.path, &link.target)?;

            let source_node = *nodes
                .entry(processed_sourcename.clone())
                .or_insert_with(|| graph.add_node(processed_sourcename.clone()));
            let link_node = *nodes
                .entry(processed_linkname.clone())
                .or_insert_with(|| graph.add_node(processed_linkname));

            graph.add_edge(source_node, link_node, ());

            entry_lookup.insert(processed_sourcename, link);
        }

        let nodes =
            petgraph::algo::toposort(&graph, None).map_err(|_| CacheError::CycleDetected)?;

        for node in nodes {
            let key = &graph[node];

            let Some(link) = entry_lookup.get(key) else {
                // Link targets that are not themselves deferred symlinks.
                continue;
            };
            restored.push(link.restore_allowing_missing_target(anchor)?);
        }

        Ok(restored)
    }
}

/// Validates an entry name from the stream and converts it to an anchored
/// path. Absolute names, traversal outside the anchor, and (for artifacts
/// that need to restore on Windows) backslashes are rejected here, before
/// anything touches the filesystem.
pub(crate) fn canonicalize_name(name: &Path) -> Result<AnchoredSystemPathBuf, CacheError> {
    let name_str = name
        .to_str()
        .ok_or_else(|| PathError::invalid_unicode(name))?;

    #[cfg(windows)]
    {
        if name_str.contains('\\') {
            return Err(CacheError::WindowsUnsafeName(name_str.to_string()));
        }
    }

    // Directory entries carry a trailing slash in the stream; restored paths
    // do not.
    let trimmed = name_str.trim_end_matches('/');

    let path = Path::new(trimmed);
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::MalformedPath(name_str.to_string()).into())
            }
            _ => {}
        }
    }

    Ok(AnchoredSystemPathBuf::from_system_path(path)?)
}
