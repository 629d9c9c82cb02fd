use std::{
    fs,
    fs::OpenOptions,
    io::{BufWriter, Read, Write},
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
};

use tar::{EntryType, Header};
use monorail_paths::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath};

use crate::CacheError;

/// Counter feeding temp filenames, so that concurrent writers within one
/// process never collide. Combined with the pid for cross-process uniqueness.
static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_temp_path(final_path: &AbsoluteSystemPath) -> AbsoluteSystemPathBuf {
    let file_name = final_path.file_name().unwrap_or("artifact");
    let unique_id = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_name = format!(".{}.{}.{}.tmp", file_name, std::process::id(), unique_id);
    final_path
        .parent()
        .expect("cache path must have parent")
        .join_component(&temp_name)
}

/// Writes one artifact.
///
/// The writer chain is tar -> zstd (optional) -> BufWriter -> file. When
/// created with [`CacheWriter::create`] the file is a temp file that
/// [`CacheWriter::finish`] renames into place, so concurrent readers observe
/// either the previous complete artifact or the new one, never a partial
/// write. Dropping the writer without `finish` removes the temp file.
pub struct CacheWriter<'a> {
    builder: tar::Builder<Box<dyn Write + 'a>>,
    temp_path: Option<AbsoluteSystemPathBuf>,
    final_path: Option<AbsoluteSystemPathBuf>,
}

impl Drop for CacheWriter<'_> {
    fn drop(&mut self) {
        // take() so a completed finish() leaves nothing to clean up.
        if let Some(temp_path) = self.temp_path.take() {
            let _ = temp_path.remove_file();
        }
    }
}

impl<'a> CacheWriter<'a> {
    fn append_data(
        &mut self,
        header: &mut Header,
        path: impl AsRef<Path>,
        body: impl Read,
    ) -> Result<(), CacheError> {
        Ok(self.builder.append_data(header, path, body)?)
    }

    fn append_link(
        &mut self,
        header: &mut Header,
        path: impl AsRef<Path>,
        target: impl AsRef<Path>,
    ) -> Result<(), CacheError> {
        Ok(self.builder.append_link(header, path, target)?)
    }

    /// Finalizes the stream and, for file-backed writers, renames the temp
    /// file onto the final path.
    pub fn finish(mut self) -> Result<(), CacheError> {
        // Writes the tar footer and flushes. The zstd encoder is an
        // auto-finish encoder, so the frame is closed when the chain drops.
        self.builder.finish()?;

        if let (Some(temp_path), Some(final_path)) = (self.temp_path.take(), self.final_path.take())
        {
            temp_path.rename(&final_path)?;
        }

        Ok(())
    }

    pub fn from_writer(writer: impl Write + 'a, use_compression: bool) -> Result<Self, CacheError> {
        if use_compression {
            let zw = zstd::Encoder::new(writer, 0)?.auto_finish();
            Ok(CacheWriter {
                builder: tar::Builder::new(Box::new(zw)),
                temp_path: None,
                final_path: None,
            })
        } else {
            Ok(CacheWriter {
                builder: tar::Builder::new(Box::new(writer)),
                temp_path: None,
                final_path: None,
            })
        }
    }

    /// Opens a new artifact at `path`. Compression is selected by the `.zst`
    /// extension of the destination.
    pub fn create(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let temp_path = generate_temp_path(path);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);

        let file = temp_path.open_with_options(options)?;

        // Flush to disk in 1mb chunks.
        let file_buffer = BufWriter::with_capacity(2usize.pow(20), file);

        let is_compressed = path.extension() == Some("zst");

        if is_compressed {
            let zw = zstd::Encoder::new(file_buffer, 0)?.auto_finish();

            Ok(CacheWriter {
                builder: tar::Builder::new(Box::new(zw)),
                temp_path: Some(temp_path),
                final_path: Some(path.to_owned()),
            })
        } else {
            Ok(CacheWriter {
                builder: tar::Builder::new(Box::new(file_buffer)),
                temp_path: Some(temp_path),
                final_path: Some(path.to_owned()),
            })
        }
    }

    /// Appends one anchor-relative entry.
    pub(crate) fn add_file(
        &mut self,
        anchor: &AbsoluteSystemPath,
        file_path: &AnchoredSystemPath,
    ) -> Result<(), CacheError> {
        let source_path = anchor.resolve(file_path);

        // lstat semantics: a symlink is recorded as a symlink, never
        // followed, so dangling links round-trip.
        let file_info = source_path.symlink_metadata()?;

        // Entry names inside the artifact are unix-style.
        let mut file_path = file_path.to_unix();
        file_path.make_canonical_for_tar(file_info.is_dir());

        let mut header = Self::create_header(&file_info)?;

        if matches!(header.entry_type(), EntryType::Regular) && file_info.len() > 0 {
            let file = source_path.open()?;
            self.append_data(&mut header, file_path.as_str(), file)?;
        } else if matches!(header.entry_type(), EntryType::Symlink) {
            // The link target is stored verbatim; restoration interprets it.
            let target = source_path.read_link()?;
            self.append_link(&mut header, file_path.as_str(), &target)?;
        } else {
            self.append_data(&mut header, file_path.as_str(), &mut std::io::empty())?;
        }

        Ok(())
    }

    fn create_header(file_info: &fs::Metadata) -> Result<Header, CacheError> {
        let mut header = Header::new_gnu();

        let mode: u32;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            mode = file_info.mode();
        }
        #[cfg(windows)]
        {
            // Windows makes up 0o666 for files; normalize to a mode that
            // restores as executable-readable everywhere.
            mode = 0o755;
        }
        header.set_mode(mode);

        if file_info.is_symlink() {
            // The linkname is set when the entry is appended; it may be too
            // long for the fixed header field.
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
        } else if file_info.is_dir() {
            header.set_size(0);
            header.set_entry_type(EntryType::Directory);
        } else if file_info.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(file_info.len());
        } else {
            return Err(CacheError::CreateUnsupportedFileType);
        }

        // Zero everything that would vary between hosts so identical inputs
        // produce identical artifacts.
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        if let Some(gnu) = header.as_gnu_mut() {
            gnu.set_atime(0);
            gnu.set_ctime(0);
        }

        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use monorail_paths::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
    use tempfile::tempdir;
    use test_case::test_case;

    use super::*;
    use crate::cache_archive::restore::CacheReader;

    #[derive(Debug)]
    enum FileType {
        Dir,
        Symlink { linkname: String },
        Fifo,
        File,
    }

    #[derive(Debug)]
    struct CreateFileDefinition {
        path: AnchoredSystemPathBuf,
        mode: u32,
        file_type: FileType,
    }

    fn create_entry(anchor: &AbsoluteSystemPath, file: &CreateFileDefinition) -> Result<()> {
        match &file.file_type {
            FileType::Dir => create_dir(anchor, file),
            FileType::Symlink { linkname } => create_symlink(anchor, file, linkname),
            FileType::Fifo => create_fifo(anchor, file),
            FileType::File => create_file(anchor, file),
        }
    }

    fn create_dir(anchor: &AbsoluteSystemPath, file: &CreateFileDefinition) -> Result<()> {
        let path = anchor.resolve(&file.path);
        path.create_dir_all()?;

        #[cfg(unix)]
        {
            path.set_mode(file.mode & 0o777)?;
        }

        Ok(())
    }

    fn create_symlink(
        anchor: &AbsoluteSystemPath,
        file: &CreateFileDefinition,
        linkname: &str,
    ) -> Result<()> {
        let path = anchor.resolve(&file.path);
        path.symlink_to_file(linkname)?;

        Ok(())
    }

    #[cfg(unix)]
    fn create_fifo(anchor: &AbsoluteSystemPath, file: &CreateFileDefinition) -> Result<()> {
        use std::ffi::CString;

        let path = anchor.resolve(&file.path);
        let path_cstr = CString::new(path.as_str())?;

        unsafe {
            libc::mkfifo(path_cstr.as_ptr(), 0o644);
        }

        Ok(())
    }

    #[cfg(windows)]
    fn create_fifo(_: &AbsoluteSystemPath, _: &CreateFileDefinition) -> Result<()> {
        anyhow::bail!("attempted to create unsupported file type")
    }

    fn create_file(anchor: &AbsoluteSystemPath, file: &CreateFileDefinition) -> Result<()> {
        let path = anchor.resolve(&file.path);
        path.create_with_contents(b"file contents")?;
        #[cfg(unix)]
        {
            path.set_mode(file.mode & 0o777)?;
        }

        Ok(())
    }

    #[test_case(
      vec![
         CreateFileDefinition {
           path: AnchoredSystemPathBuf::from_raw("hello world.txt").unwrap(),
           mode: 0o644,
           file_type: FileType::File,
         }
      ],
      None
      ; "create regular file"
    )]
    #[test_case(
        vec![
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("one").unwrap(),
                mode: 0o777,
                file_type: FileType::Symlink { linkname: "two".to_string() },
            },
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("two").unwrap(),
                mode: 0o777,
                file_type: FileType::Symlink { linkname: "three".to_string() },
            },
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("three").unwrap(),
                mode: 0o777,
                file_type: FileType::File,
            }
        ],
        None
        ; "create symlinks"
    )]
    #[test_case(
        vec![
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("parent").unwrap(),
                mode: 0o777,
                file_type: FileType::Dir,
            },
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("parent/child").unwrap(),
                mode: 0o644,
                file_type: FileType::File,
            },
        ],
        None
        ; "create directory"
    )]
    #[test_case(
        vec![
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("one").unwrap(),
                mode: 0o644,
                file_type: FileType::Symlink { linkname: "two".to_string() },
            },
        ],
        None
        ; "create broken symlink"
    )]
    #[test_case(
        vec![
            CreateFileDefinition {
                path: AnchoredSystemPathBuf::from_raw("one").unwrap(),
                mode: 0o644,
                file_type: FileType::Fifo,
            }
        ],
        Some("attempted to create unsupported file type")
        ; "create unsupported"
    )]
    fn test_create(
        files: Vec<CreateFileDefinition>,
        #[allow(unused_variables)] expected_err: Option<&str>,
    ) -> Result<()> {
        'outer: for compressed in [false, true] {
            let input_dir = tempdir()?;
            let archive_dir = tempdir()?;
            let input_dir_path = AbsoluteSystemPathBuf::try_from(input_dir.path())?;
            let archive_path = if compressed {
                AbsoluteSystemPathBuf::try_from(archive_dir.path().join("out.tar.zst"))?
            } else {
                AbsoluteSystemPathBuf::try_from(archive_dir.path().join("out.tar"))?
            };

            let mut cache_archive = CacheWriter::create(&archive_path)?;

            for file in files.iter() {
                let result = create_entry(&input_dir_path, file);
                if let Err(err) = result {
                    assert!(expected_err.is_some());
                    assert_eq!(err.to_string(), expected_err.unwrap());
                    continue 'outer;
                }

                let result = cache_archive.add_file(&input_dir_path, &file.path);
                if let Err(err) = result {
                    assert!(expected_err.is_some());
                    assert_eq!(err.to_string(), expected_err.unwrap());
                    continue 'outer;
                }
            }

            cache_archive.finish()?;
        }

        Ok(())
    }

    #[test]
    fn test_round_trip_with_long_names() -> Result<()> {
        let input_dir = tempdir()?;
        let input_dir_path = AbsoluteSystemPath::from_std_path(input_dir.path())?;

        let tar_dir = tempdir()?;
        let tar_path = AbsoluteSystemPath::from_std_path(tar_dir.path())?.join_component("out.tar");

        // Names longer than the 100-byte tar name field exercise the GNU
        // long-name extension.
        let base = "a-name-long-enough-to-overflow-the-classic-tar-header-name-field-which-caps-out-at-one-hundred-bytes";
        let file_name = format!("{base}.txt");
        let long_file = AnchoredSystemPath::new(&file_name)?;
        let long_dir = AnchoredSystemPath::new(base)?;
        let long_symlink = AnchoredSystemPath::new("a-link-also-long-enough-to-overflow-the-classic-tar-header-linkname-field-which-likewise-caps-out-at-one-hundred-bytes")?;

        input_dir_path
            .resolve(long_file)
            .create_with_contents("The End!")?;
        input_dir_path.resolve(long_dir).create_dir_all()?;
        input_dir_path
            .resolve(long_symlink)
            .symlink_to_file(long_file.as_str())?;

        let mut archive = CacheWriter::create(&tar_path)?;
        archive.add_file(input_dir_path, long_file)?;
        archive.add_file(input_dir_path, long_dir)?;
        archive.add_file(input_dir_path, long_symlink)?;
        archive.finish()?;

        let restore_dir = tempdir()?;
        let restore_dir_path = AbsoluteSystemPath::from_std_path(restore_dir.path())?;

        let mut restore = CacheReader::open(&tar_path)?;
        let files = restore.restore(restore_dir_path)?;
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].as_str(), long_file.as_str());
        assert_eq!(files[1].as_str(), long_dir.as_str());
        assert_eq!(files[2].as_str(), long_symlink.as_str());
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_mode_bits_round_trip() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let input_dir = tempdir()?;
        let input_dir_path = AbsoluteSystemPath::from_std_path(input_dir.path())?;
        let script = AnchoredSystemPathBuf::from_raw("run.sh")?;
        let script_path = input_dir_path.resolve(&script);
        script_path.create_with_contents("#!/bin/sh\n")?;
        script_path.set_mode(0o755)?;

        let tar_dir = tempdir()?;
        let tar_path = AbsoluteSystemPath::from_std_path(tar_dir.path())?.join_component("out.tar");
        let mut archive = CacheWriter::create(&tar_path)?;
        archive.add_file(input_dir_path, &script)?;
        archive.finish()?;

        let restore_dir = tempdir()?;
        let restore_dir_path = AbsoluteSystemPath::from_std_path(restore_dir.path())?;
        CacheReader::open(&tar_path)?.restore(restore_dir_path)?;

        let restored = restore_dir_path.resolve(&script);
        let mode = restored.metadata()?.permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        Ok(())
    }

    #[test]
    fn test_compression() -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = zstd::Encoder::new(&mut buffer, 0)?.auto_finish();
        encoder.write_all(b"hello world")?;
        // Encoding finishes on drop.
        drop(encoder);

        let mut decoder = zstd::Decoder::new(&buffer[..])?;
        let mut out = String::new();
        decoder.read_to_string(&mut out)?;

        assert_eq!(out, "hello world");

        Ok(())
    }

    #[test]
    fn test_temp_file_cleaned_up_without_finish() -> Result<()> {
        let archive_dir = tempdir()?;
        let archive_path =
            AbsoluteSystemPathBuf::try_from(archive_dir.path().join("test.tar.zst"))?;

        {
            let _writer = CacheWriter::create(&archive_path)?;
            // Dropped without finish().
        }

        let leftovers: Vec<_> = std::fs::read_dir(archive_dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");

        Ok(())
    }

    #[test]
    fn test_finish_renames_into_place() -> Result<()> {
        let archive_dir = tempdir()?;
        let archive_path =
            AbsoluteSystemPathBuf::try_from(archive_dir.path().join("test.tar.zst"))?;

        let input_dir = tempdir()?;
        let input_dir_path = AbsoluteSystemPathBuf::try_from(input_dir.path())?;
        input_dir_path
            .join_component("test.txt")
            .create_with_contents("test content")?;

        let mut writer = CacheWriter::create(&archive_path)?;
        writer.add_file(&input_dir_path, &AnchoredSystemPathBuf::from_raw("test.txt")?)?;
        writer.finish()?;

        assert!(archive_path.exists());

        let leftovers: Vec<_> = std::fs::read_dir(archive_dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");

        Ok(())
    }

    #[test]
    fn test_generated_temp_paths_are_unique() -> Result<()> {
        let archive_dir = tempdir()?;
        let base_path = AbsoluteSystemPathBuf::try_from(archive_dir.path().join("hash.tar.zst"))?;

        let paths: Vec<_> = (0..100).map(|_| generate_temp_path(&base_path)).collect();

        let unique_count = paths.iter().collect::<std::collections::HashSet<_>>().len();
        assert_eq!(unique_count, paths.len());

        Ok(())
    }
}
