use std::{collections::HashMap, io::Read};

use monorail_paths::{AbsoluteSystemPath, PathError, RelativeUnixPathBuf};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::FileHashes;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error while hashing: {0}")]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Hashes a byte slice the way git hashes a blob object:
/// `sha1("blob " + decimal_size + "\0" + contents)`, lowercase hex.
///
/// Using git's scheme means a file's content hash agrees with the hash git
/// reports for a clean checkout, so index-based and manual hashing can be
/// mixed freely.
pub fn git_blob_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(b"blob ");
    hasher.update(bytes.len().to_string().as_bytes());
    hasher.update([b'\0']);
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streaming variant of [`git_blob_hash`] for files already on disk.
pub fn git_blob_hash_file(path: &AbsoluteSystemPath) -> Result<String, Error> {
    let metadata = path.metadata()?;
    let mut hasher = Sha1::new();
    hasher.update(b"blob ");
    hasher.update(metadata.len().to_string().as_bytes());
    hasher.update([b'\0']);

    let mut file = path.open()?;
    let mut buffer = [0; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hashes the given anchor-relative files into the path → content hash map
/// that feeds a task fingerprint.
pub fn hash_files(
    anchor: &AbsoluteSystemPath,
    files: impl IntoIterator<Item = RelativeUnixPathBuf>,
) -> Result<FileHashes, Error> {
    let mut hashes = HashMap::new();
    for file in files {
        let system_path = file.to_system_path();
        let hash = git_blob_hash_file(&anchor.resolve(&system_path))?;
        hashes.insert(file, hash);
    }

    Ok(FileHashes(hashes))
}
