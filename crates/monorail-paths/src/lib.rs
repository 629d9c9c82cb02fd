#![deny(clippy::all)]

//! Path types used throughout monorail.
//!
//! Every path that crosses a crate boundary is one of these types, so that
//! "absolute", "anchored" (relative to a repo root or another anchor), and
//! "unix" (forward slashes, as stored in artifacts) are distinct at the type
//! level and conversions between them are explicit.

mod absolute_system_path;
mod absolute_system_path_buf;
mod anchored_system_path;
mod anchored_system_path_buf;
mod relative_unix_path;

use std::io;

pub use absolute_system_path::AbsoluteSystemPath;
pub use absolute_system_path_buf::AbsoluteSystemPathBuf;
pub use anchored_system_path::AnchoredSystemPath;
pub use anchored_system_path_buf::AnchoredSystemPathBuf;
pub use relative_unix_path::{RelativeUnixPath, RelativeUnixPathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is non-UTF-8: {0}")]
    InvalidUnicode(String),
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("path is not relative: {0}")]
    NotRelative(String),
    #[error("path is malformed: {0}")]
    MalformedPath(String),
    #[error("Path is not safe for windows: {0}")]
    WindowsUnsafePath(String),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

impl PathError {
    pub fn invalid_unicode(path: impl std::fmt::Debug) -> Self {
        PathError::InvalidUnicode(format!("{path:?}"))
    }
}

/// The separator used inside artifacts, independent of the host platform.
pub const UNIX_SEPARATOR: char = '/';
