//! Block storage: a directory-addressed overlay store with rollback
//! support, and the disk-image handles peripherals mount.
//!
//! Writes never touch the backing image file. Each write lands as a
//! versioned `.dat` file in the overlay directory; reads consult the
//! newest version covering the block and fall back to the image. A
//! checkpoint mark opens a rollback generation capturing pre-images, so
//! the whole store can revert to its state at the mark.

mod image;
mod store;

pub use image::Image;
pub use store::{SnapshotKind, Storage, StorageConfig};

use std::fmt;
use std::io;

/// Errors surfaced by storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// The block address lies beyond the device.
    OutOfRange,
    /// An overlay file failed its integrity check.
    Corrupt(String),
    /// The provided buffer does not match the block size.
    InvalidBuffer,
    /// Filesystem I/O failed.
    Io(io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange => f.write_str("block out of range"),
            Self::Corrupt(what) => write!(f, "corrupt overlay file: {what}"),
            Self::InvalidBuffer => f.write_str("buffer does not match block size"),
            Self::Io(e) => write!(f, "storage I/O error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
