//! Error kinds surfaced by the storage engine.
//!
//! Every operation propagates errors to the caller unchanged; the core does
//! not retry I/O and does not roll back partial block-map allocations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Underlying device read/write failed or a buffer could not be obtained.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic mismatch, out-of-range field, or inconsistent directory entry.
    #[error("corrupted filesystem: {0}")]
    Corrupted(&'static str),

    /// Inode number 0 or below the root inode used as a live inode.
    #[error("invalid inode number {0}")]
    InvalidInode(u32),

    /// Inode record read with zero links or a nonzero deletion time.
    #[error("deleted inode referenced: {0}")]
    StaleInode(u32),

    /// Bitmap exhausted for a block, an extent run, or an inode.
    #[error("no space left on device")]
    NoSpace,

    /// Logical block index exceeds the addressable block map.
    #[error("file too large")]
    FileTooLarge,

    /// Directory lookup miss.
    #[error("no such entry")]
    NotFound,

    /// Name collision on directory append.
    #[error("entry already exists")]
    Exists,

    /// rmdir or rename-over-directory on a non-empty target.
    #[error("directory not empty")]
    NotEmpty,

    /// Name longer than a directory slot can hold.
    #[error("name too long")]
    NameTooLong,

    /// Unsupported flag or malformed argument.
    #[error("invalid argument")]
    InvalidArgument,
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Shorthand for the device short-read/short-write failure.
    pub(crate) fn short_io(what: &'static str) -> Self {
        Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, what))
    }
}
