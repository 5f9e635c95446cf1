//! BitsFS: a small UNIX-style block filesystem.
//!
//! The engine is layered, leaves first:
//!   + Device: fixed-size block read/write behind [`device::BlockDevice`].
//!   + Buffers: cached block buffers with per-block locking.
//!   + Superblock and bitmaps: free-space accounting.
//!   + Inodes: the fixed table, the 16-slot hybrid block map, file data.
//!   + Directories: fixed 64-byte entry slots inside page-sized chunks.
//!   + Operations: create, link, unlink, mkdir, rmdir, rename, lookup.
//!
//! The host VFS, page cache, and formatting CLI live outside this crate;
//! [`fs::BitsFs`] is what they drive.

mod bio;
pub mod device;
pub mod error;
pub mod fs;
pub mod mkfs;
pub mod param;

pub use device::{BlockDevice, FileDisk, MemDisk};
pub use error::{Error, Result};
pub use fs::dir::DirEntry;
pub use fs::inode::{Inode, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
pub use fs::{BitsFs, MountOptions, RenameFlags};
