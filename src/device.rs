//! Block devices.
//!
//! The core reads and writes fixed-size blocks through the [`BlockDevice`]
//! trait and never touches the medium any other way. Two implementations are
//! provided: [`MemDisk`] keeps the image in memory and backs the test suite,
//! [`FileDisk`] maps blocks onto a file or raw device node.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use spin::Mutex;

use crate::error::{Error, Result};
use crate::param::BSIZE;

/// A device exposing synchronous read/write of fixed-size blocks.
pub trait BlockDevice: Send + Sync {
    /// Reads block `bno` into `buf`.
    fn read_block(&self, bno: u32, buf: &mut [u8; BSIZE]) -> Result<()>;

    /// Writes `buf` to block `bno`.
    fn write_block(&self, bno: u32, buf: &[u8; BSIZE]) -> Result<()>;

    /// Device capacity in blocks.
    fn nblocks(&self) -> u32;

    /// The device's own addressing unit. The superblock loader recomputes
    /// the superblock position when this differs from [`BSIZE`].
    fn logical_block_size(&self) -> usize {
        BSIZE
    }
}

/// In-memory device image.
pub struct MemDisk {
    blocks: Mutex<Vec<u8>>,
}

impl MemDisk {
    /// Creates a zero-filled device of `nblocks` blocks.
    pub fn new(nblocks: u32) -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(vec![0; nblocks as usize * BSIZE]),
        })
    }

    fn check(&self, bno: u32) -> Result<usize> {
        let off = bno as usize * BSIZE;
        if off + BSIZE > self.blocks.lock().len() {
            return Err(Error::short_io("block beyond device end"));
        }
        Ok(off)
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, bno: u32, buf: &mut [u8; BSIZE]) -> Result<()> {
        let off = self.check(bno)?;
        buf.copy_from_slice(&self.blocks.lock()[off..off + BSIZE]);
        Ok(())
    }

    fn write_block(&self, bno: u32, buf: &[u8; BSIZE]) -> Result<()> {
        let off = self.check(bno)?;
        self.blocks.lock()[off..off + BSIZE].copy_from_slice(buf);
        Ok(())
    }

    fn nblocks(&self) -> u32 {
        (self.blocks.lock().len() / BSIZE) as u32
    }
}

/// File-backed device; works on both image files and device nodes.
pub struct FileDisk {
    file: File,
    nblocks: u32,
}

impl FileDisk {
    /// Opens `file` as a device. The size is fixed at open time; trailing
    /// bytes that do not fill a whole block are ignored.
    pub fn new(file: File) -> Result<Arc<Self>> {
        let len = file.metadata().map_err(Error::Io)?.len();
        Ok(Arc::new(Self {
            file,
            nblocks: (len / BSIZE as u64) as u32,
        }))
    }
}

impl BlockDevice for FileDisk {
    fn read_block(&self, bno: u32, buf: &mut [u8; BSIZE]) -> Result<()> {
        if bno >= self.nblocks {
            return Err(Error::short_io("block beyond device end"));
        }
        self.file
            .read_exact_at(buf, bno as u64 * BSIZE as u64)
            .map_err(Error::Io)
    }

    fn write_block(&self, bno: u32, buf: &[u8; BSIZE]) -> Result<()> {
        if bno >= self.nblocks {
            return Err(Error::short_io("block beyond device end"));
        }
        self.file
            .write_all_at(buf, bno as u64 * BSIZE as u64)
            .map_err(Error::Io)
    }

    fn nblocks(&self) -> u32 {
        self.nblocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memdisk_round_trip() {
        let disk = MemDisk::new(8);
        let mut block = [0u8; BSIZE];
        block[0] = 0xAB;
        block[BSIZE - 1] = 0xCD;
        disk.write_block(3, &block).unwrap();

        let mut read = [0u8; BSIZE];
        disk.read_block(3, &mut read).unwrap();
        assert_eq!(read[0], 0xAB);
        assert_eq!(read[BSIZE - 1], 0xCD);
    }

    #[test]
    fn memdisk_rejects_out_of_range() {
        let disk = MemDisk::new(4);
        let block = [0u8; BSIZE];
        assert!(matches!(disk.write_block(4, &block), Err(Error::Io(_))));
    }
}
