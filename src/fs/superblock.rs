//! Superblock.
//!
//! Block 1 of the device holds the superblock: a 1 KiB record at the head of
//! the block describing the fixed layout, followed by reserved padding. The
//! in-memory [`SbInfo`] carries the parsed record plus the free-space
//! counters, which are authoritative in memory and written back on unmount.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use crate::bio::Bcache;
use crate::error::{Error, Result};
use crate::param::*;

/// Superblock record as laid out on disk. All integers little-endian.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct RawSuperblock {
    /// Inodes count.
    pub inodes_count: u32,
    /// Blocks count.
    pub blocks_count: u32,
    /// Free inodes count.
    pub free_inodes_count: u32,
    /// Free blocks count.
    pub free_blocks_count: u32,
    /// Block bitmap start block.
    pub block_bitmap_block: u32,
    /// Inode bitmap block.
    pub inode_bitmap_block: u32,
    /// Inode table start block.
    pub inode_table_block: u32,
    /// First data block.
    pub data_block: u32,
    /// Block size.
    pub block_size: u32,
    /// First usable inode number.
    pub first_ino: u32,
    /// Size of an inode record.
    pub inode_size: u32,
    /// Mount time.
    pub mtime: u32,
    /// Write time.
    pub wtime: u32,
    /// Magic number.
    pub magic: u16,
    /// Filesystem state.
    pub state: u16,
    /// Creator OS.
    pub creator_os: u32,
    /// Filesystem name.
    pub name: [u8; 8],
    /// Padding to 1 KiB.
    pub reserved: [u32; 239],
}

const_assert_eq!(core::mem::size_of::<RawSuperblock>(), 1024);

/// Parsed superblock plus the in-memory counters it owns.
pub struct SbInfo {
    raw: RawSuperblock,
    /// Mount-time filesystem state, checked against `FS_STATE_*`.
    pub mount_state: u16,
    /// Free data blocks.
    pub free_blocks: i64,
    /// Free inodes.
    pub free_inodes: i64,
    /// Live directories.
    pub dirs: i64,
}

impl SbInfo {
    /// Reads and validates the superblock.
    ///
    /// Devices whose logical block size differs from [`BSIZE`] shift the
    /// device-level address of the superblock but never its byte offset.
    pub fn load(bcache: &Bcache, logical_block_size: usize) -> Result<Self> {
        let sb_byte =
            (SUPER_BLOCK as usize * BSIZE / logical_block_size) * logical_block_size;
        let (blockno, offset) = ((sb_byte / BSIZE) as u32, sb_byte % BSIZE);

        let buf = bcache.read(blockno)?;
        let (raw, _) = LayoutVerified::<_, RawSuperblock>::new_from_prefix(
            &buf.data()[offset..],
        )
        .ok_or(Error::Corrupted("superblock record does not fit its block"))?;
        let raw: RawSuperblock = *raw;

        if u16::from_le(raw.magic) != SUPER_MAGIC {
            return Err(Error::Corrupted("bad superblock magic"));
        }
        if u32::from_le(raw.block_size) as usize != BSIZE {
            return Err(Error::Corrupted("unsupported block size"));
        }

        Ok(Self {
            mount_state: u16::from_le(raw.state),
            free_blocks: u32::from_le(raw.free_blocks_count) as i64,
            free_inodes: u32::from_le(raw.free_inodes_count) as i64,
            dirs: 0,
            raw,
        })
    }

    /// Writes the superblock back to its block, folding the in-memory
    /// counters and the write time into the record.
    pub fn store(&mut self, bcache: &Bcache, now: u32) -> Result<()> {
        self.raw.free_blocks_count = (self.free_blocks.max(0) as u32).to_le();
        self.raw.free_inodes_count = (self.free_inodes.max(0) as u32).to_le();
        self.raw.state = self.mount_state.to_le();
        self.raw.wtime = now.to_le();

        let mut buf = bcache.read(SUPER_BLOCK)?;
        buf.data_mut()[..core::mem::size_of::<RawSuperblock>()]
            .copy_from_slice(self.raw.as_bytes());
        Ok(())
    }

    /// Stamps the mount time.
    pub fn set_mount_time(&mut self, now: u32) {
        self.raw.mtime = now.to_le();
    }

    pub fn inodes_count(&self) -> u32 {
        u32::from_le(self.raw.inodes_count)
    }

    pub fn blocks_count(&self) -> u32 {
        u32::from_le(self.raw.blocks_count)
    }

    pub fn first_ino(&self) -> u32 {
        u32::from_le(self.raw.first_ino)
    }

    pub fn inode_size(&self) -> usize {
        u32::from_le(self.raw.inode_size) as usize
    }

    /// Data blocks tracked by the block bitmap.
    pub fn data_blocks(&self) -> u32 {
        self.blocks_count().saturating_sub(DATA_BLOCK)
    }

    /// Locates the inode-table record of inode `ino`: `(block, byte offset)`.
    pub fn inode_location(&self, ino: u32) -> (u32, usize) {
        let index = (ino - 1) as usize * self.inode_size();
        (
            INODE_TABLE_BLOCK + (index / BSIZE) as u32,
            index % BSIZE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::Bcache;
    use crate::device::MemDisk;
    use crate::mkfs;

    #[test]
    fn load_rejects_bad_magic() {
        let disk = MemDisk::new(64);
        let bcache = Bcache::new(disk);
        assert!(matches!(
            SbInfo::load(&bcache, BSIZE),
            Err(Error::Corrupted(_))
        ));
    }

    #[test]
    fn load_parses_formatted_image() {
        let disk = MemDisk::new(256);
        mkfs::format(disk.as_ref()).unwrap();

        let bcache = Bcache::new(disk);
        let sb = SbInfo::load(&bcache, BSIZE).unwrap();
        assert_eq!(sb.blocks_count(), 256);
        assert_eq!(sb.inodes_count(), 4096);
        assert_eq!(sb.first_ino(), ROOT_INO);
        assert_eq!(sb.inode_size(), INODE_SIZE);
        assert_eq!(sb.free_inodes, 4095);
        assert_eq!(sb.free_blocks, (256 - 135 - 1) as i64);
        assert_eq!(sb.mount_state, FS_STATE_CLEAN);
    }

    #[test]
    fn inode_location_is_contiguous_128_byte_records() {
        let disk = MemDisk::new(256);
        mkfs::format(disk.as_ref()).unwrap();
        let bcache = Bcache::new(disk);
        let sb = SbInfo::load(&bcache, BSIZE).unwrap();

        assert_eq!(sb.inode_location(1), (INODE_TABLE_BLOCK, 0));
        assert_eq!(sb.inode_location(2), (INODE_TABLE_BLOCK, 128));
        // 32 records per block.
        assert_eq!(sb.inode_location(33), (INODE_TABLE_BLOCK + 1, 0));
    }

    #[test]
    fn store_round_trips_counters() {
        let disk = MemDisk::new(256);
        mkfs::format(disk.as_ref()).unwrap();
        let bcache = Bcache::new(disk);

        let mut sb = SbInfo::load(&bcache, BSIZE).unwrap();
        sb.free_blocks -= 3;
        sb.free_inodes -= 1;
        sb.store(&bcache, 1234).unwrap();
        drop(sb);

        let sb = SbInfo::load(&bcache, BSIZE).unwrap();
        assert_eq!(sb.free_blocks, (256 - 135 - 1 - 3) as i64);
        assert_eq!(sb.free_inodes, 4094);
    }
}
